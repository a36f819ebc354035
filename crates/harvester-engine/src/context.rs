//! State shared by every engine thread.

use std::sync::Arc;

use harvester_state::StateBackend;

use crate::bins::BinFairnessTracker;
use crate::config::EngineSettings;
use crate::registry::{ConnectorRegistry, PoolRegistry};
use crate::throttle::ThrottleManager;

/// Built once per engine and handed to workers and coordinators by `Arc`.
pub struct EngineContext {
    pub store: Arc<dyn StateBackend>,
    pub pools: Arc<PoolRegistry>,
    pub throttles: ThrottleManager,
    pub bins: BinFairnessTracker,
    pub settings: EngineSettings,
}

impl EngineContext {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateBackend>,
        registry: &ConnectorRegistry,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pools: Arc::new(PoolRegistry::new(
                registry,
                Arc::clone(&store),
                settings.idle_timeout(),
            )),
            throttles: ThrottleManager::new(),
            bins: BinFairnessTracker::new(Arc::clone(&store)),
            store,
            settings,
        }
    }
}
