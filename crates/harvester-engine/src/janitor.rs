//! Periodic housekeeping for connector pools and throttle state.

use std::sync::Arc;

use anyhow::Result;

use crate::cancel::CancellationToken;
use crate::context::EngineContext;
use crate::errors::ProcessError;

pub struct IdlePoolJanitor {
    ctx: Arc<EngineContext>,
}

impl IdlePoolJanitor {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run every `janitor_interval` until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Only an unrecoverable configuration failure; everything else is
    /// logged.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.sleep(self.ctx.settings.janitor_interval()) {
            match self.run_once() {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => tracing::warn!(error = %e, "Idle pool poll failed"),
            }
        }
        Ok(())
    }

    /// Poll idle connectors in every pool and drop unused throttle bins.
    /// Returns how many throttle bins were freed.
    ///
    /// # Errors
    ///
    /// The classified pool failure.
    pub fn run_once(&self) -> Result<usize, ProcessError> {
        self.ctx.pools.poll_idle()?;
        let freed = self.ctx.throttles.free_unused();
        if freed > 0 {
            tracing::debug!(freed, "Freed idle throttle bins");
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use harvester_sdk::prelude::*;
    use harvester_state::{SqliteStateBackend, StateBackend};
    use harvester_types::connection::{Connection, ConnectionKind, ThrottleBinDescription};

    use crate::config::EngineSettings;
    use crate::registry::ConnectorRegistry;

    #[derive(Default)]
    struct Counters {
        polls: AtomicUsize,
        disconnects: AtomicUsize,
    }

    struct Sink(Arc<Counters>);

    impl Connector for Sink {
        fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), ConnectorError> {
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn poll(&mut self) -> Result<(), ConnectorError> {
            self.0.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl OutputConnector for Sink {
        fn add_or_replace_document(
            &mut self,
            _uri: &str,
            _version: &str,
            _document: &RepositoryDocument,
            _spec: &Specification,
            _activity: &dyn ActivityCallback,
        ) -> Result<IngestResult, ConnectorError> {
            Ok(IngestResult::Accepted)
        }

        fn remove_document(
            &mut self,
            _uri: &str,
            _version: Option<&str>,
            _activity: &dyn ActivityCallback,
        ) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn context(idle_timeout_secs: u64) -> (Arc<EngineContext>, Arc<Counters>) {
        let store = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let counters = Arc::new(Counters::default());
        let mut registry = ConnectorRegistry::new();
        let c = Arc::clone(&counters);
        registry.register_output("sink", move || Box::new(Sink(Arc::clone(&c))));
        for name in ["a", "b"] {
            let connection =
                Connection::new(name, ConnectionKind::Output, "sink").with_max_pool_size(2);
            store.save_connection(&connection).unwrap();
        }
        let settings = EngineSettings {
            idle_timeout_secs,
            ..EngineSettings::default()
        };
        (Arc::new(EngineContext::new(store, &registry, settings)), counters)
    }

    #[test]
    fn polls_idle_instances_and_leaves_leases_alone() {
        let (ctx, counters) = context(60);
        let cancel = CancellationToken::new();
        let held = ctx.pools.outputs.grab(&"a".into(), &cancel).unwrap();
        drop(ctx.pools.outputs.grab(&"b".into(), &cancel).unwrap());

        IdlePoolJanitor::new(Arc::clone(&ctx)).run_once().unwrap();
        assert_eq!(counters.polls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.pools.outstanding(&"a".into()), 1);
        drop(held);
    }

    #[test]
    fn expired_instances_are_disconnected() {
        let (ctx, counters) = context(0);
        let cancel = CancellationToken::new();
        let held = ctx.pools.outputs.grab(&"a".into(), &cancel).unwrap();
        drop(ctx.pools.outputs.grab(&"b".into(), &cancel).unwrap());

        IdlePoolJanitor::new(Arc::clone(&ctx)).run_once().unwrap();
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.polls.load(Ordering::SeqCst), 0);
        drop(held);
    }

    #[test]
    fn frees_only_unused_throttle_bins() {
        let (ctx, _) = context(60);
        let cancel = CancellationToken::new();
        let mut busy = ThrottleBinDescription::new("^/busy/");
        busy.max_open_connections = Some(1);
        let mut done = ThrottleBinDescription::new("^/done/");
        done.max_open_connections = Some(1);

        let held = ctx.throttles.acquire("files", "/busy/x", &[busy], &cancel).unwrap();
        ctx.throttles
            .acquire("files", "/done/y", &[done], &cancel)
            .unwrap()
            .finish(10);
        assert_eq!(ctx.throttles.active_bins(), 2);

        let janitor = IdlePoolJanitor::new(Arc::clone(&ctx));
        assert_eq!(janitor.run_once().unwrap(), 1);
        assert_eq!(ctx.throttles.active_bins(), 1);

        drop(held);
        assert_eq!(janitor.run_once().unwrap(), 1);
        assert_eq!(ctx.throttles.active_bins(), 0);
    }
}
