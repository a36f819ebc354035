//! Connector factories by kind, and the pools built from them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use harvester_sdk::connector::{OutputConnector, RepositoryConnector, TransformationConnector};
use harvester_sdk::process::{ProcessConnector, PROCESS_CONNECTOR_KIND};
use harvester_state::StateBackend;
use harvester_types::connection::{Connection, ConnectionKind};
use harvester_types::state::ConnectionName;

use crate::cancel::CancellationToken;
use crate::pool::{ConnectorFactory, ConnectorPool, PoolError, PooledConnector};

pub type RepositoryFactory = ConnectorFactory<dyn RepositoryConnector>;
pub type TransformationFactory = ConnectorFactory<dyn TransformationConnector>;
pub type OutputFactory = ConnectorFactory<dyn OutputConnector>;

/// Maps connector kind identifiers to factories, per connection kind.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    repositories: HashMap<String, RepositoryFactory>,
    transformations: HashMap<String, TransformationFactory>,
    outputs: HashMap<String, OutputFactory>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the out-of-process bridge installed for every kind.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_repository(PROCESS_CONNECTOR_KIND, || Box::new(ProcessConnector::new()));
        registry.register_transformation(PROCESS_CONNECTOR_KIND, || {
            Box::new(ProcessConnector::new())
        });
        registry.register_output(PROCESS_CONNECTOR_KIND, || Box::new(ProcessConnector::new()));
        registry
    }

    pub fn register_repository<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn RepositoryConnector> + Send + Sync + 'static,
    {
        self.repositories.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_transformation<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn TransformationConnector> + Send + Sync + 'static,
    {
        self.transformations.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_output<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn OutputConnector> + Send + Sync + 'static,
    {
        self.outputs.insert(kind.into(), Arc::new(factory));
    }

    #[must_use]
    pub fn is_installed(&self, kind: ConnectionKind, connector: &str) -> bool {
        match kind {
            ConnectionKind::Repository => self.repositories.contains_key(connector),
            ConnectionKind::Transformation => self.transformations.contains_key(connector),
            ConnectionKind::Output => self.outputs.contains_key(connector),
        }
    }

    /// Installed connector kinds for one connection kind, sorted.
    #[must_use]
    pub fn kinds(&self, kind: ConnectionKind) -> Vec<String> {
        let keys: BTreeSet<&String> = match kind {
            ConnectionKind::Repository => self.repositories.keys().collect(),
            ConnectionKind::Transformation => self.transformations.keys().collect(),
            ConnectionKind::Output => self.outputs.keys().collect(),
        };
        keys.into_iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// PoolRegistry
// ---------------------------------------------------------------------------

/// Connectors checked out for one document's pipeline.
pub struct PipelineLease {
    pub repository: PooledConnector<dyn RepositoryConnector>,
    pub transformations: HashMap<ConnectionName, PooledConnector<dyn TransformationConnector>>,
    pub outputs: HashMap<ConnectionName, PooledConnector<dyn OutputConnector>>,
}

/// One pool per connection kind, built once at startup.
pub struct PoolRegistry {
    pub repositories: ConnectorPool<dyn RepositoryConnector>,
    pub transformations: ConnectorPool<dyn TransformationConnector>,
    pub outputs: ConnectorPool<dyn OutputConnector>,
}

fn ordering_key(kind: ConnectionKind, name: &ConnectionName) -> String {
    format!("{}:{name}", kind.rank())
}

fn distinct(names: &[ConnectionName]) -> Vec<ConnectionName> {
    let set: BTreeSet<&ConnectionName> = names.iter().collect();
    set.into_iter().cloned().collect()
}

impl PoolRegistry {
    #[must_use]
    pub fn new(
        registry: &ConnectorRegistry,
        store: Arc<dyn StateBackend>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            repositories: ConnectorPool::new(
                ConnectionKind::Repository,
                Arc::clone(&store),
                registry.repositories.clone(),
                idle_timeout,
            ),
            transformations: ConnectorPool::new(
                ConnectionKind::Transformation,
                Arc::clone(&store),
                registry.transformations.clone(),
                idle_timeout,
            ),
            outputs: ConnectorPool::new(
                ConnectionKind::Output,
                store,
                registry.outputs.clone(),
                idle_timeout,
            ),
        }
    }

    /// Grab a document's source, transformation, and output connectors in
    /// the global order: repository, then transformations by name, then
    /// outputs by name. Repeated names share one instance.
    ///
    /// # Errors
    ///
    /// Any [`PoolError`]; everything already grabbed is released.
    pub fn grab_pipeline(
        &self,
        source: &ConnectionName,
        transformations: &[ConnectionName],
        outputs: &[ConnectionName],
        cancel: &CancellationToken,
    ) -> Result<PipelineLease, PoolError> {
        let repository = self.repositories.grab(source, cancel)?;

        let names = distinct(transformations);
        let requests: Vec<(String, ConnectionName)> = names
            .iter()
            .map(|n| (ordering_key(ConnectionKind::Transformation, n), n.clone()))
            .collect();
        let transformation_leases = self.transformations.grab_multiple(&requests, cancel)?;

        let outputs = self.grab_outputs(outputs, cancel)?;

        Ok(PipelineLease {
            repository,
            transformations: transformation_leases
                .into_iter()
                .map(|lease| (lease.connection().clone(), lease))
                .collect(),
            outputs,
        })
    }

    /// Grab output connectors only, in name order.
    ///
    /// # Errors
    ///
    /// Any [`PoolError`]; everything already grabbed is released.
    pub fn grab_outputs(
        &self,
        outputs: &[ConnectionName],
        cancel: &CancellationToken,
    ) -> Result<HashMap<ConnectionName, PooledConnector<dyn OutputConnector>>, PoolError> {
        let names = distinct(outputs);
        let requests: Vec<(String, ConnectionName)> = names
            .iter()
            .map(|n| (ordering_key(ConnectionKind::Output, n), n.clone()))
            .collect();
        Ok(self
            .outputs
            .grab_multiple(&requests, cancel)?
            .into_iter()
            .map(|lease| (lease.connection().clone(), lease))
            .collect())
    }

    /// Save `connection` through `save`, refusing a changed connector or
    /// config while instances of it are checked out. Pools are locked in
    /// kind order.
    ///
    /// # Errors
    ///
    /// `ConnectionInUse`, or whatever `save` returns.
    pub fn reconfigure<T>(
        &self,
        connection: &Connection,
        save: impl FnOnce() -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        self.repositories.reconfigure(connection, || {
            self.transformations
                .reconfigure(connection, || self.outputs.reconfigure(connection, save))
        })
    }

    /// Checked-out instances for `name` across every kind.
    #[must_use]
    pub fn outstanding(&self, name: &ConnectionName) -> usize {
        self.repositories.outstanding(name)
            + self.transformations.outstanding(name)
            + self.outputs.outstanding(name)
    }

    /// # Errors
    ///
    /// The first pool failure; later pools are still polled.
    pub fn poll_idle(&self) -> Result<(), PoolError> {
        let results = [
            self.repositories.poll_idle(),
            self.transformations.poll_idle(),
            self.outputs.poll_idle(),
        ];
        results.into_iter().collect()
    }

    /// # Errors
    ///
    /// The first pool failure.
    pub fn flush_unused(&self) -> Result<(), PoolError> {
        self.repositories.flush_unused()?;
        self.transformations.flush_unused()?;
        self.outputs.flush_unused()
    }

    pub fn close_all(&self) {
        self.repositories.close_all();
        self.transformations.close_all();
        self.outputs.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_install_process_for_every_kind() {
        let registry = ConnectorRegistry::with_builtins();
        for kind in [
            ConnectionKind::Repository,
            ConnectionKind::Transformation,
            ConnectionKind::Output,
        ] {
            assert!(registry.is_installed(kind, PROCESS_CONNECTOR_KIND));
            assert_eq!(registry.kinds(kind), [PROCESS_CONNECTOR_KIND]);
        }
        assert!(!registry.is_installed(ConnectionKind::Output, "solr"));
    }

    #[test]
    fn ordering_keys_rank_kinds_first() {
        let repo = ordering_key(ConnectionKind::Repository, &"zzz".into());
        let out = ordering_key(ConnectionKind::Output, &"aaa".into());
        assert!(repo < out);
    }

    #[test]
    fn distinct_sorts_and_dedupes() {
        let names: Vec<ConnectionName> = vec!["b".into(), "a".into(), "b".into()];
        assert_eq!(distinct(&names), [ConnectionName::new("a"), ConnectionName::new("b")]);
    }
}
