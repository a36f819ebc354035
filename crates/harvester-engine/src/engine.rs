//! Engine assembly: open the store, build shared state, run the threads.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};

use harvester_state::{SqliteStateBackend, StateBackend};
use harvester_types::connection::{Connection, ConnectionKind};
use harvester_types::error::{ConnectorError, ValidationResult};
use harvester_types::state::ConnectionName;

use crate::cancel::CancellationToken;
use crate::config::types::DEFAULT_SQLITE_PATH;
use crate::config::{validate_config, EngineConfig, EngineSettings, StateConfig};
use crate::context::EngineContext;
use crate::deletion::DeletionCoordinator;
use crate::janitor::IdlePoolJanitor;
use crate::jobs::{JobCoordinator, JobManager};
use crate::notification::NotificationCoordinator;
use crate::pool::PoolError;
use crate::registry::ConnectorRegistry;
use crate::seeding::SeedingCoordinator;
use crate::worker::Worker;

/// Open the configured state backend.
///
/// # Errors
///
/// Fails if the store cannot be opened, or if `postgres` is requested in a
/// build without the `postgres` feature.
pub fn open_store(config: &StateConfig) -> Result<Arc<dyn StateBackend>> {
    match config.backend.as_str() {
        "sqlite" => {
            let path = config.connection.as_deref().unwrap_or(DEFAULT_SQLITE_PATH);
            let store = SqliteStateBackend::open(Path::new(path))
                .with_context(|| format!("Failed to open SQLite state at {path}"))?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let connstr = config
                .connection
                .as_deref()
                .context("State backend 'postgres' requires a connection string")?;
            let store = harvester_state::PostgresStateBackend::open(connstr)
                .context("Failed to connect to PostgreSQL state backend")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        "postgres" => bail!("This build does not include the 'postgres' state backend"),
        other => bail!("Unsupported state backend '{other}'"),
    }
}

/// Result of `check()` for one stored connection.
#[derive(Debug)]
pub struct ConnectionCheck {
    pub connection: ConnectionName,
    pub kind: ConnectionKind,
    pub result: Result<ValidationResult, String>,
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    jobs: JobManager,
}

impl Engine {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateBackend>,
        registry: &ConnectorRegistry,
        settings: EngineSettings,
    ) -> Self {
        let ctx = Arc::new(EngineContext::new(store, registry, settings));
        let jobs = JobManager::new(Arc::clone(&ctx.store)).with_pools(Arc::clone(&ctx.pools));
        Self { ctx, jobs }
    }

    /// Validate `config`, open its store, and save its connections and jobs.
    ///
    /// # Errors
    ///
    /// Validation failures, store failures, or connectors missing from
    /// `registry`.
    pub fn from_config(config: &EngineConfig, registry: &ConnectorRegistry) -> Result<Self> {
        validate_config(config)?;
        let missing: Vec<String> = config
            .connections
            .iter()
            .filter(|c| !registry.is_installed(c.kind, &c.connector))
            .map(|c| format!("connection '{}': no {} connector '{}'", c.name, c.kind, c.connector))
            .collect();
        if !missing.is_empty() {
            bail!("Connector(s) not installed:\n  - {}", missing.join("\n  - "));
        }

        let store = open_store(&config.state)?;
        let engine = Self::new(store, registry, config.engine.clone());
        engine.jobs.bootstrap(&config.connections, &config.jobs)?;
        Ok(engine)
    }

    #[must_use]
    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateBackend> {
        &self.ctx.store
    }

    /// Return documents left `Active` by an earlier process to `Pending`.
    /// Returns how many were recovered.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn recover(&self) -> Result<u64> {
        let recovered = self.ctx.store.reset_active_documents()?;
        self.ctx.bins.reset();
        if recovered > 0 {
            tracing::info!(recovered, "Recovered documents from interrupted run");
        }
        Ok(recovered)
    }

    /// Connect to every stored connection and run its `check()`.
    ///
    /// # Errors
    ///
    /// Store failures while listing connections.
    pub fn check_connections(&self) -> Result<Vec<ConnectionCheck>> {
        let cancel = CancellationToken::new();
        let checks = self
            .ctx
            .store
            .list_connections()?
            .into_iter()
            .map(|connection| {
                let result = self.check_connection(&connection, &cancel);
                ConnectionCheck {
                    connection: connection.name,
                    kind: connection.kind,
                    result,
                }
            })
            .collect();
        Ok(checks)
    }

    fn check_connection(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, String> {
        let pools = &self.ctx.pools;
        let checked: Result<Result<ValidationResult, ConnectorError>, PoolError> =
            match connection.kind {
                ConnectionKind::Repository => pools
                    .repositories
                    .grab(&connection.name, cancel)
                    .map(|mut c| c.check()),
                ConnectionKind::Transformation => pools
                    .transformations
                    .grab(&connection.name, cancel)
                    .map(|mut c| c.check()),
                ConnectionKind::Output => pools
                    .outputs
                    .grab(&connection.name, cancel)
                    .map(|mut c| c.check()),
            };
        match checked {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Recover interrupted work and start every engine thread.
    ///
    /// # Errors
    ///
    /// Recovery failures, or a thread that cannot be spawned.
    pub fn start(&self) -> Result<EngineHandle> {
        self.recover()?;
        let mut handle = EngineHandle {
            cancel: CancellationToken::new(),
            threads: Vec::new(),
            failure: Arc::new(Mutex::new(None)),
            ctx: Arc::clone(&self.ctx),
        };

        for index in 0..self.ctx.settings.workers {
            let worker = Worker::new(Arc::clone(&self.ctx), index);
            handle.spawn(format!("harvester-worker-{index}"), move |cancel| {
                worker.run(cancel)
            })?;
        }
        let seeding = SeedingCoordinator::new(Arc::clone(&self.ctx));
        handle.spawn("harvester-seeding".into(), move |cancel| seeding.run(cancel))?;
        let jobs = JobCoordinator::new(Arc::clone(&self.ctx));
        handle.spawn("harvester-jobs".into(), move |cancel| jobs.run(cancel))?;
        let deletion = DeletionCoordinator::new(Arc::clone(&self.ctx));
        handle.spawn("harvester-deletion".into(), move |cancel| deletion.run(cancel))?;
        let mut notification = NotificationCoordinator::new(Arc::clone(&self.ctx));
        handle.spawn("harvester-notification".into(), move |cancel| {
            notification.run(cancel)
        })?;
        let janitor = IdlePoolJanitor::new(Arc::clone(&self.ctx));
        handle.spawn("harvester-janitor".into(), move |cancel| janitor.run(cancel))?;

        tracing::info!(
            workers = self.ctx.settings.workers,
            threads = handle.threads.len(),
            "Engine started"
        );
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// Running engine threads. A thread that fails cancels all the others.
pub struct EngineHandle {
    cancel: CancellationToken,
    threads: Vec<(String, JoinHandle<Result<()>>)>,
    failure: Arc<Mutex<Option<String>>>,
    ctx: Arc<EngineContext>,
}

impl EngineHandle {
    fn spawn<F>(&mut self, name: String, body: F) -> Result<()>
    where
        F: FnOnce(&CancellationToken) -> Result<()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let failure = Arc::clone(&self.failure);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let result = body(&cancel);
                if let Err(e) = &result {
                    tracing::error!(thread = %thread_name, error = %e, "Engine thread failed, shutting down");
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert_with(|| format!("{thread_name}: {e:#}"));
                    }
                    cancel.cancel();
                }
                result
            })
            .with_context(|| format!("Failed to spawn thread {name}"))?;
        self.threads.push((name, handle));
        Ok(())
    }

    /// The first fatal error reported by any thread.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|slot| slot.clone())
    }

    /// Whether shutdown has begun, by request or after a failure.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every thread, wait for them, and close every pool.
    ///
    /// # Errors
    ///
    /// The first fatal error any thread reported, or a panicked thread.
    pub fn shutdown(self) -> Result<()> {
        tracing::info!("Engine shutting down");
        self.cancel.cancel();
        let mut panicked = Vec::new();
        for (name, handle) in self.threads {
            if handle.join().is_err() {
                panicked.push(name);
            }
        }
        self.ctx.pools.close_all();

        if let Some(failure) = self.failure.lock().ok().and_then(|slot| slot.clone()) {
            bail!("Engine stopped after a fatal error: {failure}");
        }
        if !panicked.is_empty() {
            bail!("Engine thread(s) panicked: {}", panicked.join(", "));
        }
        tracing::info!("Engine stopped");
        Ok(())
    }
}
