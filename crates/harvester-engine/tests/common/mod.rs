//! In-memory connectors and a single-threaded driver for engine tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use harvester_engine::config::EngineSettings;
use harvester_engine::deletion::DeletionCoordinator;
use harvester_engine::jobs::JobCoordinator;
use harvester_engine::notification::NotificationCoordinator;
use harvester_engine::seeding::SeedingCoordinator;
use harvester_engine::worker::Worker;
use harvester_engine::{CancellationToken, ConnectorRegistry, Engine};
use harvester_sdk::prelude::*;
use harvester_state::{SqliteStateBackend, StateBackend};
use harvester_types::connection::{Connection, ConnectionKind};
use harvester_types::job::{JobDescription, PipelineStage};
use harvester_types::state::JobStatus;

/// identifier -> (version, content)
pub type Corpus = Arc<Mutex<BTreeMap<String, (String, Vec<u8>)>>>;
pub type Log = Arc<Mutex<Vec<String>>>;

pub struct MemoryRepository {
    corpus: Corpus,
}

impl Connector for MemoryRepository {
    fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
        Ok(())
    }
}

impl RepositoryConnector for MemoryRepository {
    fn enumerate_seeds(
        &mut self,
        activity: &dyn SeedingActivity,
        _spec: &Specification,
        _since: Option<DateTime<Utc>>,
    ) -> Result<(), ConnectorError> {
        let ids: Vec<String> = self.corpus.lock().unwrap().keys().cloned().collect();
        for id in ids {
            activity.add_seed(id)?;
        }
        Ok(())
    }

    fn document_version(
        &mut self,
        identifier: &str,
        _spec: &Specification,
        _activity: &dyn ActivityCallback,
    ) -> Result<Option<String>, ConnectorError> {
        Ok(self
            .corpus
            .lock()
            .unwrap()
            .get(identifier)
            .map(|(version, _)| version.clone()))
    }

    fn fetch_document(
        &mut self,
        identifier: &str,
        _version: &str,
        _spec: &Specification,
        _activity: &dyn ActivityCallback,
    ) -> Result<FetchOutcome, ConnectorError> {
        let content = self
            .corpus
            .lock()
            .unwrap()
            .get(identifier)
            .map(|(_, content)| content.clone());
        match content {
            Some(content) => Ok(FetchOutcome::Fetched {
                uri: format!("mem://{identifier}"),
                document: RepositoryDocument::new(content).with_mime_type("text/plain"),
            }),
            None => Ok(FetchOutcome::Excluded),
        }
    }
}

/// Output that logs every call as `add <uri> <version>`, `remove <uri>`, or
/// `complete`.
pub struct RecordingOutput {
    log: Log,
}

impl Connector for RecordingOutput {
    fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
        Ok(())
    }
}

impl OutputConnector for RecordingOutput {
    fn add_or_replace_document(
        &mut self,
        uri: &str,
        version: &str,
        _document: &RepositoryDocument,
        _spec: &Specification,
        _activity: &dyn ActivityCallback,
    ) -> Result<IngestResult, ConnectorError> {
        self.log.lock().unwrap().push(format!("add {uri} {version}"));
        Ok(IngestResult::Accepted)
    }

    fn remove_document(
        &mut self,
        uri: &str,
        _version: Option<&str>,
        _activity: &dyn ActivityCallback,
    ) -> Result<(), ConnectorError> {
        self.log.lock().unwrap().push(format!("remove {uri}"));
        Ok(())
    }

    fn note_job_complete(&mut self, _activity: &dyn ActivityCallback) -> Result<(), ConnectorError> {
        self.log.lock().unwrap().push("complete".into());
        Ok(())
    }
}

/// Output whose end-of-job notification always fails with a configuration
/// error.
pub struct MisconfiguredOutput;

impl Connector for MisconfiguredOutput {
    fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
        Ok(())
    }
}

impl OutputConnector for MisconfiguredOutput {
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

    fn note_job_complete(&mut self, _activity: &dyn ActivityCallback) -> Result<(), ConnectorError> {
        Err(ConnectorError::config("BAD_ENDPOINT", "endpoint rejected credentials"))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<dyn StateBackend>,
    pub corpus: Corpus,
    pub log: Log,
    pub registry: ConnectorRegistry,
}

pub const JOB: &str = "crawl";

pub fn harness(settings: EngineSettings) -> Harness {
    let store: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
    harness_on(store, settings)
}

pub fn harness_on(store: Arc<dyn StateBackend>, settings: EngineSettings) -> Harness {
    let corpus: Corpus = Arc::default();
    let log: Log = Arc::default();

    let mut registry = ConnectorRegistry::new();
    let repo_corpus = Arc::clone(&corpus);
    registry.register_repository("memory", move || {
        Box::new(MemoryRepository {
            corpus: Arc::clone(&repo_corpus),
        })
    });
    let output_log = Arc::clone(&log);
    registry.register_output("recorder", move || {
        Box::new(RecordingOutput {
            log: Arc::clone(&output_log),
        })
    });

    registry.register_output("misconfigured", || Box::new(MisconfiguredOutput));

    let engine = Engine::new(Arc::clone(&store), &registry, settings);
    Harness {
        engine,
        store,
        corpus,
        log,
        registry,
    }
}

impl Harness {
    /// Save the `files` and `index` connections and a run-once job over them.
    pub fn with_job(self) -> Self {
        self.with_job_into("recorder")
    }

    /// Like [`with_job`](Self::with_job) with `index` served by `connector`.
    pub fn with_job_into(self, connector: &str) -> Self {
        let jobs = self.engine.jobs();
        jobs.bootstrap(
            &[
                Connection::new("files", ConnectionKind::Repository, "memory"),
                Connection::new("index", ConnectionKind::Output, connector),
            ],
            &[JobDescription::new(JOB, "files").with_stage(PipelineStage::output("index"))],
        )
        .unwrap();
        self
    }

    pub fn put(&self, identifier: &str, version: &str, content: &str) {
        self.corpus
            .lock()
            .unwrap()
            .insert(identifier.into(), (version.into(), content.as_bytes().to_vec()));
    }

    pub fn remove(&self, identifier: &str) {
        self.corpus.lock().unwrap().remove(identifier);
    }

    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    pub fn status(&self) -> JobStatus {
        self.engine.jobs().get(JOB).unwrap().status
    }

    /// Drive every coordinator by hand until the job is back to `Inactive`.
    pub fn run_job_to_completion(&self) {
        let ctx = Arc::clone(self.engine.context());
        let cancel = CancellationToken::new();
        let seeding = SeedingCoordinator::new(Arc::clone(&ctx));
        let worker = Worker::new(Arc::clone(&ctx), 0);
        let coordinator = JobCoordinator::new(Arc::clone(&ctx));
        let mut notification = NotificationCoordinator::new(Arc::clone(&ctx));

        for _ in 0..50 {
            seeding.run_once(&cancel).unwrap();
            while worker.run_once(&cancel).unwrap() > 0 {}
            coordinator.run_once(Utc::now()).unwrap();
            notification.run_once(&cancel).unwrap();
            if self.status() == JobStatus::Inactive {
                return;
            }
        }
        panic!("job stuck in {:?}", self.status());
    }

    /// Run deletion passes until the job is gone or `passes` runs out.
    pub fn delete_passes(&self, passes: usize) {
        let deletion = DeletionCoordinator::new(Arc::clone(self.engine.context()));
        let cancel = CancellationToken::new();
        for _ in 0..passes {
            deletion.run_once(&cancel).unwrap();
        }
    }
}
