//! Operator-facing job management and the job lifecycle coordinator.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use harvester_state::backend::JobRunUpdate;
use harvester_state::{StateBackend, StateError};
use harvester_types::connection::{Connection, ConnectionKind};
use harvester_types::job::{Job, JobDescription, JobType};
use harvester_types::state::{ConnectionName, DocumentCounts, JobStatus};

use crate::cancel::CancellationToken;
use crate::context::EngineContext;
use crate::pool::PoolError;
use crate::registry::PoolRegistry;

/// Move a running or pausing job to `Error`. Returns whether it moved.
///
/// # Errors
///
/// Store failures.
pub fn abort_job(store: &dyn StateBackend, job: &Job, message: &str) -> Result<bool> {
    let moved = store.transition_job(
        &job.id,
        &[JobStatus::Running, JobStatus::Pausing],
        JobStatus::Error,
        &JobRunUpdate {
            end_time: Some(Utc::now()),
            error_message: Some(message.to_string()),
        },
    )?;
    if moved {
        tracing::error!(job = %job.description.name, error = message, "Job aborted");
    }
    Ok(moved)
}

// ---------------------------------------------------------------------------
// JobManager
// ---------------------------------------------------------------------------

/// A job with its document counts.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: Job,
    pub counts: DocumentCounts,
}

/// Create, start, pause, resume, and delete jobs, and manage the
/// connections they use.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn StateBackend>,
    pools: Option<Arc<PoolRegistry>>,
}

impl JobManager {
    #[must_use]
    pub fn new(store: Arc<dyn StateBackend>) -> Self {
        Self { store, pools: None }
    }

    /// Guard connection updates against the instances checked out of
    /// `pools`.
    #[must_use]
    pub fn with_pools(mut self, pools: Arc<PoolRegistry>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Save a new or edited connection.
    ///
    /// # Errors
    ///
    /// Fails if the connector or config changes while instances of the
    /// connection are checked out, or on store failures.
    pub fn save_connection(&self, connection: &Connection) -> Result<()> {
        let save = || self.store.save_connection(connection).map_err(PoolError::from);
        let saved = match &self.pools {
            Some(pools) => pools.reconfigure(connection, save),
            None => save(),
        };
        match saved {
            Ok(()) => Ok(()),
            Err(e @ PoolError::ConnectionInUse { .. }) => bail!("Cannot update connection: {e}"),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to save connection '{}'", connection.name))
            }
        }
    }

    /// Delete a connection. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Fails if any job still references the connection.
    pub fn delete_connection(&self, name: &ConnectionName) -> Result<bool> {
        match self.store.delete_connection(name) {
            Ok(deleted) => Ok(deleted),
            Err(e @ StateError::ConnectionInUse { .. }) => {
                bail!("Cannot delete connection: {e}")
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete connection '{name}'")),
        }
    }

    /// Create a job after checking its pipeline and connection references.
    ///
    /// # Errors
    ///
    /// Every problem found, or a duplicate live job name.
    pub fn create(&self, description: &JobDescription) -> Result<Job> {
        self.validate(description)?;
        let job = self.store.create_job(description)?;
        tracing::info!(job = %job.description.name, id = %job.id, "Job created");
        Ok(job)
    }

    /// Replace the description of the live job with the same name. Its
    /// documents stay, so the next run delivers them to any output added
    /// here.
    ///
    /// # Errors
    ///
    /// An unknown job, every problem found in `description`, or store
    /// failures.
    pub fn update(&self, description: &JobDescription) -> Result<Job> {
        let job = self.get(&description.name)?;
        if job.status == JobStatus::Deleting {
            bail!("Job '{}' is being deleted", description.name);
        }
        self.validate(description)?;
        self.store
            .update_job_description(&job.id, description)
            .with_context(|| format!("Failed to update job '{}'", description.name))?;
        tracing::info!(job = %description.name, id = %job.id, "Job updated");
        self.get(&description.name)
    }

    fn validate(&self, description: &JobDescription) -> Result<()> {
        let mut problems = description.pipeline_problems();
        self.check_reference(
            &description.source,
            ConnectionKind::Repository,
            &mut problems,
        )?;
        for stage in &description.pipeline {
            let kind = if stage.is_output {
                ConnectionKind::Output
            } else {
                ConnectionKind::Transformation
            };
            self.check_reference(&stage.connection, kind, &mut problems)?;
        }
        if !problems.is_empty() {
            bail!(
                "Job '{}' is not valid:\n  - {}",
                description.name,
                problems.join("\n  - ")
            );
        }
        Ok(())
    }

    fn check_reference(
        &self,
        name: &ConnectionName,
        expected: ConnectionKind,
        problems: &mut Vec<String>,
    ) -> Result<()> {
        match self.store.load_connection(name)? {
            None => problems.push(format!("unknown connection '{name}'")),
            Some(connection) if connection.kind != expected => problems.push(format!(
                "connection '{name}' is a {} connection, expected {expected}",
                connection.kind
            )),
            Some(_) => {}
        }
        Ok(())
    }

    /// # Errors
    ///
    /// No live job has the name, or a store failure.
    pub fn get(&self, name: &str) -> Result<Job> {
        self.store
            .find_job_by_name(name)?
            .with_context(|| format!("No job named '{name}'"))
    }

    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn status(&self, name: &str) -> Result<JobReport> {
        let job = self.get(name)?;
        let counts = self.store.document_counts(&job.id)?;
        Ok(JobReport { job, counts })
    }

    /// Every live job, with counts.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn list(&self) -> Result<Vec<JobReport>> {
        self.store
            .list_jobs()?
            .into_iter()
            .map(|job| {
                let counts = self.store.document_counts(&job.id)?;
                Ok(JobReport { job, counts })
            })
            .collect()
    }

    /// Start a new run. Returns `false` if the job is not startable.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn start(&self, name: &str) -> Result<bool> {
        let job = self.get(name)?;
        let started = self.store.begin_job_run(&job.id, Utc::now())?;
        if started {
            tracing::info!(job = name, "Job started");
        }
        Ok(started)
    }

    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn pause(&self, name: &str) -> Result<bool> {
        let job = self.get(name)?;
        let paused = self.store.transition_job(
            &job.id,
            &[JobStatus::Running],
            JobStatus::Pausing,
            &JobRunUpdate::default(),
        )?;
        if paused {
            tracing::info!(job = name, "Job pausing");
        }
        Ok(paused)
    }

    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn resume(&self, name: &str) -> Result<bool> {
        let job = self.get(name)?;
        let resumed = self.store.transition_job(
            &job.id,
            &[JobStatus::Pausing, JobStatus::Paused],
            JobStatus::Running,
            &JobRunUpdate::default(),
        )?;
        if resumed {
            tracing::info!(job = name, "Job resumed");
        }
        Ok(resumed)
    }

    /// Begin deleting a job and everything it ingested.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn delete(&self, name: &str) -> Result<bool> {
        let job = self.get(name)?;
        let deleting = self.store.begin_job_deletion(&job.id)?;
        if deleting {
            tracing::info!(job = name, "Job deletion started");
        }
        Ok(deleting)
    }

    /// Save every configured connection and create configured jobs that do
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// The first connection or job that cannot be stored.
    pub fn bootstrap(&self, connections: &[Connection], jobs: &[JobDescription]) -> Result<()> {
        for connection in connections {
            self.save_connection(connection)?;
        }
        for description in jobs {
            if self.store.find_job_by_name(&description.name)?.is_some() {
                tracing::debug!(job = %description.name, "Job already exists");
                continue;
            }
            self.create(description)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobCoordinator
// ---------------------------------------------------------------------------

/// Drives job status transitions that follow from document state:
/// completion, pausing, and scheduled restarts.
pub struct JobCoordinator {
    ctx: Arc<EngineContext>,
}

impl JobCoordinator {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// # Errors
    ///
    /// None in practice: failed passes are logged and retried.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            if let Err(e) = self.run_once(Utc::now()) {
                tracing::error!(error = %e, "Job coordinator pass failed");
            }
            if cancel.sleep(self.ctx.settings.poll_interval()) {
                break;
            }
        }
        Ok(())
    }

    /// One pass over every job. Returns how many transitions were made.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let store = self.ctx.store.as_ref();
        let mut transitions = 0;

        for job in store.jobs_in_status(&[
            JobStatus::Running,
            JobStatus::Pausing,
            JobStatus::Completing,
            JobStatus::NotYetRun,
            JobStatus::Inactive,
        ])? {
            let name = &job.description.name;
            let moved = match job.status {
                JobStatus::Running => {
                    let finishes = job.description.job_type == JobType::RunOnce;
                    if finishes
                        && job.seeding_complete
                        && store.document_counts(&job.id)?.in_flight() == 0
                    {
                        store.transition_job(
                            &job.id,
                            &[JobStatus::Running],
                            JobStatus::Completing,
                            &JobRunUpdate {
                                end_time: Some(now),
                                error_message: None,
                            },
                        )?
                    } else {
                        false
                    }
                }
                JobStatus::Pausing => {
                    store.document_counts(&job.id)?.active == 0
                        && store.transition_job(
                            &job.id,
                            &[JobStatus::Pausing],
                            JobStatus::Paused,
                            &JobRunUpdate::default(),
                        )?
                }
                JobStatus::Completing => store.transition_job(
                    &job.id,
                    &[JobStatus::Completing],
                    JobStatus::Notifying,
                    &JobRunUpdate::default(),
                )?,
                JobStatus::NotYetRun | JobStatus::Inactive => {
                    job.description.schedule.is_due(job.end_time, now)
                        && store.begin_job_run(&job.id, now)?
                }
                _ => false,
            };
            if moved {
                tracing::info!(job = %name, from = %job.status, "Job status advanced");
                transitions += 1;
            }
        }
        Ok(transitions)
    }
}
