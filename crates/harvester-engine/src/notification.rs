//! Job-complete notification for every output connection of a finished job.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use harvester_state::backend::JobRunUpdate;
use harvester_types::job::Job;
use harvester_types::state::{activity as activity_type, ConnectionName, JobId, JobStatus};

use crate::activity::{record, ActivityEntry, ProcessActivity};
use crate::cancel::CancellationToken;
use crate::context::EngineContext;
use crate::errors::ProcessError;

/// Moves `Notifying` jobs to `Inactive` once every output connection they
/// use has acknowledged the end of the run. Connections that fail are
/// retried on later passes without limit.
pub struct NotificationCoordinator {
    ctx: Arc<EngineContext>,
    pending: HashMap<JobId, BTreeSet<ConnectionName>>,
}

impl NotificationCoordinator {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            pending: HashMap::new(),
        }
    }

    /// Notify until `cancel` fires.
    ///
    /// # Errors
    ///
    /// A configuration failure from an output connector.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            match self.run_once(cancel) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => tracing::warn!(error = %e, "Notification pass failed"),
            }
            if cancel.sleep(self.ctx.settings.poll_interval()) {
                break;
            }
        }
        Ok(())
    }

    /// One pass over every `Notifying` job. Returns how many jobs became
    /// `Inactive`.
    ///
    /// # Errors
    ///
    /// Store failures, or a configuration failure from an output.
    pub fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize, ProcessError> {
        let jobs = self.ctx.store.jobs_in_status(&[JobStatus::Notifying])?;
        self.pending
            .retain(|id, _| jobs.iter().any(|job| job.id == *id));

        let mut finished = 0;
        for job in &jobs {
            if cancel.is_cancelled() {
                break;
            }
            if self.notify_job(job, cancel)? {
                finished += 1;
            }
        }
        Ok(finished)
    }

    fn notify_job(&mut self, job: &Job, cancel: &CancellationToken) -> Result<bool, ProcessError> {
        let remaining = self
            .pending
            .entry(job.id.clone())
            .or_insert_with(|| job.description.output_connections().into_iter().collect());

        let targets: Vec<ConnectionName> = remaining.iter().cloned().collect();
        for name in targets {
            match notify_output(&self.ctx, job, &name, cancel) {
                Ok(()) => {
                    remaining.remove(&name);
                }
                Err(ProcessError::Cancelled) => return Ok(false),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(
                    job = %job.description.name,
                    output = %name,
                    error = %e,
                    "Job-complete notification failed, will retry"
                ),
            }
        }
        if !remaining.is_empty() {
            return Ok(false);
        }

        self.pending.remove(&job.id);
        let moved = self.ctx.store.transition_job(
            &job.id,
            &[JobStatus::Notifying],
            JobStatus::Inactive,
            &JobRunUpdate {
                end_time: Some(Utc::now()),
                error_message: None,
            },
        )?;
        if moved {
            tracing::info!(job = %job.description.name, "Job finished");
        }
        Ok(moved)
    }
}

fn notify_output(
    ctx: &EngineContext,
    job: &Job,
    name: &ConnectionName,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let mut output = ctx.pools.outputs.grab(name, cancel)?;
    let store = ctx.store.as_ref();
    let activity = ProcessActivity::new(store, name, job.description.hopcount_mode, cancel);
    let start = Utc::now();
    let result = output.note_job_complete(&activity);
    let result_code = match &result {
        Ok(()) => "OK".to_string(),
        Err(e) => e.code.clone(),
    };
    record(
        store,
        name,
        &ActivityEntry {
            start: Some(start),
            activity_type: activity_type::JOB_COMPLETE,
            byte_count: None,
            entity_id: &job.description.name,
            result_code: &result_code,
            description: None,
        },
    );
    result.map_err(ProcessError::from)
}
