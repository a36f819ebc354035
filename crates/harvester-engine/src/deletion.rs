//! Job deletion: remove every document of a `Deleting` job from its
//! outputs, purge the rows, then mark the job `Deleted`.
//!
//! Work is driven purely by `BeingDeleted` rows, so an interrupted deletion
//! resumes where it stopped.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use harvester_types::job::Job;
use harvester_types::state::{document_key, JobStatus};

use crate::cancel::CancellationToken;
use crate::context::EngineContext;
use crate::errors::ProcessError;
use crate::pipeline::{remove_from_outputs, StageContext};

pub struct DeletionCoordinator {
    ctx: Arc<EngineContext>,
}

impl DeletionCoordinator {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Delete until `cancel` fires.
    ///
    /// # Errors
    ///
    /// A configuration failure from an output connector; anything else is
    /// logged and retried on the next pass.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            let purged = match self.run_once(cancel) {
                Ok(purged) => purged,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Deletion pass failed");
                    0
                }
            };
            if purged == 0 && cancel.sleep(self.ctx.settings.poll_interval()) {
                break;
            }
        }
        Ok(())
    }

    /// One batch per deleting job. Returns how many rows were purged.
    ///
    /// # Errors
    ///
    /// The first failure that stops a job's batch.
    pub fn run_once(&self, cancel: &CancellationToken) -> Result<usize, ProcessError> {
        let mut purged = 0;
        for job in self.ctx.store.jobs_in_status(&[JobStatus::Deleting])? {
            if cancel.is_cancelled() {
                break;
            }
            purged += self.delete_batch(&job, cancel)?;
        }
        Ok(purged)
    }

    fn delete_batch(&self, job: &Job, cancel: &CancellationToken) -> Result<usize, ProcessError> {
        let store = self.ctx.store.as_ref();
        let documents =
            store.documents_being_deleted(&job.id, self.ctx.settings.deletion_batch_size)?;
        if documents.is_empty() {
            // Rows still Active are handed over by their worker when it finishes.
            if store.document_counts(&job.id)?.total() == 0 && store.finish_job_deletion(&job.id)? {
                tracing::info!(job = %job.description.name, "Job deleted");
            }
            return Ok(0);
        }

        let description = &job.description;
        let mut outputs = self
            .ctx
            .pools
            .grab_outputs(&description.output_connections(), cancel)?;
        let keep = HashSet::new();
        let mut removed = Vec::with_capacity(documents.len());
        let mut stopped = None;

        for doc in &documents {
            let key = document_key(&description.source, &doc.identifier);
            let stage_ctx = StageContext {
                store,
                document_key: &key,
                hopcount: description.hopcount_mode,
                cancel,
            };
            match remove_from_outputs(&stage_ctx, &mut outputs, &keep) {
                Ok(_) => removed.push(doc.identifier.clone()),
                Err(ProcessError::Document(e)) => {
                    tracing::warn!(
                        job = %description.name,
                        document = %doc.identifier,
                        error = %e,
                        "Output refused removal, dropping document"
                    );
                    removed.push(doc.identifier.clone());
                }
                Err(e) => {
                    stopped = Some(e);
                    break;
                }
            }
        }

        let purged = store.purge_documents(&job.id, &removed)?;
        tracing::debug!(job = %description.name, purged, "Purged deleted documents");
        match stopped {
            None | Some(ProcessError::Cancelled) => Ok(usize::try_from(purged).unwrap_or(usize::MAX)),
            Some(e) => Err(e),
        }
    }
}
