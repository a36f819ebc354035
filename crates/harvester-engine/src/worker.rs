//! Document workers: claim a batch, process each document, settle its row.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use harvester_sdk::connector::{FetchOutcome, OutputConnector};
use harvester_types::connection::Connection;
use harvester_types::error::ConnectorError;
use harvester_types::job::{Job, JobDescription};
use harvester_types::state::{
    activity as activity_type, document_key, ConnectionName, DocumentOutcome, DocumentRecord,
    JobId,
};

use crate::activity::{record, ActivityEntry, ProcessActivity};
use crate::cancel::CancellationToken;
use crate::context::EngineContext;
use crate::errors::{compute_backoff, ProcessError};
use crate::jobs::abort_job;
use crate::pipeline::{
    indexable_outputs, outputs_current, record_filtered, remove_from_outputs, run_pipeline,
    OutputLeases, StageContext,
};
use crate::registry::PipelineLease;

/// A job and its source connection, as loaded for one claimed batch.
struct LoadedJob {
    job: Job,
    source: Connection,
}

/// One document-processing thread.
pub struct Worker {
    ctx: Arc<EngineContext>,
    index: usize,
}

impl Worker {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, index: usize) -> Self {
        Self { ctx, index }
    }

    /// Claim and process batches until `cancel` fires.
    ///
    /// # Errors
    ///
    /// None in practice: store failures are logged and the loop carries on
    /// after a poll interval.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!(worker = self.index, "Worker started");
        while !cancel.is_cancelled() {
            let claimed = match self.run_once(cancel) {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(worker = self.index, error = %e, "Worker pass failed");
                    0
                }
            };
            if claimed == 0 && cancel.sleep(self.ctx.settings.poll_interval()) {
                break;
            }
        }
        tracing::debug!(worker = self.index, "Worker stopped");
        Ok(())
    }

    /// Claim one batch and settle every document in it. Returns how many
    /// documents were claimed.
    ///
    /// # Errors
    ///
    /// Store failures while claiming or settling.
    pub fn run_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let store = self.ctx.store.as_ref();
        self.ctx
            .bins
            .assess_minimum_depth(store.lowest_pending_priority()?)?;
        let claimed = store.claim_documents(self.ctx.settings.claim_batch_size, Utc::now())?;
        if claimed.is_empty() {
            return Ok(0);
        }
        tracing::debug!(worker = self.index, count = claimed.len(), "Claimed documents");

        let mut jobs: HashMap<JobId, Option<LoadedJob>> = HashMap::new();
        for doc in &claimed {
            let outcome = if cancel.is_cancelled() {
                DocumentOutcome::Requeue
            } else {
                self.handle(doc, &mut jobs, cancel)?
            };
            if !store.finish_document(&doc.job_id, &doc.identifier, &outcome)? {
                tracing::debug!(
                    job = %doc.job_id,
                    document = %doc.identifier,
                    "Document no longer active, outcome dropped"
                );
            }
        }
        Ok(claimed.len())
    }

    fn handle(
        &self,
        doc: &DocumentRecord,
        jobs: &mut HashMap<JobId, Option<LoadedJob>>,
        cancel: &CancellationToken,
    ) -> Result<DocumentOutcome> {
        let loaded = match jobs.entry(doc.job_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(load_job(&self.ctx, &doc.job_id)?),
        };
        let Some(LoadedJob { job, source }) = loaded.as_ref() else {
            return Ok(DocumentOutcome::Requeue);
        };

        let result = process_document(&self.ctx, job, source, doc, cancel);
        let outcome = settle(&self.ctx, job, source, doc, result)?;
        // The job was aborted or is stopping; hand back the rest of its batch.
        if outcome == DocumentOutcome::Requeue {
            *loaded = None;
        }
        Ok(outcome)
    }
}

fn load_job(ctx: &EngineContext, id: &JobId) -> Result<Option<LoadedJob>> {
    let Some(job) = ctx.store.load_job(id)? else {
        return Ok(None);
    };
    if !job.status.has_live_documents() {
        return Ok(None);
    }
    let Some(source) = ctx.store.load_connection(&job.description.source)? else {
        abort_job(
            ctx.store.as_ref(),
            &job,
            &format!("source connection '{}' does not exist", job.description.source),
        )?;
        return Ok(None);
    };
    Ok(Some(LoadedJob { job, source }))
}

/// Turn a processing result into the row's next state. Configuration
/// errors abort the job and hand the document back as `Pending`.
fn settle(
    ctx: &EngineContext,
    job: &Job,
    source: &Connection,
    doc: &DocumentRecord,
    result: Result<DocumentOutcome, ProcessError>,
) -> Result<DocumentOutcome> {
    let err = match result {
        Ok(outcome) => return Ok(outcome),
        Err(ProcessError::Cancelled) => return Ok(DocumentOutcome::Requeue),
        Err(err) => err,
    };

    let message = err.to_string();
    record(
        ctx.store.as_ref(),
        &source.name,
        &ActivityEntry {
            start: None,
            activity_type: activity_type::PROCESS_ERROR,
            byte_count: None,
            entity_id: &doc.identifier,
            result_code: &err.result_code(),
            description: Some(&message),
        },
    );

    let outcome = match err {
        ProcessError::Configuration(e) => {
            abort_job(ctx.store.as_ref(), job, &e.to_string())?;
            DocumentOutcome::Requeue
        }
        ProcessError::Document(e) => {
            tracing::warn!(
                job = %job.description.name,
                document = %doc.identifier,
                error = %e,
                "Document failed"
            );
            DocumentOutcome::Failed {
                message: e.to_string(),
            }
        }
        ProcessError::Transient(e) => retry_or_fail(ctx, job, doc, &e),
        ProcessError::Infrastructure(e) => {
            let internal = ConnectorError::internal("INTERNAL", format!("{e:#}"));
            retry_or_fail(ctx, job, doc, &internal)
        }
        ProcessError::Cancelled => DocumentOutcome::Requeue,
    };
    Ok(outcome)
}

fn retry_or_fail(
    ctx: &EngineContext,
    job: &Job,
    doc: &DocumentRecord,
    err: &ConnectorError,
) -> DocumentOutcome {
    let attempt = doc.retry_count.saturating_add(1);
    if attempt > ctx.settings.max_retries {
        tracing::warn!(
            job = %job.description.name,
            document = %doc.identifier,
            attempts = attempt,
            error = %err,
            "Retries exhausted"
        );
        return DocumentOutcome::Failed {
            message: format!("{err} (gave up after {attempt} attempts)"),
        };
    }
    let delay = compute_backoff(err, attempt, &mut rand::rng());
    tracing::warn!(
        job = %job.description.name,
        document = %doc.identifier,
        attempt,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %err,
        "Transient interruption, rescheduling"
    );
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
    DocumentOutcome::Retry {
        check_time: Utc::now() + delay,
        message: err.to_string(),
    }
}

fn source_activity<'a>(
    ctx: &'a EngineContext,
    description: &JobDescription,
    source: &'a Connection,
    outputs: &'a OutputLeases,
    cancel: &'a CancellationToken,
) -> ProcessActivity<'a> {
    let outputs: Vec<&dyn OutputConnector> =
        outputs.values().map(|o| &**o as &dyn OutputConnector).collect();
    ProcessActivity::new(ctx.store.as_ref(), &source.name, description.hopcount_mode, cancel)
        .with_outputs(outputs)
}

/// Process one claimed document of `job` and decide its outcome.
///
/// Throttle slots are taken first, then every connector of the pipeline.
/// An unchanged version completes without fetching; a missing version or
/// an excluded fetch removes the document from every output holding it.
///
/// # Errors
///
/// Any classified failure; the caller turns it into a status transition.
pub fn process_document(
    ctx: &EngineContext,
    job: &Job,
    source: &Connection,
    doc: &DocumentRecord,
    cancel: &CancellationToken,
) -> Result<DocumentOutcome, ProcessError> {
    let description = &job.description;
    let permit = ctx
        .throttles
        .acquire(source.name.as_str(), &doc.identifier, &source.throttles, cancel)?;

    let transformation_names: Vec<ConnectionName> = description
        .pipeline
        .iter()
        .filter(|stage| !stage.is_output)
        .map(|stage| stage.connection.clone())
        .collect();
    let mut lease = ctx.pools.grab_pipeline(
        &description.source,
        &transformation_names,
        &description.output_connections(),
        cancel,
    )?;
    let PipelineLease {
        repository,
        transformations,
        outputs,
    } = &mut lease;

    let key = document_key(&source.name, &doc.identifier);
    let stage_ctx = StageContext {
        store: ctx.store.as_ref(),
        document_key: &key,
        hopcount: description.hopcount_mode,
        cancel,
    };

    let version = {
        let activity = source_activity(ctx, description, source, outputs, cancel);
        repository.document_version(&doc.identifier, &description.document_spec, &activity)?
    };
    let Some(version) = version else {
        drop(permit);
        let removed = remove_from_outputs(&stage_ctx, outputs, &HashSet::new())?;
        tracing::debug!(document = %doc.identifier, removed, "Document no longer exists");
        return Ok(DocumentOutcome::Deleted);
    };
    if doc.last_version.as_deref() == Some(version.as_str())
        && outputs_current(&stage_ctx, &description.output_connections(), &version)?
    {
        tracing::trace!(document = %doc.identifier, version, "Version unchanged");
        return Ok(DocumentOutcome::Completed {
            version: Some(version),
        });
    }

    let start = Utc::now();
    let fetched = {
        let activity = source_activity(ctx, description, source, outputs, cancel);
        repository.fetch_document(
            &doc.identifier,
            &version,
            &description.document_spec,
            &activity,
        )?
    };
    let (uri, document) = match fetched {
        FetchOutcome::Fetched { uri, document } => (uri, document),
        FetchOutcome::Excluded => {
            drop(permit);
            record(
                ctx.store.as_ref(),
                &source.name,
                &ActivityEntry {
                    start: Some(start),
                    activity_type: activity_type::FETCH,
                    byte_count: None,
                    entity_id: &doc.identifier,
                    result_code: "EXCLUDED",
                    description: None,
                },
            );
            remove_from_outputs(&stage_ctx, outputs, &HashSet::new())?;
            return Ok(DocumentOutcome::Deleted);
        }
    };
    permit.finish(document.len());
    record(
        ctx.store.as_ref(),
        &source.name,
        &ActivityEntry {
            start: Some(start),
            activity_type: activity_type::FETCH,
            byte_count: Some(document.len()),
            entity_id: &doc.identifier,
            result_code: "OK",
            description: None,
        },
    );

    let indexable = indexable_outputs(outputs, &uri, &document);
    let summary = run_pipeline(
        &stage_ctx,
        &description.pipeline,
        &uri,
        &version,
        &document,
        &indexable,
        transformations,
        outputs,
    )?;
    remove_from_outputs(&stage_ctx, outputs, &summary.delivered)?;

    if summary.is_excluded() {
        tracing::debug!(document = %doc.identifier, "Document excluded by every output");
        Ok(DocumentOutcome::Deleted)
    } else {
        let filtered: Vec<ConnectionName> = description
            .output_connections()
            .into_iter()
            .filter(|name| !summary.delivered.contains(name))
            .collect();
        record_filtered(&stage_ctx, &filtered, &version)?;
        Ok(DocumentOutcome::Completed {
            version: Some(version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_types::error::ErrorCategory;
    use harvester_types::state::JobStatus;

    fn doc(retry_count: u32) -> DocumentRecord {
        DocumentRecord {
            job_id: JobId::new("j"),
            identifier: "/a".into(),
            priority: 1.0,
            status: harvester_types::state::DocumentStatus::Active,
            bin_name: String::new(),
            last_version: None,
            fail_count: 0,
            retry_count,
            check_time: None,
            error_message: None,
        }
    }

    fn context(max_retries: u32) -> EngineContext {
        let store = Arc::new(harvester_state::SqliteStateBackend::in_memory().unwrap());
        let settings = crate::config::EngineSettings {
            max_retries,
            ..Default::default()
        };
        EngineContext::new(store, &crate::registry::ConnectorRegistry::new(), settings)
    }

    fn job() -> Job {
        Job {
            id: JobId::new("j"),
            description: JobDescription::new("crawl", "files"),
            status: JobStatus::Running,
            seeding_complete: false,
            last_seed_time: None,
            next_seed_time: None,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    #[test]
    fn transient_retries_until_bound() {
        let ctx = context(2);
        let err = ConnectorError::transient_network("TIMEOUT", "slow").with_retry_after_ms(250);
        let before = Utc::now();
        match retry_or_fail(&ctx, &job(), &doc(1), &err) {
            DocumentOutcome::Retry { check_time, .. } => {
                assert!(check_time >= before + chrono::Duration::milliseconds(250));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert!(matches!(
            retry_or_fail(&ctx, &job(), &doc(2), &err),
            DocumentOutcome::Failed { .. }
        ));
    }

    #[test]
    fn cancellation_requeues_without_history() {
        let ctx = context(5);
        let source = Connection::new(
            "files",
            harvester_types::connection::ConnectionKind::Repository,
            "fs",
        );
        let outcome = settle(&ctx, &job(), &source, &doc(0), Err(ProcessError::Cancelled)).unwrap();
        assert_eq!(outcome, DocumentOutcome::Requeue);
        assert!(ctx.store.recent_activity(None, 10).unwrap().is_empty());
    }

    #[test]
    fn document_errors_fail_and_are_recorded() {
        let ctx = context(5);
        let source = Connection::new(
            "files",
            harvester_types::connection::ConnectionKind::Repository,
            "fs",
        );
        let err = ConnectorError::document("BAD_PDF", "truncated");
        assert_eq!(err.category, ErrorCategory::Document);
        let outcome = settle(&ctx, &job(), &source, &doc(0), Err(err.into())).unwrap();
        assert!(matches!(outcome, DocumentOutcome::Failed { .. }));
        let history = ctx.store.recent_activity(None, 10).unwrap();
        assert_eq!(history[0].result_code, "BAD_PDF");
        assert_eq!(history[0].activity_type, activity_type::PROCESS_ERROR);
    }
}
