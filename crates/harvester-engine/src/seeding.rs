//! Seeding: enumerate a running job's top-level identifiers into its queue.
//!
//! The source connector enumerates on a scoped thread and feeds a bounded
//! channel; this thread assigns bin priorities and commits batches. Either
//! side failing abandons the channel so the other stops promptly.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use harvester_state::backend::SeedingProgress;
use harvester_types::connection::Connection;
use harvester_types::error::ConnectorError;
use harvester_types::job::Job;
use harvester_types::state::{activity as activity_type, JobStatus, NewDocument};

use crate::activity::{record, ActivityEntry, ProcessActivity, SeedingSink};
use crate::cancel::{CancellationToken, WAIT_SLICE};
use crate::channel::{CrossThreadChannel, Fetched};
use crate::context::EngineContext;
use crate::errors::{compute_backoff, ProcessError};
use crate::jobs::abort_job;

/// Whether a job is due for a seeding pass at `now`.
#[must_use]
pub fn needs_seeding(job: &Job, now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Running
        && !job.seeding_complete
        && job.next_seed_time.map_or(true, |next| next <= now)
}

pub struct SeedingCoordinator {
    ctx: Arc<EngineContext>,
}

impl SeedingCoordinator {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Seed due jobs until `cancel` fires.
    ///
    /// # Errors
    ///
    /// None in practice: failed passes are logged and retried.
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            if let Err(e) = self.run_once(cancel) {
                tracing::error!(error = %e, "Seeding pass failed");
            }
            if cancel.sleep(self.ctx.settings.poll_interval()) {
                break;
            }
        }
        Ok(())
    }

    /// Run one seeding pass for every due job. Returns how many jobs were
    /// seeded successfully.
    ///
    /// # Errors
    ///
    /// Store failures while listing jobs or recording progress.
    pub fn run_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let now = Utc::now();
        let mut seeded = 0;
        for job in self.ctx.store.jobs_in_status(&[JobStatus::Running])? {
            if cancel.is_cancelled() {
                break;
            }
            if needs_seeding(&job, now) && self.seed_job(&job, cancel)? {
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    fn seed_job(&self, job: &Job, cancel: &CancellationToken) -> Result<bool> {
        let store = self.ctx.store.as_ref();
        let description = &job.description;
        let Some(source) = store.load_connection(&description.source)? else {
            abort_job(
                store,
                job,
                &format!("source connection '{}' does not exist", description.source),
            )?;
            return Ok(false);
        };

        let start = Utc::now();
        tracing::debug!(job = %description.name, since = ?job.last_seed_time, "Seeding job");
        let result = self.enumerate(job, &source, cancel);

        let (result_code, message) = match &result {
            Ok(count) => ("OK".to_string(), format!("{count} identifiers")),
            Err(e) => (e.result_code(), e.to_string()),
        };
        if !matches!(result, Err(ProcessError::Cancelled)) {
            record(
                store,
                &source.name,
                &ActivityEntry {
                    start: Some(start),
                    activity_type: activity_type::SEED,
                    byte_count: None,
                    entity_id: &description.name,
                    result_code: &result_code,
                    description: Some(&message),
                },
            );
        }

        match result {
            Ok(count) => {
                let next_seed_time = description
                    .job_type
                    .reseed_interval()
                    .and_then(|interval| chrono::Duration::from_std(interval).ok())
                    .map(|interval| start + interval);
                store.note_seeding(
                    &job.id,
                    SeedingProgress {
                        seeding_complete: next_seed_time.is_none(),
                        last_seed_time: Some(start),
                        next_seed_time,
                    },
                )?;
                tracing::info!(job = %description.name, count, "Seeding pass complete");
                Ok(true)
            }
            Err(ProcessError::Cancelled) => Ok(false),
            Err(ProcessError::Configuration(e)) => {
                abort_job(store, job, &e.to_string())?;
                Ok(false)
            }
            Err(e) => {
                let err = e
                    .as_connector_error()
                    .cloned()
                    .unwrap_or_else(|| ConnectorError::internal("INTERNAL", e.to_string()));
                let delay = compute_backoff(&err, 1, &mut rand::rng());
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let delay =
                    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                store.note_seeding(
                    &job.id,
                    SeedingProgress {
                        seeding_complete: false,
                        last_seed_time: None,
                        next_seed_time: Some(Utc::now() + delay),
                    },
                )?;
                tracing::warn!(
                    job = %description.name,
                    delay_ms,
                    error = %e,
                    "Seeding interrupted, postponing"
                );
                Ok(false)
            }
        }
    }

    fn enumerate(
        &self,
        job: &Job,
        source: &Connection,
        cancel: &CancellationToken,
    ) -> Result<usize, ProcessError> {
        let mut repository = self.ctx.pools.repositories.grab(&source.name, cancel)?;
        let channel = CrossThreadChannel::new(self.ctx.settings.channel_capacity);
        let store = self.ctx.store.as_ref();
        let description = &job.description;

        std::thread::scope(|scope| -> Result<usize, ProcessError> {
            let producer = scope.spawn(|| {
                let sink = SeedingSink::new(
                    ProcessActivity::new(store, &source.name, description.hopcount_mode, cancel),
                    &channel,
                );
                let result = repository.enumerate_seeds(
                    &sink,
                    &description.document_spec,
                    job.last_seed_time,
                );
                channel.signal_done();
                result
            });

            let committed = self.commit_seeds(job, source, &channel, cancel);
            if committed.is_err() {
                channel.abandon();
            }
            let produced = producer.join().map_err(|_| {
                ProcessError::Infrastructure(anyhow::anyhow!("seed enumeration thread panicked"))
            })?;
            let committed = committed?;
            produced?;
            Ok(committed)
        })
    }

    fn commit_seeds(
        &self,
        job: &Job,
        source: &Connection,
        channel: &CrossThreadChannel<String>,
        cancel: &CancellationToken,
    ) -> Result<usize, ProcessError> {
        let batch_size = self.ctx.settings.seeding_batch_size;
        let mut batch: Vec<String> = Vec::with_capacity(batch_size);
        let mut total = 0;
        loop {
            match channel.fetch_timeout(WAIT_SLICE)? {
                Fetched::Item(identifier) => {
                    batch.push(identifier);
                    if batch.len() >= batch_size {
                        total += self.commit_batch(job, source, &mut batch, cancel)?;
                    }
                }
                Fetched::Done => {
                    total += self.commit_batch(job, source, &mut batch, cancel)?;
                    return Ok(total);
                }
                Fetched::Empty => {
                    if cancel.is_cancelled() {
                        return Err(ProcessError::Cancelled);
                    }
                }
                Fetched::Abandoned => return Err(ProcessError::Cancelled),
            }
        }
    }

    /// Assign bins and priorities to `batch` and queue it in one
    /// transaction. Priorities for the whole batch are reserved per bin in
    /// a single allocation.
    fn commit_batch(
        &self,
        job: &Job,
        source: &Connection,
        batch: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<usize, ProcessError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let class = source.connector.as_str();
        let bias = f64::from(job.description.priority);

        let mut bins = Vec::with_capacity(batch.len());
        for identifier in batch.iter() {
            let bin = self
                .ctx
                .throttles
                .resolve_bin(identifier, &source.throttles)?
                .unwrap_or_default();
            self.ctx.bins.preload(class, &bin, 1)?;
            bins.push(bin);
        }

        let mut documents = Vec::with_capacity(batch.len());
        for (identifier, bin_name) in batch.drain(..).zip(bins) {
            let priority = self.ctx.bins.grab_preloaded(class, &bin_name, bias, cancel)?;
            documents.push(NewDocument {
                identifier,
                priority,
                bin_name,
            });
        }
        let queued = self.ctx.store.add_documents(&job.id, &documents)?;
        tracing::debug!(
            job = %job.description.name,
            seeds = documents.len(),
            queued,
            "Seed batch committed"
        );
        Ok(documents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_types::job::{JobDescription, JobType};
    use harvester_types::state::JobId;

    fn job(status: JobStatus) -> Job {
        Job {
            id: JobId::new("j"),
            description: JobDescription::new("crawl", "files"),
            status,
            seeding_complete: false,
            last_seed_time: None,
            next_seed_time: None,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    #[test]
    fn due_only_while_running_and_incomplete() {
        let now = Utc::now();
        assert!(needs_seeding(&job(JobStatus::Running), now));
        assert!(!needs_seeding(&job(JobStatus::Paused), now));

        let mut done = job(JobStatus::Running);
        done.seeding_complete = true;
        assert!(!needs_seeding(&done, now));

        let mut later = job(JobStatus::Running);
        later.description.job_type = JobType::Continuous {
            reseed_interval_secs: 60,
        };
        later.next_seed_time = Some(now + chrono::Duration::seconds(30));
        assert!(!needs_seeding(&later, now));
        assert!(needs_seeding(&later, now + chrono::Duration::seconds(31)));
    }
}
