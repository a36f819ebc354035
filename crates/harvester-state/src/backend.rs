//! Storage-agnostic state backend trait.

use chrono::{DateTime, Utc};

use harvester_types::connection::Connection;
use harvester_types::job::{Job, JobDescription};
use harvester_types::state::{
    ActivityRecord, ConnectionName, DocumentCounts, DocumentOutcome, DocumentRecord, IngestStatus,
    JobId, JobStatus, NewDocument,
};

use crate::error;

/// Seeding bookkeeping written after a seeding pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedingProgress {
    /// No further seeding pass is needed for this run.
    pub seeding_complete: bool,
    /// Start time of the pass that just finished, if it finished.
    pub last_seed_time: Option<DateTime<Utc>>,
    /// Earliest time of the next pass, if one is needed.
    pub next_seed_time: Option<DateTime<Utc>>,
}

/// Fields updated alongside a job status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunUpdate {
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Persistent crawl state.
///
/// Implementations must be `Send + Sync` so they can be shared across the
/// engine's worker threads behind an `Arc<dyn StateBackend>`. Each method
/// is one transaction: it either applies completely or not at all.
pub trait StateBackend: Send + Sync {
    // -- connections --------------------------------------------------------

    /// Insert or replace a connection definition.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn save_connection(&self, connection: &Connection) -> error::Result<()>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn load_connection(&self, name: &ConnectionName) -> error::Result<Option<Connection>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list_connections(&self) -> error::Result<Vec<Connection>>;

    /// Delete a connection no job references.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ConnectionInUse`](crate::StateError::ConnectionInUse)
    /// if any job that is not `Deleted` references it.
    fn delete_connection(&self, name: &ConnectionName) -> error::Result<bool>;

    // -- jobs ---------------------------------------------------------------

    /// Create a job in `NotYetRun`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::DuplicateJobName`](crate::StateError::DuplicateJobName)
    /// if a job that is not `Deleted` already has the name.
    fn create_job(&self, description: &JobDescription) -> error::Result<Job>;

    /// Replace a job's description, keeping its status and documents.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::JobNotFound`](crate::StateError::JobNotFound)
    /// for an unknown id.
    fn update_job_description(&self, id: &JobId, description: &JobDescription)
        -> error::Result<()>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn load_job(&self, id: &JobId) -> error::Result<Option<Job>>;

    /// Look up the live (not `Deleted`) job with the given name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn find_job_by_name(&self, name: &str) -> error::Result<Option<Job>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list_jobs(&self) -> error::Result<Vec<Job>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn jobs_in_status(&self, statuses: &[JobStatus]) -> error::Result<Vec<Job>>;

    /// Compare-and-set the job status. Returns `false` (and changes nothing)
    /// when the current status is not in `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn transition_job(
        &self,
        id: &JobId,
        from: &[JobStatus],
        to: JobStatus,
        update: &JobRunUpdate,
    ) -> error::Result<bool>;

    /// Start a new run of a startable job: status `Running`, seeding reset,
    /// finished documents re-queued for a version check, `Deleted` rows
    /// purged.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn begin_job_run(&self, id: &JobId, now: DateTime<Utc>) -> error::Result<bool>;

    /// Record the outcome of a seeding pass.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn note_seeding(&self, id: &JobId, progress: SeedingProgress) -> error::Result<()>;

    /// Move a job to `Deleting` and flip every one of its documents to
    /// `BeingDeleted`. Returns `false` if the job is already deleting or gone.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn begin_job_deletion(&self, id: &JobId) -> error::Result<bool>;

    /// Mark a job whose documents are all purged as `Deleted` and drop its
    /// connection references.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn finish_job_deletion(&self, id: &JobId) -> error::Result<bool>;

    // -- documents ----------------------------------------------------------

    /// Queue documents as `Pending`. Rows already finished (`Completed`,
    /// `Error`, `Deleted`) are re-queued; `Pending`, `Active`, and
    /// `BeingDeleted` rows are left alone. Returns how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn add_documents(&self, job: &JobId, documents: &[NewDocument]) -> error::Result<u64>;

    /// Select up to `limit` eligible `Pending` documents of `Running` jobs,
    /// lowest priority first, and flip them to `Active` in the same
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn claim_documents(&self, limit: usize, now: DateTime<Utc>)
        -> error::Result<Vec<DocumentRecord>>;

    /// Apply a worker's outcome to an `Active` document. Returns `false` if
    /// the row is no longer `Active` (e.g. its job is being deleted).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn finish_document(
        &self,
        job: &JobId,
        identifier: &str,
        outcome: &DocumentOutcome,
    ) -> error::Result<bool>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn load_document(&self, job: &JobId, identifier: &str)
        -> error::Result<Option<DocumentRecord>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn document_counts(&self, job: &JobId) -> error::Result<DocumentCounts>;

    /// Lowest priority among `Pending` documents of `Running` jobs.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn lowest_pending_priority(&self) -> error::Result<Option<f64>>;

    /// Return every `Active` document to `Pending`. Run at startup, before
    /// any worker claims, to recover from a crash.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn reset_active_documents(&self) -> error::Result<u64>;

    /// Up to `limit` `BeingDeleted` documents of a job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn documents_being_deleted(&self, job: &JobId, limit: usize)
        -> error::Result<Vec<DocumentRecord>>;

    /// Delete document rows. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn purge_documents(&self, job: &JobId, identifiers: &[String]) -> error::Result<u64>;

    // -- fairness bins ------------------------------------------------------

    /// Atomically reserve `count` consecutive priority values for a
    /// (connector class, bin): `base = max(stored, starting_value)`, returns
    /// `base..base+count`, stores `base+count`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError); retryable errors mean the
    /// whole reservation was rolled back.
    fn grab_bin_values(
        &self,
        connector_class: &str,
        bin_name: &str,
        starting_value: f64,
        count: usize,
    ) -> error::Result<Vec<f64>>;

    // -- ingest status ------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn ingest_status(
        &self,
        output: &ConnectionName,
        document_key: &str,
    ) -> error::Result<Option<IngestStatus>>;

    /// Every output's ingest record for one document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn ingest_statuses(&self, document_key: &str) -> error::Result<Vec<IngestStatus>>;

    /// Insert or replace an ingest record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn record_ingest(&self, status: &IngestStatus) -> error::Result<()>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn remove_ingest(&self, output: &ConnectionName, document_key: &str) -> error::Result<()>;

    // -- activity history ---------------------------------------------------

    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn record_activity(&self, record: &ActivityRecord) -> error::Result<()>;

    /// Most recent records first, optionally for one connection.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn recent_activity(
        &self,
        connection: Option<&ConnectionName>,
        limit: usize,
    ) -> error::Result<Vec<ActivityRecord>>;
}
