//! Persisted state model types.
//!
//! Pure data types used by `StateBackend` implementations. Kept in the
//! types crate so the engine, the state backends, and connectors can share
//! them without circular dependencies.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job identifier from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for JobId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Name of a persisted connection (repository, transformation, or output).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionName(String);

impl ConnectionName {
    /// Create a new connection name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for ConnectionName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Error returned when a stored status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status '{value}'")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotYetRun,
    Running,
    Pausing,
    Paused,
    Completing,
    Notifying,
    Inactive,
    Error,
    Deleting,
    Deleted,
}

impl JobStatus {
    /// Storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotYetRun => "not_yet_run",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Completing => "completing",
            Self::Notifying => "notifying",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// Statuses from which an operator or schedule may start the job.
    #[must_use]
    pub fn is_startable(self) -> bool {
        matches!(self, Self::NotYetRun | Self::Inactive | Self::Error)
    }

    /// Whether documents of a job in this status may still be Active.
    #[must_use]
    pub fn has_live_documents(self) -> bool {
        matches!(self, Self::Running | Self::Pausing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "not_yet_run" => Self::NotYetRun,
            "running" => Self::Running,
            "pausing" => Self::Pausing,
            "paused" => Self::Paused,
            "completing" => Self::Completing,
            "notifying" => Self::Notifying,
            "inactive" => Self::Inactive,
            "error" => Self::Error,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            other => {
                return Err(UnknownStatus {
                    kind: "job",
                    value: other.to_string(),
                })
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Document status
// ---------------------------------------------------------------------------

/// Status of a document queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Active,
    Completed,
    Error,
    Deleted,
    BeingDeleted,
}

impl DocumentStatus {
    /// Storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Deleted => "deleted",
            Self::BeingDeleted => "being_deleted",
        }
    }

    /// Terminal for the current run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Deleted)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "active" => Self::Active,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "deleted" => Self::Deleted,
            "being_deleted" => Self::BeingDeleted,
            other => {
                return Err(UnknownStatus {
                    kind: "document",
                    value: other.to_string(),
                })
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Document queue rows
// ---------------------------------------------------------------------------

/// A document to insert into a job's queue during seeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub identifier: String,
    pub priority: f64,
    /// Fairness bin the priority was drawn from; empty when unthrottled.
    pub bin_name: String,
}

/// A persisted document queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub job_id: JobId,
    pub identifier: String,
    pub priority: f64,
    pub status: DocumentStatus,
    pub bin_name: String,
    pub last_version: Option<String>,
    pub fail_count: u32,
    pub retry_count: u32,
    pub check_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// How a worker finished with an Active document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    /// Processed (or skipped as unchanged); `version` becomes the stored version.
    Completed { version: Option<String> },
    /// Source object gone or excluded by filters.
    Deleted,
    /// Permanent failure for this run.
    Failed { message: String },
    /// Transient failure; eligible again at `check_time`.
    Retry {
        check_time: DateTime<Utc>,
        message: String,
    },
    /// Hand the document back untouched (cancellation, job abort).
    Requeue,
}

/// Per-status document counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub error: u64,
    pub deleted: u64,
    pub being_deleted: u64,
}

impl DocumentCounts {
    /// Documents still waiting for or undergoing processing.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.pending + self.active
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.active + self.completed + self.error + self.deleted + self.being_deleted
    }

    /// Add one row with the given status.
    pub fn record(&mut self, status: DocumentStatus, count: u64) {
        match status {
            DocumentStatus::Pending => self.pending += count,
            DocumentStatus::Active => self.active += count,
            DocumentStatus::Completed => self.completed += count,
            DocumentStatus::Error => self.error += count,
            DocumentStatus::Deleted => self.deleted += count,
            DocumentStatus::BeingDeleted => self.being_deleted += count,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest status
// ---------------------------------------------------------------------------

/// What one output connection currently holds for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStatus {
    pub output_connection: ConnectionName,
    /// `<source connection>:<document identifier>`.
    pub document_key: String,
    pub uri: String,
    /// `None` marks an ingest that was attempted but never confirmed.
    pub version: Option<String>,
    pub ingest_time: DateTime<Utc>,
}

/// Build the key an ingest status row is stored under.
#[must_use]
pub fn document_key(source: &ConnectionName, identifier: &str) -> String {
    format!("{source}:{identifier}")
}

// ---------------------------------------------------------------------------
// Activity history
// ---------------------------------------------------------------------------

/// One entry in the activity history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub connection: ConnectionName,
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<u64>,
    pub entity_id: String,
    pub result_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Activity type names recorded by the engine itself.
pub mod activity {
    pub const FETCH: &str = "fetch";
    pub const INGEST: &str = "document ingest";
    pub const REMOVE: &str = "document deletion";
    pub const SEED: &str = "seeding";
    pub const JOB_COMPLETE: &str = "job end notification";
    pub const PROCESS_ERROR: &str = "process error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_display_and_as_str() {
        let id = JobId::new("job-1");
        assert_eq!(id.as_str(), "job-1");
        assert_eq!(id.to_string(), "job-1");
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn job_status_parses_its_own_storage_string() {
        for status in [
            JobStatus::NotYetRun,
            JobStatus::Running,
            JobStatus::Pausing,
            JobStatus::Paused,
            JobStatus::Completing,
            JobStatus::Notifying,
            JobStatus::Inactive,
            JobStatus::Error,
            JobStatus::Deleting,
            JobStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<JobStatus>().is_err());
    }

    #[test]
    fn unknown_document_status_names_value() {
        let err = "lost".parse::<DocumentStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown document status 'lost'");
    }

    #[test]
    fn document_counts_in_flight() {
        let mut counts = DocumentCounts::default();
        counts.record(DocumentStatus::Pending, 3);
        counts.record(DocumentStatus::Active, 2);
        counts.record(DocumentStatus::Completed, 7);
        assert_eq!(counts.in_flight(), 5);
        assert_eq!(counts.total(), 12);
    }

    #[test]
    fn startable_statuses() {
        assert!(JobStatus::NotYetRun.is_startable());
        assert!(JobStatus::Inactive.is_startable());
        assert!(!JobStatus::Running.is_startable());
        assert!(!JobStatus::Deleting.is_startable());
    }

    #[test]
    fn document_key_joins_source_and_identifier() {
        let key = document_key(&ConnectionName::new("files"), "/a/b.txt");
        assert_eq!(key, "files:/a/b.txt");
    }
}
