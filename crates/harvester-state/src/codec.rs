//! Column encoding shared by the SQL backends.
//!
//! Timestamps are stored as epoch milliseconds, statuses as their
//! `as_str` form, and connection/job definitions as JSON text.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use harvester_types::job::Job;
use harvester_types::state::{
    ActivityRecord, ConnectionName, DocumentOutcome, DocumentRecord, DocumentStatus,
    IngestStatus, JobId,
};

use crate::error::{self, StateError};

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn opt_to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_millis)
}

pub(crate) fn from_millis(millis: i64) -> error::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StateError::corrupt(format!("timestamp out of range: {millis}")))
}

pub(crate) fn opt_from_millis(millis: Option<i64>) -> error::Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

pub(crate) fn parse_status<T>(raw: &str) -> error::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| StateError::corrupt(e.to_string()))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> error::Result<String> {
    serde_json::to_string(value).map_err(|e| StateError::corrupt(format!("encode: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> error::Result<T> {
    serde_json::from_str(raw).map_err(|e| StateError::corrupt(format!("decode: {e}")))
}

/// Clamp an unsigned count into a signed SQL integer.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Read back a signed SQL counter as unsigned.
pub(crate) fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn from_sql_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub(crate) fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Raw rows
// ---------------------------------------------------------------------------

/// Column list matching [`JobRow`] field order.
pub(crate) const JOB_COLUMNS: &str = "id, description, status, seeding_complete, \
     last_seed_time, next_seed_time, start_time, end_time, error_message";

/// Column list matching [`DocumentRow`] field order.
pub(crate) const DOCUMENT_COLUMNS: &str = "job_id, identifier, priority, status, bin_name, \
     last_version, fail_count, retry_count, check_time, error_message";

pub(crate) const INGEST_COLUMNS: &str =
    "output_connection, document_key, uri, version, ingest_time";

pub(crate) const ACTIVITY_COLUMNS: &str = "occurred_at, connection, activity_type, byte_count, \
     entity_id, result_code, description, elapsed_ms";

/// A `jobs` row as read from either backend.
pub(crate) struct JobRow {
    pub id: String,
    pub description: String,
    pub status: String,
    pub seeding_complete: bool,
    pub last_seed_time: Option<i64>,
    pub next_seed_time: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error_message: Option<String>,
}

impl JobRow {
    pub(crate) fn decode(self) -> error::Result<Job> {
        Ok(Job {
            id: JobId::new(self.id),
            description: from_json(&self.description)?,
            status: parse_status(&self.status)?,
            seeding_complete: self.seeding_complete,
            last_seed_time: opt_from_millis(self.last_seed_time)?,
            next_seed_time: opt_from_millis(self.next_seed_time)?,
            start_time: opt_from_millis(self.start_time)?,
            end_time: opt_from_millis(self.end_time)?,
            error_message: self.error_message,
        })
    }
}

pub(crate) struct DocumentRow {
    pub job_id: String,
    pub identifier: String,
    pub priority: f64,
    pub status: String,
    pub bin_name: String,
    pub last_version: Option<String>,
    pub fail_count: i64,
    pub retry_count: i64,
    pub check_time: Option<i64>,
    pub error_message: Option<String>,
}

impl DocumentRow {
    pub(crate) fn decode(self) -> error::Result<DocumentRecord> {
        Ok(DocumentRecord {
            job_id: JobId::new(self.job_id),
            identifier: self.identifier,
            priority: self.priority,
            status: parse_status(&self.status)?,
            bin_name: self.bin_name,
            last_version: self.last_version,
            fail_count: from_sql_u32(self.fail_count),
            retry_count: from_sql_u32(self.retry_count),
            check_time: opt_from_millis(self.check_time)?,
            error_message: self.error_message,
        })
    }
}

pub(crate) struct IngestRow {
    pub output_connection: String,
    pub document_key: String,
    pub uri: String,
    pub version: Option<String>,
    pub ingest_time: i64,
}

impl IngestRow {
    pub(crate) fn decode(self) -> error::Result<IngestStatus> {
        Ok(IngestStatus {
            output_connection: ConnectionName::new(self.output_connection),
            document_key: self.document_key,
            uri: self.uri,
            version: self.version,
            ingest_time: from_millis(self.ingest_time)?,
        })
    }
}

pub(crate) struct ActivityRow {
    pub occurred_at: i64,
    pub connection: String,
    pub activity_type: String,
    pub byte_count: Option<i64>,
    pub entity_id: String,
    pub result_code: String,
    pub description: Option<String>,
    pub elapsed_ms: Option<i64>,
}

impl ActivityRow {
    pub(crate) fn decode(self) -> error::Result<ActivityRecord> {
        Ok(ActivityRecord {
            timestamp: from_millis(self.occurred_at)?,
            connection: ConnectionName::new(self.connection),
            activity_type: self.activity_type,
            byte_count: self.byte_count.map(from_sql_count),
            entity_id: self.entity_id,
            result_code: self.result_code,
            description: self.description,
            elapsed_ms: self.elapsed_ms.map(from_sql_count),
        })
    }
}

/// Column values a [`DocumentOutcome`] writes to an `Active` row.
pub(crate) struct OutcomeUpdate {
    pub status: DocumentStatus,
    /// `Some(v)` overwrites `last_version` with `v`; `None` leaves it.
    pub last_version: Option<Option<String>>,
    pub fail_increment: i64,
    /// `None` resets the counter to zero.
    pub retry_increment: Option<i64>,
    pub check_time: Option<i64>,
    pub error_message: Option<String>,
}

impl OutcomeUpdate {
    pub(crate) fn from_outcome(outcome: &DocumentOutcome) -> Self {
        match outcome {
            DocumentOutcome::Completed { version } => Self {
                status: DocumentStatus::Completed,
                last_version: Some(version.clone()),
                fail_increment: 0,
                retry_increment: None,
                check_time: None,
                error_message: None,
            },
            DocumentOutcome::Deleted => Self {
                status: DocumentStatus::Deleted,
                last_version: Some(None),
                fail_increment: 0,
                retry_increment: None,
                check_time: None,
                error_message: None,
            },
            DocumentOutcome::Failed { message } => Self {
                status: DocumentStatus::Error,
                last_version: None,
                fail_increment: 1,
                retry_increment: None,
                check_time: None,
                error_message: Some(message.clone()),
            },
            DocumentOutcome::Retry {
                check_time,
                message,
            } => Self {
                status: DocumentStatus::Pending,
                last_version: None,
                fail_increment: 0,
                retry_increment: Some(1),
                check_time: Some(to_millis(*check_time)),
                error_message: Some(message.clone()),
            },
            DocumentOutcome::Requeue => Self {
                status: DocumentStatus::Pending,
                last_version: None,
                fail_increment: 0,
                retry_increment: Some(0),
                check_time: None,
                error_message: None,
            },
        }
    }

    /// Whether `last_version` is overwritten.
    pub(crate) fn sets_version(&self) -> bool {
        self.last_version.is_some()
    }

    pub(crate) fn version_value(&self) -> Option<&str> {
        self.last_version.as_ref().and_then(Option::as_deref)
    }

    /// Whether `retry_count` keeps its value plus [`Self::retry_delta`].
    pub(crate) fn keeps_retry_count(&self) -> bool {
        self.retry_increment.is_some()
    }

    pub(crate) fn retry_delta(&self) -> i64 {
        self.retry_increment.unwrap_or(0)
    }
}
