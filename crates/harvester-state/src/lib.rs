//! Persisted crawl state for the Harvester engine.
//!
//! Provides the [`StateBackend`] trait, the single source of truth for
//! connections, jobs, the document queue, fairness bin counters, ingest
//! status, and activity history, plus a [`SqliteStateBackend`] and (behind
//! the `postgres` feature) a `PostgresStateBackend`.
//!
//! Every trait method runs as one transaction. Transactions aborted by lock
//! contention are retried with randomized backoff by [`transaction::with_retry`].

#![warn(clippy::pedantic)]

pub mod backend;
mod codec;
pub mod error;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;
pub mod transaction;

pub use backend::StateBackend;
pub use error::StateError;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStateBackend;
pub use sqlite::SqliteStateBackend;

pub mod prelude {
    //! Backend trait, implementations, and the model types they persist.

    pub use crate::backend::{JobRunUpdate, SeedingProgress, StateBackend};
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateBackend;
    pub use harvester_types::connection::{Connection, ConnectionKind};
    pub use harvester_types::job::{Job, JobDescription};
    pub use harvester_types::state::{
        ActivityRecord, ConnectionName, DocumentCounts, DocumentOutcome, DocumentRecord,
        DocumentStatus, IngestStatus, JobId, JobStatus, NewDocument,
    };
}
