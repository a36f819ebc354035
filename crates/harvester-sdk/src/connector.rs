//! Blocking connector traits.
//!
//! Every method runs on an engine worker thread while the connector is
//! checked out of its pool, so implementations may block on network I/O.
//! A pooled instance is never used by two threads at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use harvester_types::connection::ConfigParams;
use harvester_types::error::{ConnectorError, ValidationResult};
use harvester_types::spec::Specification;

use crate::activity::{ActivityCallback, SeedingActivity};
use crate::document::RepositoryDocument;

/// Default check response for connectors that do not implement one.
///
/// # Errors
///
/// Never fails; the signature matches [`Connector::check`].
pub fn default_check() -> Result<ValidationResult, ConnectorError> {
    Ok(ValidationResult::success("Connection working"))
}

/// Lifecycle shared by every connector kind.
pub trait Connector: Send {
    /// Establish the connector against its configuration. Called once per
    /// pooled instance before first use.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`]; `Config`/`Setup` categories are fatal
    /// to the job that triggered the grab.
    fn connect(&mut self, config: &ConfigParams) -> Result<(), ConnectorError>;

    /// Release everything the connector holds.
    ///
    /// # Errors
    ///
    /// Errors are logged by the pool and otherwise ignored.
    fn disconnect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Idle hook: free expensive external resources (sessions, sockets)
    /// without fully disconnecting.
    ///
    /// # Errors
    ///
    /// Errors are logged by the janitor and otherwise ignored.
    fn poll(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Report whether the connection works.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] if the check itself could not run.
    fn check(&mut self) -> Result<ValidationResult, ConnectorError> {
        default_check()
    }

    /// Whether the instance is still usable. Unhealthy instances are
    /// discarded on release instead of returning to the idle set.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Result of [`RepositoryConnector::fetch_document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FetchOutcome {
    /// The document, keyed in output indexes by `uri`.
    Fetched {
        uri: String,
        document: RepositoryDocument,
    },
    /// The connector's own filters exclude the document.
    Excluded,
}

/// Source of documents.
pub trait RepositoryConnector: Connector {
    /// Discover top-level identifiers and hand each one to
    /// [`SeedingActivity::add_seed`]. `since` is the start time of the
    /// previous seeding pass, `None` on the first.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`]; a retryable one postpones seeding.
    fn enumerate_seeds(
        &mut self,
        activity: &dyn SeedingActivity,
        spec: &Specification,
        since: Option<DateTime<Utc>>,
    ) -> Result<(), ConnectorError>;

    /// Current version descriptor of a document, or `None` if it no longer
    /// exists. Equal descriptors mean re-ingestion can be skipped.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the engine.
    fn document_version(
        &mut self,
        identifier: &str,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<Option<String>, ConnectorError>;

    /// Fetch a document whose version changed.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the engine.
    fn fetch_document(
        &mut self,
        identifier: &str,
        version: &str,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<FetchOutcome, ConnectorError>;
}

/// Pipeline stage that rewrites documents on their way to outputs.
pub trait TransformationConnector: Connector {
    /// Transform a document. `Ok(None)` filters it out of every stage
    /// downstream of this one.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the engine.
    fn transform_document(
        &mut self,
        uri: &str,
        version: &str,
        document: RepositoryDocument,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<Option<RepositoryDocument>, ConnectorError>;
}

/// Whether an output accepted a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestResult {
    Accepted,
    /// The output refuses this document; it is not retried until its
    /// version changes.
    Rejected,
}

/// Destination index.
pub trait OutputConnector: Connector {
    /// Add a document, replacing any earlier version stored under `uri`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the engine.
    fn add_or_replace_document(
        &mut self,
        uri: &str,
        version: &str,
        document: &RepositoryDocument,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<IngestResult, ConnectorError>;

    /// Remove a previously added document.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the engine.
    fn remove_document(
        &mut self,
        uri: &str,
        version: Option<&str>,
        activity: &dyn ActivityCallback,
    ) -> Result<(), ConnectorError>;

    /// Called once per job run after every document reached a terminal
    /// status.
    ///
    /// # Errors
    ///
    /// Retryable errors are retried on the next notification pass;
    /// `Config`/`Setup` errors shut the engine down.
    fn note_job_complete(&mut self, activity: &dyn ActivityCallback) -> Result<(), ConnectorError> {
        let _ = activity;
        Ok(())
    }

    fn check_url_indexable(&self, url: &str) -> bool {
        let _ = url;
        true
    }

    fn check_mime_type_indexable(&self, mime_type: &str) -> bool {
        let _ = mime_type;
        true
    }

    fn check_length_indexable(&self, length: u64) -> bool {
        let _ = length;
        true
    }

    fn check_date_indexable(&self, modified: DateTime<Utc>) -> bool {
        let _ = modified;
        true
    }
}
