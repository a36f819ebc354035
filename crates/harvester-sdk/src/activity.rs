//! Activity callbacks handed to connectors.

use chrono::{DateTime, Utc};

use harvester_types::error::ConnectorError;
use harvester_types::job::HopcountMode;

/// Accounting and indexability queries available during any connector call.
pub trait ActivityCallback {
    /// Record an entry in the activity history. `start` defaults to now.
    /// Recording never fails from the connector's point of view.
    fn record_activity(
        &self,
        start: Option<DateTime<Utc>>,
        activity_type: &str,
        byte_count: Option<u64>,
        entity_id: &str,
        result_code: &str,
        description: Option<&str>,
    );

    /// Whether every downstream output would index a document at `url`.
    fn check_url_indexable(&self, url: &str) -> bool;

    fn check_mime_type_indexable(&self, mime_type: &str) -> bool;

    fn check_length_indexable(&self, length: u64) -> bool;

    fn check_date_indexable(&self, modified: DateTime<Utc>) -> bool;

    /// Hop-count handling declared on the owning job.
    fn hopcount_mode(&self) -> HopcountMode {
        HopcountMode::default()
    }

    /// Whether the engine asked the current operation to stop. Long-running
    /// connector loops should check this and return
    /// [`ConnectorError::interrupted`].
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Activity handed to [`enumerate_seeds`](crate::connector::RepositoryConnector::enumerate_seeds).
pub trait SeedingActivity: ActivityCallback {
    /// Queue one discovered identifier. Blocks while the engine's commit
    /// side is behind.
    ///
    /// # Errors
    ///
    /// Returns an `Interrupted` error once seeding was abandoned; the
    /// connector should stop enumerating and return it.
    fn add_seed(&self, identifier: String) -> Result<(), ConnectorError>;
}

/// Callback that records nothing and accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivity;

impl ActivityCallback for NoopActivity {
    fn record_activity(
        &self,
        _start: Option<DateTime<Utc>>,
        _activity_type: &str,
        _byte_count: Option<u64>,
        _entity_id: &str,
        _result_code: &str,
        _description: Option<&str>,
    ) {
    }

    fn check_url_indexable(&self, _url: &str) -> bool {
        true
    }

    fn check_mime_type_indexable(&self, _mime_type: &str) -> bool {
        true
    }

    fn check_length_indexable(&self, _length: u64) -> bool {
        true
    }

    fn check_date_indexable(&self, _modified: DateTime<Utc>) -> bool {
        true
    }
}
