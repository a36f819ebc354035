//! Output connector that accepts every document and keeps nothing.
//!
//! Useful for dry runs: the engine still tracks ingest status, so a second
//! crawl over unchanged content sends nothing here.

use harvester_sdk::prelude::*;

/// Connector kind under which this connector is registered.
pub const CONNECTOR_KIND: &str = "null";

#[derive(Debug, Default)]
pub struct NullOutput {
    accepted: u64,
    removed: u64,
}

impl NullOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    #[must_use]
    pub fn removed(&self) -> u64 {
        self.removed
    }
}

impl Connector for NullOutput {
    fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
        Ok(())
    }
}

impl OutputConnector for NullOutput {
    fn add_or_replace_document(
        &mut self,
        uri: &str,
        version: &str,
        document: &RepositoryDocument,
        _spec: &Specification,
        _activity: &dyn ActivityCallback,
    ) -> Result<IngestResult, ConnectorError> {
        self.accepted += 1;
        tracing::debug!(uri, version, bytes = document.len(), "Discarding document");
        Ok(IngestResult::Accepted)
    }

    fn remove_document(
        &mut self,
        uri: &str,
        _version: Option<&str>,
        _activity: &dyn ActivityCallback,
    ) -> Result<(), ConnectorError> {
        self.removed += 1;
        tracing::debug!(uri, "Discarding removal");
        Ok(())
    }

    fn note_job_complete(&mut self, _activity: &dyn ActivityCallback) -> Result<(), ConnectorError> {
        tracing::debug!(
            accepted = self.accepted,
            removed = self.removed,
            "Job complete"
        );
        Ok(())
    }
}
