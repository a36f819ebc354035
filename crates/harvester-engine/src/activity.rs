//! Activity callbacks handed to connectors.

use chrono::{DateTime, Utc};

use harvester_sdk::activity::{ActivityCallback, SeedingActivity};
use harvester_sdk::connector::OutputConnector;
use harvester_state::StateBackend;
use harvester_types::error::ConnectorError;
use harvester_types::job::HopcountMode;
use harvester_types::state::{ActivityRecord, ConnectionName};

use crate::cancel::CancellationToken;
use crate::channel::{ChannelError, CrossThreadChannel};

/// One history entry, as written by the engine itself.
pub struct ActivityEntry<'a> {
    pub start: Option<DateTime<Utc>>,
    pub activity_type: &'a str,
    pub byte_count: Option<u64>,
    pub entity_id: &'a str,
    pub result_code: &'a str,
    pub description: Option<&'a str>,
}

/// Persist an activity record; failures are logged, never returned.
pub fn record(store: &dyn StateBackend, connection: &ConnectionName, entry: &ActivityEntry<'_>) {
    let now = Utc::now();
    let elapsed_ms = entry
        .start
        .and_then(|start| u64::try_from((now - start).num_milliseconds()).ok());
    let record = ActivityRecord {
        timestamp: entry.start.unwrap_or(now),
        connection: connection.clone(),
        activity_type: entry.activity_type.to_string(),
        byte_count: entry.byte_count,
        entity_id: entry.entity_id.to_string(),
        result_code: entry.result_code.to_string(),
        description: entry.description.map(str::to_string),
        elapsed_ms,
    };
    if let Err(e) = store.record_activity(&record) {
        tracing::warn!(connection = %connection, error = %e, "Failed to record activity");
    }
}

/// Callback for document processing on behalf of one connection.
///
/// Indexability predicates ask every output in `outputs`; with none, they
/// accept everything.
pub struct ProcessActivity<'a> {
    store: &'a dyn StateBackend,
    connection: &'a ConnectionName,
    outputs: Vec<&'a dyn OutputConnector>,
    hopcount: HopcountMode,
    cancel: &'a CancellationToken,
}

impl<'a> ProcessActivity<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn StateBackend,
        connection: &'a ConnectionName,
        hopcount: HopcountMode,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            connection,
            outputs: Vec::new(),
            hopcount,
            cancel,
        }
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: Vec<&'a dyn OutputConnector>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl ActivityCallback for ProcessActivity<'_> {
    fn record_activity(
        &self,
        start: Option<DateTime<Utc>>,
        activity_type: &str,
        byte_count: Option<u64>,
        entity_id: &str,
        result_code: &str,
        description: Option<&str>,
    ) {
        record(
            self.store,
            self.connection,
            &ActivityEntry {
                start,
                activity_type,
                byte_count,
                entity_id,
                result_code,
                description,
            },
        );
    }

    fn check_url_indexable(&self, url: &str) -> bool {
        self.outputs.iter().all(|o| o.check_url_indexable(url))
    }

    fn check_mime_type_indexable(&self, mime_type: &str) -> bool {
        self.outputs.iter().all(|o| o.check_mime_type_indexable(mime_type))
    }

    fn check_length_indexable(&self, length: u64) -> bool {
        self.outputs.iter().all(|o| o.check_length_indexable(length))
    }

    fn check_date_indexable(&self, modified: DateTime<Utc>) -> bool {
        self.outputs.iter().all(|o| o.check_date_indexable(modified))
    }

    fn hopcount_mode(&self) -> HopcountMode {
        self.hopcount
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Seeding callback: discovered identifiers go onto the channel.
pub struct SeedingSink<'a> {
    activity: ProcessActivity<'a>,
    channel: &'a CrossThreadChannel<String>,
}

impl<'a> SeedingSink<'a> {
    #[must_use]
    pub fn new(activity: ProcessActivity<'a>, channel: &'a CrossThreadChannel<String>) -> Self {
        Self { activity, channel }
    }
}

impl ActivityCallback for SeedingSink<'_> {
    fn record_activity(
        &self,
        start: Option<DateTime<Utc>>,
        activity_type: &str,
        byte_count: Option<u64>,
        entity_id: &str,
        result_code: &str,
        description: Option<&str>,
    ) {
        self.activity.record_activity(
            start,
            activity_type,
            byte_count,
            entity_id,
            result_code,
            description,
        );
    }

    fn check_url_indexable(&self, url: &str) -> bool {
        self.activity.check_url_indexable(url)
    }

    fn check_mime_type_indexable(&self, mime_type: &str) -> bool {
        self.activity.check_mime_type_indexable(mime_type)
    }

    fn check_length_indexable(&self, length: u64) -> bool {
        self.activity.check_length_indexable(length)
    }

    fn check_date_indexable(&self, modified: DateTime<Utc>) -> bool {
        self.activity.check_date_indexable(modified)
    }

    fn hopcount_mode(&self) -> HopcountMode {
        self.activity.hopcount_mode()
    }

    fn is_cancelled(&self) -> bool {
        self.activity.is_cancelled() || self.channel.is_abandoned()
    }
}

impl SeedingActivity for SeedingSink<'_> {
    fn add_seed(&self, identifier: String) -> Result<(), ConnectorError> {
        match self.channel.add(identifier) {
            Ok(()) => Ok(()),
            Err(ChannelError::Abandoned) => Err(ConnectorError::interrupted("seeding abandoned")),
            Err(ChannelError::LockPoisoned) => Err(ConnectorError::internal(
                "CHANNEL_POISONED",
                "seeding channel lock poisoned",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_sdk::prelude::*;
    use harvester_state::SqliteStateBackend;

    struct PdfOnly;

    impl Connector for PdfOnly {
        fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    impl OutputConnector for PdfOnly {
        fn add_or_replace_document(
            &mut self,
            _uri: &str,
            _version: &str,
            _document: &RepositoryDocument,
            _spec: &Specification,
            _activity: &dyn ActivityCallback,
        ) -> Result<IngestResult, ConnectorError> {
            Ok(IngestResult::Accepted)
        }

        fn remove_document(
            &mut self,
            _uri: &str,
            _version: Option<&str>,
            _activity: &dyn ActivityCallback,
        ) -> Result<(), ConnectorError> {
            Ok(())
        }

        fn check_mime_type_indexable(&self, mime_type: &str) -> bool {
            mime_type == "application/pdf"
        }
    }

    struct AcceptAll;

    impl Connector for AcceptAll {
        fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    impl OutputConnector for AcceptAll {
        fn add_or_replace_document(
            &mut self,
            _uri: &str,
            _version: &str,
            _document: &RepositoryDocument,
            _spec: &Specification,
            _activity: &dyn ActivityCallback,
        ) -> Result<IngestResult, ConnectorError> {
            Ok(IngestResult::Accepted)
        }

        fn remove_document(
            &mut self,
            _uri: &str,
            _version: Option<&str>,
            _activity: &dyn ActivityCallback,
        ) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    #[test]
    fn predicates_require_every_output() {
        let store = SqliteStateBackend::in_memory().unwrap();
        let name = ConnectionName::new("files");
        let cancel = CancellationToken::new();
        let (pdf, all) = (PdfOnly, AcceptAll);
        let activity = ProcessActivity::new(&store, &name, HopcountMode::Accurate, &cancel)
            .with_outputs(vec![&pdf, &all]);
        assert!(activity.check_mime_type_indexable("application/pdf"));
        assert!(!activity.check_mime_type_indexable("text/plain"));
        assert!(activity.check_url_indexable("file:///x"));
    }

    #[test]
    fn recorded_activity_is_persisted() {
        let store = SqliteStateBackend::in_memory().unwrap();
        let name = ConnectionName::new("files");
        let cancel = CancellationToken::new();
        let activity = ProcessActivity::new(&store, &name, HopcountMode::NoDelete, &cancel);
        activity.record_activity(None, "fetch", Some(42), "/a.txt", "OK", None);
        let history = store.recent_activity(Some(&name), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].byte_count, Some(42));
        assert_eq!(activity.hopcount_mode(), HopcountMode::NoDelete);
    }

    #[test]
    fn seeds_flow_until_abandoned() {
        let store = SqliteStateBackend::in_memory().unwrap();
        let name = ConnectionName::new("files");
        let cancel = CancellationToken::new();
        let channel = CrossThreadChannel::new(4);
        let sink = SeedingSink::new(
            ProcessActivity::new(&store, &name, HopcountMode::Accurate, &cancel),
            &channel,
        );
        sink.add_seed("a".into()).unwrap();
        assert_eq!(channel.fetch_timeout(std::time::Duration::ZERO).unwrap(), crate::channel::Fetched::Item("a".to_string()));
        channel.abandon();
        assert!(sink.is_cancelled());
        let err = sink.add_seed("b".into()).unwrap_err();
        assert_eq!(err.category, harvester_types::error::ErrorCategory::Interrupted);
    }
}
