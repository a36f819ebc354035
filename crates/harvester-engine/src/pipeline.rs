//! Runs a fetched document through a job's transformation and output stages.
//!
//! Stages without a prerequisite consume the fetched document; the others
//! consume what their prerequisite transformation produced. A stage whose
//! input was filtered out is skipped, and an output stage skipped that way
//! counts as filtered for that output.
//!
//! An output that filtered a version keeps an ingest row with an empty URI
//! and that version, so it is not mistaken for an output that has never
//! seen the document.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use harvester_sdk::connector::{IngestResult, OutputConnector, TransformationConnector};
use harvester_sdk::document::RepositoryDocument;
use harvester_state::StateBackend;
use harvester_types::job::{HopcountMode, PipelineStage};
use harvester_types::state::{activity as activity_type, ConnectionName, IngestStatus};

use crate::activity::{record, ActivityEntry, ProcessActivity};
use crate::cancel::CancellationToken;
use crate::errors::ProcessError;
use crate::pool::PooledConnector;

pub type OutputLeases = HashMap<ConnectionName, PooledConnector<dyn OutputConnector>>;
pub type TransformationLeases = HashMap<ConnectionName, PooledConnector<dyn TransformationConnector>>;

/// Per-document context shared by every stage call.
pub struct StageContext<'a> {
    pub store: &'a dyn StateBackend,
    /// Ingest status key, `source:identifier`.
    pub document_key: &'a str,
    pub hopcount: HopcountMode,
    pub cancel: &'a CancellationToken,
}

impl<'a> StageContext<'a> {
    fn activity(&self, connection: &'a ConnectionName) -> ProcessActivity<'a> {
        ProcessActivity::new(self.store, connection, self.hopcount, self.cancel)
    }
}

/// What happened to one document across all output stages.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Outputs that now hold this version (accepted, rejected and noted,
    /// or already current).
    pub delivered: HashSet<ConnectionName>,
    /// Outputs whose branch filtered the document out.
    pub filtered: HashSet<ConnectionName>,
    /// `add_or_replace_document` calls made.
    pub ingest_calls: usize,
}

impl PipelineSummary {
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        self.delivered.is_empty()
    }
}

enum Delivery {
    Current,
    Ingested,
}

fn missing_lease(name: &ConnectionName) -> ProcessError {
    ProcessError::Infrastructure(anyhow::anyhow!("no connector checked out for '{name}'"))
}

/// Run `document` through `stages`.
///
/// Output stages not in `indexable` are treated as filtered. Outputs that
/// end up filtered and delivered by no other stage are not touched here;
/// the caller decides whether to remove earlier versions from them.
///
/// # Errors
///
/// The first connector or store failure, classified.
#[allow(clippy::too_many_arguments)]
pub fn run_pipeline(
    ctx: &StageContext<'_>,
    stages: &[PipelineStage],
    uri: &str,
    version: &str,
    document: &RepositoryDocument,
    indexable: &HashSet<ConnectionName>,
    transformations: &mut TransformationLeases,
    outputs: &mut OutputLeases,
) -> Result<PipelineSummary, ProcessError> {
    let mut summary = PipelineSummary::default();
    let mut produced: Vec<Option<RepositoryDocument>> = Vec::with_capacity(stages.len());

    for stage in stages {
        if ctx.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        let input = match stage.prerequisite {
            Some(pre) => produced.get(pre).cloned().flatten(),
            None => Some(document.clone()),
        };
        let Some(input) = input else {
            if stage.is_output {
                summary.filtered.insert(stage.connection.clone());
            }
            produced.push(None);
            continue;
        };

        if stage.is_output {
            produced.push(None);
            if !indexable.contains(&stage.connection) {
                summary.filtered.insert(stage.connection.clone());
                continue;
            }
            let output = outputs
                .get_mut(&stage.connection)
                .ok_or_else(|| missing_lease(&stage.connection))?;
            match deliver(ctx, &mut **output, &stage.connection, uri, version, &input, stage)? {
                Delivery::Current => {}
                Delivery::Ingested => summary.ingest_calls += 1,
            }
            summary.delivered.insert(stage.connection.clone());
        } else {
            let transformation = transformations
                .get_mut(&stage.connection)
                .ok_or_else(|| missing_lease(&stage.connection))?;
            let activity = ctx.activity(&stage.connection);
            let result =
                transformation.transform_document(uri, version, input, &stage.spec, &activity)?;
            if result.is_none() {
                tracing::debug!(
                    transformation = %stage.connection,
                    uri,
                    "Document filtered by transformation"
                );
            }
            produced.push(result);
        }
    }

    summary.filtered.retain(|name| !summary.delivered.contains(name));
    Ok(summary)
}

fn deliver(
    ctx: &StageContext<'_>,
    output: &mut dyn OutputConnector,
    name: &ConnectionName,
    uri: &str,
    version: &str,
    document: &RepositoryDocument,
    stage: &PipelineStage,
) -> Result<Delivery, ProcessError> {
    if let Some(previous) = ctx.store.ingest_status(name, ctx.document_key)? {
        if previous.uri == uri && previous.version.as_deref() == Some(version) {
            return Ok(Delivery::Current);
        }
        if previous.uri != uri {
            remove_ingested(ctx, output, name, &previous)?;
        }
    }

    let activity = ctx.activity(name);
    let start = Utc::now();
    let result = output.add_or_replace_document(uri, version, document, &stage.spec, &activity)?;
    let result_code = match result {
        IngestResult::Accepted => "OK",
        IngestResult::Rejected => "REJECTED",
    };
    record(
        ctx.store,
        name,
        &ActivityEntry {
            start: Some(start),
            activity_type: activity_type::INGEST,
            byte_count: Some(document.len()),
            entity_id: uri,
            result_code,
            description: None,
        },
    );
    ctx.store.record_ingest(&IngestStatus {
        output_connection: name.clone(),
        document_key: ctx.document_key.to_string(),
        uri: uri.to_string(),
        version: Some(version.to_string()),
        ingest_time: Utc::now(),
    })?;
    tracing::debug!(output = %name, uri, version, result = result_code, "Document ingested");
    Ok(Delivery::Ingested)
}

fn remove_ingested(
    ctx: &StageContext<'_>,
    output: &mut dyn OutputConnector,
    name: &ConnectionName,
    status: &IngestStatus,
) -> Result<(), ProcessError> {
    if status.uri.is_empty() {
        ctx.store.remove_ingest(name, ctx.document_key)?;
        return Ok(());
    }
    let activity = ctx.activity(name);
    let start = Utc::now();
    output.remove_document(&status.uri, status.version.as_deref(), &activity)?;
    ctx.store.remove_ingest(name, ctx.document_key)?;
    record(
        ctx.store,
        name,
        &ActivityEntry {
            start: Some(start),
            activity_type: activity_type::REMOVE,
            byte_count: None,
            entity_id: &status.uri,
            result_code: "OK",
            description: None,
        },
    );
    Ok(())
}

/// Remove the document from every output in `outputs` that holds it,
/// except those named in `keep`. Returns how many removals were made.
///
/// # Errors
///
/// The first connector or store failure, classified.
pub fn remove_from_outputs(
    ctx: &StageContext<'_>,
    outputs: &mut OutputLeases,
    keep: &HashSet<ConnectionName>,
) -> Result<usize, ProcessError> {
    let mut removed = 0;
    for (name, output) in outputs.iter_mut() {
        if keep.contains(name) {
            continue;
        }
        if ctx.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        if let Some(status) = ctx.store.ingest_status(name, ctx.document_key)? {
            remove_ingested(ctx, &mut **output, name, &status)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Note that each of `filtered` saw `version` and held nothing of it.
///
/// # Errors
///
/// Store failures.
pub fn record_filtered<'n>(
    ctx: &StageContext<'_>,
    filtered: impl IntoIterator<Item = &'n ConnectionName>,
    version: &str,
) -> Result<(), ProcessError> {
    for name in filtered {
        ctx.store.record_ingest(&IngestStatus {
            output_connection: name.clone(),
            document_key: ctx.document_key.to_string(),
            uri: String::new(),
            version: Some(version.to_string()),
            ingest_time: Utc::now(),
        })?;
    }
    Ok(())
}

/// Whether every one of `outputs` has a row for `version`, holding it or
/// having filtered it.
///
/// # Errors
///
/// Store failures.
pub fn outputs_current(
    ctx: &StageContext<'_>,
    outputs: &[ConnectionName],
    version: &str,
) -> Result<bool, ProcessError> {
    for name in outputs {
        match ctx.store.ingest_status(name, ctx.document_key)? {
            Some(status) if status.version.as_deref() == Some(version) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Outputs whose indexability predicates all accept this document.
#[must_use]
pub fn indexable_outputs(
    outputs: &OutputLeases,
    uri: &str,
    document: &RepositoryDocument,
) -> HashSet<ConnectionName> {
    outputs
        .iter()
        .filter(|(_, output)| {
            output.check_url_indexable(uri)
                && output.check_length_indexable(document.len())
                && document
                    .mime_type
                    .as_deref()
                    .map_or(true, |mime| output.check_mime_type_indexable(mime))
                && document
                    .modified
                    .map_or(true, |modified| output.check_date_indexable(modified))
        })
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use harvester_sdk::prelude::*;
    use harvester_state::SqliteStateBackend;
    use harvester_types::connection::{Connection, ConnectionKind};
    use harvester_types::state::document_key;

    use crate::registry::{ConnectorRegistry, PoolRegistry};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        log: Log,
        text_only: bool,
    }

    impl Connector for Recorder {
        fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    impl OutputConnector for Recorder {
        fn add_or_replace_document(
            &mut self,
            uri: &str,
            version: &str,
            _document: &RepositoryDocument,
            _spec: &Specification,
            _activity: &dyn ActivityCallback,
        ) -> Result<IngestResult, ConnectorError> {
            self.log.lock().unwrap().push(format!("add {uri} {version}"));
            Ok(IngestResult::Accepted)
        }

        fn remove_document(
            &mut self,
            uri: &str,
            _version: Option<&str>,
            _activity: &dyn ActivityCallback,
        ) -> Result<(), ConnectorError> {
            self.log.lock().unwrap().push(format!("remove {uri}"));
            Ok(())
        }

        fn check_mime_type_indexable(&self, mime_type: &str) -> bool {
            !self.text_only || mime_type == "text/plain"
        }
    }

    /// Drops documents whose content is empty, uppercases the rest.
    struct Shout;

    impl Connector for Shout {
        fn connect(&mut self, _config: &ConfigParams) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    impl TransformationConnector for Shout {
        fn transform_document(
            &mut self,
            _uri: &str,
            _version: &str,
            mut document: RepositoryDocument,
            _spec: &Specification,
            _activity: &dyn ActivityCallback,
        ) -> Result<Option<RepositoryDocument>, ConnectorError> {
            if document.is_empty() {
                return Ok(None);
            }
            document.content.make_ascii_uppercase();
            Ok(Some(document))
        }
    }

    struct Fixture {
        store: Arc<SqliteStateBackend>,
        pools: PoolRegistry,
        log: Log,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let log: Log = Arc::default();
        let mut registry = ConnectorRegistry::new();
        let l = Arc::clone(&log);
        registry.register_output("recorder", move || {
            Box::new(Recorder {
                log: Arc::clone(&l),
                text_only: false,
            })
        });
        let l = Arc::clone(&log);
        registry.register_output("text-recorder", move || {
            Box::new(Recorder {
                log: Arc::clone(&l),
                text_only: true,
            })
        });
        registry.register_transformation("shout", || Box::new(Shout));
        for (name, kind, connector) in [
            ("all", ConnectionKind::Output, "recorder"),
            ("text", ConnectionKind::Output, "text-recorder"),
            ("shout", ConnectionKind::Transformation, "shout"),
        ] {
            store.save_connection(&Connection::new(name, kind, connector)).unwrap();
        }
        let pools = PoolRegistry::new(&registry, store.clone(), Duration::from_secs(60));
        Fixture {
            store,
            pools,
            log,
            cancel: CancellationToken::new(),
        }
    }

    fn stages() -> Vec<PipelineStage> {
        vec![
            PipelineStage::transformation("shout"),
            PipelineStage::output("all").after(0),
            PipelineStage::output("text"),
        ]
    }

    #[test]
    fn routes_through_prerequisites_and_tracks_ingest() {
        let f = fixture();
        let key = document_key(&"files".into(), "/a.txt");
        let ctx = StageContext {
            store: &*f.store,
            document_key: &key,
            hopcount: HopcountMode::Accurate,
            cancel: &f.cancel,
        };
        let mut transformations: TransformationLeases = f
            .pools
            .transformations
            .grab(&"shout".into(), &f.cancel)
            .map(|lease| HashMap::from([(lease.connection().clone(), lease)]))
            .unwrap();
        let mut outputs = f
            .pools
            .grab_outputs(&["all".into(), "text".into()], &f.cancel)
            .unwrap();
        let doc = RepositoryDocument::new(b"hi".to_vec()).with_mime_type("text/plain");
        let indexable = indexable_outputs(&outputs, "file:///a.txt", &doc);
        assert_eq!(indexable.len(), 2);

        let summary = run_pipeline(
            &ctx,
            &stages(),
            "file:///a.txt",
            "v1",
            &doc,
            &indexable,
            &mut transformations,
            &mut outputs,
        )
        .unwrap();
        assert_eq!(summary.ingest_calls, 2);
        assert!(summary.filtered.is_empty());
        assert_eq!(
            f.store.ingest_status(&"all".into(), &key).unwrap().unwrap().version.as_deref(),
            Some("v1")
        );

        // Same version again: nothing is re-sent.
        let again = run_pipeline(
            &ctx,
            &stages(),
            "file:///a.txt",
            "v1",
            &doc,
            &indexable,
            &mut transformations,
            &mut outputs,
        )
        .unwrap();
        assert_eq!(again.ingest_calls, 0);
        assert_eq!(again.delivered.len(), 2);
        assert_eq!(f.log.lock().unwrap().len(), 2);
    }

    #[test]
    fn filtered_branch_and_uri_change() {
        let f = fixture();
        let key = document_key(&"files".into(), "/b");
        let ctx = StageContext {
            store: &*f.store,
            document_key: &key,
            hopcount: HopcountMode::Accurate,
            cancel: &f.cancel,
        };
        let mut transformations: TransformationLeases = f
            .pools
            .transformations
            .grab(&"shout".into(), &f.cancel)
            .map(|lease| HashMap::from([(lease.connection().clone(), lease)]))
            .unwrap();
        let mut outputs = f
            .pools
            .grab_outputs(&["all".into(), "text".into()], &f.cancel)
            .unwrap();

        let doc = RepositoryDocument::new(b"x".to_vec()).with_mime_type("text/plain");
        let indexable = indexable_outputs(&outputs, "file:///old", &doc);
        run_pipeline(&ctx, &stages(), "file:///old", "v1", &doc, &indexable, &mut transformations, &mut outputs)
            .unwrap();

        // Empty content is dropped by the transformation; `text` still takes it.
        let empty = RepositoryDocument::new(Vec::new()).with_mime_type("text/plain");
        let summary = run_pipeline(
            &ctx,
            &stages(),
            "file:///new",
            "v2",
            &empty,
            &indexable,
            &mut transformations,
            &mut outputs,
        )
        .unwrap();
        assert!(summary.filtered.contains(&ConnectionName::new("all")));
        assert!(summary.delivered.contains(&ConnectionName::new("text")));
        assert!(f.log.lock().unwrap().contains(&"remove file:///old".to_string()));

        let removed = remove_from_outputs(&ctx, &mut outputs, &summary.delivered).unwrap();
        assert_eq!(removed, 1);
        assert!(f.store.ingest_status(&"all".into(), &key).unwrap().is_none());

        // `all` saw v2 and filtered it; a later output has no row yet.
        let all = ConnectionName::new("all");
        let text = ConnectionName::new("text");
        assert!(!outputs_current(&ctx, &[all.clone(), text.clone()], "v2").unwrap());
        record_filtered(&ctx, [&all], "v2").unwrap();
        assert!(outputs_current(&ctx, &[all.clone(), text.clone()], "v2").unwrap());
        assert!(!outputs_current(&ctx, &[all, text, "later".into()], "v2").unwrap());
        assert!(!outputs_current(&ctx, &["text".into()], "v3").unwrap());

        // The marker is dropped without calling the connector.
        let before = f.log.lock().unwrap().len();
        remove_from_outputs(&ctx, &mut outputs, &HashSet::new()).unwrap();
        let log = f.log.lock().unwrap();
        assert_eq!(log[before..], ["remove file:///new".to_string()]);
        assert!(f.store.ingest_status(&"all".into(), &key).unwrap().is_none());
    }

    #[test]
    fn predicates_exclude_per_output() {
        let f = fixture();
        let outputs = f
            .pools
            .grab_outputs(&["all".into(), "text".into()], &f.cancel)
            .unwrap();
        let pdf = RepositoryDocument::new(b"%PDF".to_vec()).with_mime_type("application/pdf");
        let indexable = indexable_outputs(&outputs, "file:///c.pdf", &pdf);
        assert_eq!(indexable, HashSet::from([ConnectionName::new("all")]));
    }
}
