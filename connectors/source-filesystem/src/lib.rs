//! Repository connector over a local directory tree.
//!
//! Identifiers are paths relative to the configured `root`, with `/`
//! separators. The version descriptor is `<mtime millis>:<length>`, with the
//! packed access tokens appended when the job specification grants any, so
//! touching a file or changing its ACL forces re-ingestion.

pub mod config;

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use harvester_sdk::prelude::*;

use crate::config::{Config, DocumentRules};

/// Connector kind under which this connector is registered.
pub const CONNECTOR_KIND: &str = "filesystem";

#[derive(Debug, Default)]
pub struct FilesystemRepository {
    config: Option<Config>,
}

impl FilesystemRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> Result<&Config, ConnectorError> {
        self.config
            .as_ref()
            .ok_or_else(|| ConnectorError::setup("NOT_CONNECTED", "connector used before connect"))
    }
}

fn io_error(path: &Path, err: &io::Error) -> ConnectorError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        io::ErrorKind::PermissionDenied => ConnectorError::document("PERMISSION_DENIED", message),
        _ => ConnectorError::service_interruption("IO_ERROR", message, None),
    }
}

fn version_of(metadata: &fs::Metadata, access: &AccessTokens) -> String {
    let modified = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or_default();
    let mut version = format!("{modified}:{}", metadata.len());
    if !access.is_empty() {
        version.push(':');
        version.push_str(&access.pack());
    }
    version
}

fn mime_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    };
    Some(mime)
}

impl Connector for FilesystemRepository {
    fn connect(&mut self, config: &ConfigParams) -> Result<(), ConnectorError> {
        self.config = Some(Config::from_params(config)?);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ConnectorError> {
        self.config = None;
        Ok(())
    }

    fn check(&mut self) -> Result<ValidationResult, ConnectorError> {
        let config = self.config()?;
        Ok(match fs::metadata(&config.root) {
            Ok(meta) if meta.is_dir() => {
                ValidationResult::success(format!("Crawling {}", config.root.display()))
            }
            Ok(_) => ValidationResult::failed(format!("{} is not a directory", config.root.display())),
            Err(e) => ValidationResult::failed(format!("{}: {e}", config.root.display())),
        })
    }

    fn is_connected(&self) -> bool {
        self.config.is_some()
    }
}

impl RepositoryConnector for FilesystemRepository {
    fn enumerate_seeds(
        &mut self,
        activity: &dyn SeedingActivity,
        spec: &Specification,
        _since: Option<DateTime<Utc>>,
    ) -> Result<(), ConnectorError> {
        let config = self.config()?;
        let rules = DocumentRules::from_spec(spec)?;
        if !config.root.is_dir() {
            return Err(ConnectorError::service_interruption(
                "ROOT_UNAVAILABLE",
                format!("{} is not a readable directory", config.root.display()),
                None,
            ));
        }

        let mut seeded = 0usize;
        let walker = WalkDir::new(&config.root)
            .follow_links(config.follow_links)
            .sort_by_file_name();
        for entry in walker {
            if activity.is_cancelled() {
                return Err(ConnectorError::interrupted("seeding cancelled"));
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(identifier) = config.identifier_of(entry.path()) else {
                continue;
            };
            if rules.includes(&identifier) {
                activity.add_seed(identifier)?;
                seeded += 1;
            }
        }
        tracing::debug!(root = %config.root.display(), seeded, "Filesystem seeding done");
        Ok(())
    }

    fn document_version(
        &mut self,
        identifier: &str,
        spec: &Specification,
        _activity: &dyn ActivityCallback,
    ) -> Result<Option<String>, ConnectorError> {
        let config = self.config()?;
        let rules = DocumentRules::from_spec(spec)?;
        if !rules.includes(identifier) {
            return Ok(None);
        }
        let path = config.resolve(identifier);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(version_of(&meta, &rules.access))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    fn fetch_document(
        &mut self,
        identifier: &str,
        _version: &str,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<FetchOutcome, ConnectorError> {
        let config = self.config()?;
        let rules = DocumentRules::from_spec(spec)?;
        let path = config.resolve(identifier);

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FetchOutcome::Excluded),
            Err(e) => return Err(io_error(&path, &e)),
        };
        let mime = mime_type_for(&path);
        if !activity.check_length_indexable(meta.len())
            || !mime.map_or(true, |m| activity.check_mime_type_indexable(m))
        {
            return Ok(FetchOutcome::Excluded);
        }

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FetchOutcome::Excluded),
            Err(e) => return Err(io_error(&path, &e)),
        };
        let mut document = RepositoryDocument::new(content).with_security(rules.access);
        if let Some(mime) = mime {
            document = document.with_mime_type(mime);
        }
        if let Some(name) = path.file_name() {
            document = document.with_file_name(name.to_string_lossy());
        }
        if let Ok(modified) = meta.modified() {
            document = document.with_modified(DateTime::<Utc>::from(modified));
        }

        let uri = format!("file://{}", path.display());
        Ok(FetchOutcome::Fetched { uri, document })
    }
}
