//! The document representation passed between pipeline stages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acl::AccessTokens;

/// Content plus metadata of one fetched document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDocument {
    pub content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub security: AccessTokens,
}

impl RepositoryDocument {
    #[must_use]
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    #[must_use]
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    #[must_use]
    pub fn with_security(mut self, security: AccessTokens) -> Self {
        self.security = security;
        self
    }

    /// Append a value to a metadata field.
    pub fn add_metadata(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.metadata.entry(field.into()).or_default().push(value.into());
    }

    #[must_use]
    pub fn metadata_values(&self, field: &str) -> &[String] {
        self.metadata.get(field).map_or(&[], Vec::as_slice)
    }

    /// Content length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_accumulates_values() {
        let mut doc = RepositoryDocument::new(b"hello".to_vec()).with_mime_type("text/plain");
        doc.add_metadata("author", "a");
        doc.add_metadata("author", "b");
        assert_eq!(doc.metadata_values("author"), ["a", "b"]);
        assert!(doc.metadata_values("missing").is_empty());
        assert_eq!(doc.len(), 5);
    }
}
