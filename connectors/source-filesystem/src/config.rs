//! Filesystem connector configuration and document-spec filters.

use std::path::{Path, PathBuf};

use regex::Regex;

use harvester_sdk::prelude::*;

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory whose files are crawled.
    pub root: PathBuf,
    /// Follow symbolic links while walking.
    pub follow_links: bool,
}

impl Config {
    /// # Errors
    ///
    /// `root` missing or empty, or `follow_links` not a boolean.
    pub fn from_params(params: &ConfigParams) -> Result<Self, ConnectorError> {
        let root = params
            .get("root")
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ConnectorError::config("INVALID_CONFIG", "'root' is required"))?;
        let follow_links = params.parse_or("follow_links", false).map_err(|(key, raw)| {
            ConnectorError::config("INVALID_CONFIG", format!("'{key}' must be true or false, got '{raw}'"))
        })?;
        Ok(Self {
            root: PathBuf::from(root),
            follow_links,
        })
    }

    /// Absolute path of a document identifier.
    #[must_use]
    pub fn resolve(&self, identifier: &str) -> PathBuf {
        self.root.join(identifier)
    }

    /// Identifier of a path under `root`: its relative path with `/`
    /// separators. `None` for paths outside `root`.
    #[must_use]
    pub fn identifier_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}

/// Filters and security read from a job's document specification.
///
/// - `include` nodes carry regexes matched against identifiers; a file is
///   crawled if any matches, or if there are none.
/// - `access` nodes carry allow tokens attached to every document.
#[derive(Debug, Default)]
pub struct DocumentRules {
    include: Vec<Regex>,
    pub access: AccessTokens,
}

impl DocumentRules {
    /// # Errors
    ///
    /// An `include` node without a value or with an invalid regex.
    pub fn from_spec(spec: &Specification) -> Result<Self, ConnectorError> {
        let mut include = Vec::new();
        for node in spec.children_of_type("include") {
            let pattern = node.value().ok_or_else(|| {
                ConnectorError::config("INVALID_SPEC", "'include' node has no pattern")
            })?;
            let regex = Regex::new(pattern).map_err(|e| {
                ConnectorError::config("INVALID_SPEC", format!("bad include pattern '{pattern}': {e}"))
            })?;
            include.push(regex);
        }
        let allow: Vec<String> = spec
            .children_of_type("access")
            .filter_map(SpecificationNode::value)
            .map(str::to_string)
            .collect();
        Ok(Self {
            include,
            access: AccessTokens::from_allow(allow),
        })
    }

    #[must_use]
    pub fn includes(&self, identifier: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_required() {
        let err = Config::from_params(&ConfigParams::new()).unwrap_err();
        assert_eq!(err.code, "INVALID_CONFIG");
        let err = Config::from_params(&ConfigParams::new().with("root", "  ")).unwrap_err();
        assert_eq!(err.code, "INVALID_CONFIG");
    }

    #[test]
    fn identifiers_are_relative_with_slashes() {
        let config = Config::from_params(&ConfigParams::new().with("root", "/data")).unwrap();
        assert_eq!(
            config.identifier_of(Path::new("/data/a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(config.identifier_of(Path::new("/data")), None);
        assert_eq!(config.identifier_of(Path::new("/elsewhere/x")), None);
        assert_eq!(config.resolve("a/b.txt"), PathBuf::from("/data/a/b.txt"));
    }

    #[test]
    fn include_rules_and_access_tokens() {
        let mut spec = Specification::new();
        spec.push_child(SpecificationNode::new("include").with_value(r"\.txt$"))
            .unwrap();
        spec.push_child(SpecificationNode::new("access").with_value("staff"))
            .unwrap();
        let rules = DocumentRules::from_spec(&spec).unwrap();
        assert!(rules.includes("notes/a.txt"));
        assert!(!rules.includes("img/a.png"));
        assert_eq!(rules.access.allow, vec!["staff".to_string()]);
        assert!(!rules.access.deny.is_empty());

        let open = DocumentRules::from_spec(&Specification::new()).unwrap();
        assert!(open.includes("anything"));
        assert!(open.access.is_empty());
    }

    #[test]
    fn bad_include_pattern_is_a_config_error() {
        let mut spec = Specification::new();
        spec.push_child(SpecificationNode::new("include").with_value("(")).unwrap();
        let err = DocumentRules::from_spec(&spec).unwrap_err();
        assert_eq!(err.code, "INVALID_SPEC");
    }
}
