//! Connection model: a named, configured instance of a connector kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::state::{ConnectionName, UnknownStatus};

/// Default bound on concurrently checked-out connectors per connection.
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Which capability interface a connection's connector implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Repository,
    Transformation,
    Output,
}

impl ConnectionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Transformation => "transformation",
            Self::Output => "output",
        }
    }

    /// Position in the global acquisition order used by multi-pool grabs.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Repository => 0,
            Self::Transformation => 1,
            Self::Output => 2,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository" => Ok(Self::Repository),
            "transformation" => Ok(Self::Transformation),
            "output" => Ok(Self::Output),
            other => Err(UnknownStatus {
                kind: "connection kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Connector configuration parameters.
///
/// Ordered so two equal configurations compare and serialize identically;
/// pooled connectors are only reused for an identical configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigParams(BTreeMap<String, String>);

impl ConfigParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Parse a parameter, falling back to `default` when absent.
    ///
    /// # Errors
    ///
    /// Returns the parameter name and raw value when parsing fails.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, (String, String)> {
        match self.0.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| (key.to_string(), raw.clone())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Throttling limits for every bin whose name a document resolves to via
/// `bin_regex`. Absent limits are unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleBinDescription {
    pub bin_regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_kb_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fetches_per_minute: Option<u32>,
}

impl ThrottleBinDescription {
    #[must_use]
    pub fn new(bin_regex: impl Into<String>) -> Self {
        Self {
            bin_regex: bin_regex.into(),
            max_open_connections: None,
            max_kb_per_second: None,
            max_fetches_per_minute: None,
        }
    }
}

fn default_max_pool_size() -> usize {
    DEFAULT_MAX_POOL_SIZE
}

/// A persisted connection definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub name: ConnectionName,
    pub kind: ConnectionKind,
    /// Connector kind identifier resolved through the connector registry.
    pub connector: String,
    #[serde(default)]
    pub config: ConfigParams,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throttles: Vec<ThrottleBinDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Connection {
    #[must_use]
    pub fn new(
        name: impl Into<ConnectionName>,
        kind: ConnectionKind,
        connector: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            connector: connector.into(),
            config: ConfigParams::new(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            throttles: Vec::new(),
            description: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ConfigParams) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: ThrottleBinDescription) -> Self {
        self.throttles.push(throttle);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_rank_orders_repository_first() {
        let mut kinds = [
            ConnectionKind::Output,
            ConnectionKind::Repository,
            ConnectionKind::Transformation,
        ];
        kinds.sort_by_key(|k| k.rank());
        assert_eq!(
            kinds,
            [
                ConnectionKind::Repository,
                ConnectionKind::Transformation,
                ConnectionKind::Output
            ]
        );
    }

    #[test]
    fn config_params_parse_or() {
        let params = ConfigParams::new().with("depth", "4").with("bad", "x");
        assert_eq!(params.parse_or("depth", 1u32), Ok(4));
        assert_eq!(params.parse_or("missing", 7u32), Ok(7));
        assert_eq!(
            params.parse_or::<u32>("bad", 0),
            Err(("bad".to_string(), "x".to_string()))
        );
    }

    #[test]
    fn connection_defaults_from_yaml() {
        let conn: Connection = serde_yaml::from_str(
            "name: files\nkind: repository\nconnector: filesystem\nconfig:\n  root: /data\n",
        )
        .unwrap();
        assert_eq!(conn.max_pool_size, DEFAULT_MAX_POOL_SIZE);
        assert_eq!(conn.config.get("root"), Some("/data"));
        assert!(conn.throttles.is_empty());
    }
}
