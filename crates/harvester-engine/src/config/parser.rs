//! Engine YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::EngineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        match std::env::var(&cap[1]) {
            Ok(val) => val,
            Err(_) => {
                missing.push(cap[1].to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse an engine YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<EngineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: EngineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse engine config YAML")?;
    Ok(config)
}

/// Parse an engine YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read engine config file: {}", path.display()))?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_types::connection::ConnectionKind;

    #[test]
    fn env_var_substitution() {
        std::env::set_var("HV_TEST_ROOT", "/srv/docs");
        let result = substitute_env_vars("root: ${HV_TEST_ROOT}\nagain: ${HV_TEST_ROOT}").unwrap();
        assert_eq!(result, "root: /srv/docs\nagain: /srv/docs");
        std::env::remove_var("HV_TEST_ROOT");
    }

    #[test]
    fn missing_env_vars_are_all_reported() {
        let err = substitute_env_vars("a: ${HV_NOPE_ONE}\nb: ${HV_NOPE_TWO}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("HV_NOPE_ONE"));
        assert!(err.contains("HV_NOPE_TWO"));
    }

    #[test]
    fn no_env_vars_passthrough() {
        let input = "workers: 4";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
state:
  backend: sqlite
  connection: /tmp/hv.db
engine:
  workers: 2
connections:
  - name: files
    kind: repository
    connector: filesystem
    config:
      root: /data
    throttles:
      - bin_regex: "^/data/([^/]+)/"
        max_fetches_per_minute: 12
  - name: sink
    kind: output
    connector: "null"
jobs:
  - name: crawl
    source: files
    pipeline:
      - connection: sink
        is_output: true
"#;
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.state.connection.as_deref(), Some("/tmp/hv.db"));
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.connections[0].kind, ConnectionKind::Repository);
        assert_eq!(config.connections[0].throttles[0].max_fetches_per_minute, Some(12));
        assert_eq!(config.jobs[0].output_connections().len(), 1);
    }

    #[test]
    fn invalid_yaml_has_context() {
        let err = parse_config_str("connections: [").unwrap_err();
        assert!(err.to_string().contains("Failed to parse engine config YAML"));
    }

    #[test]
    fn missing_file_names_path() {
        let err = parse_config(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }
}
