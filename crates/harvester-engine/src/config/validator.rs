//! Semantic validation for parsed engine configuration.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use regex::Regex;

use harvester_types::connection::{Connection, ConnectionKind};
use harvester_types::state::ConnectionName;

use crate::config::types::EngineConfig;

fn validate_connection(connection: &Connection, errors: &mut Vec<String>) {
    let context = format!("connection '{}'", connection.name);
    if connection.name.as_str().trim().is_empty() {
        errors.push("Connection name must not be empty".to_string());
    }
    if connection.connector.trim().is_empty() {
        errors.push(format!("{context}: connector must not be empty"));
    }
    if connection.max_pool_size == 0 {
        errors.push(format!("{context}: max_pool_size must be at least 1"));
    }
    for throttle in &connection.throttles {
        if let Err(e) = Regex::new(&throttle.bin_regex) {
            errors.push(format!(
                "{context}: invalid throttle bin_regex '{}': {e}",
                throttle.bin_regex
            ));
        }
        if throttle.max_open_connections == Some(0) {
            errors.push(format!("{context}: max_open_connections must be at least 1"));
        }
        if throttle.max_kb_per_second == Some(0) {
            errors.push(format!("{context}: max_kb_per_second must be at least 1"));
        }
        if throttle.max_fetches_per_minute == Some(0) {
            errors.push(format!("{context}: max_fetches_per_minute must be at least 1"));
        }
    }
}

fn expect_kind(
    kinds: &HashMap<&ConnectionName, ConnectionKind>,
    name: &ConnectionName,
    expected: ConnectionKind,
    context: &str,
    errors: &mut Vec<String>,
) {
    match kinds.get(name) {
        None => errors.push(format!("{context}: unknown connection '{name}'")),
        Some(kind) if *kind != expected => errors.push(format!(
            "{context}: connection '{name}' is a {kind} connection, expected {expected}"
        )),
        Some(_) => {}
    }
}

/// Validate a parsed engine configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the config.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    let mut errors = Vec::new();

    match (config.state.backend.as_str(), &config.state.connection) {
        ("sqlite", _) => {}
        ("postgres", Some(_)) => {}
        ("postgres", None) => {
            errors.push("State backend 'postgres' requires a connection string".to_string());
        }
        (other, _) => errors.push(format!(
            "Unsupported state backend '{other}', expected 'sqlite' or 'postgres'"
        )),
    }

    let settings = &config.engine;
    for (value, name) in [
        (settings.workers, "workers"),
        (settings.claim_batch_size, "claim_batch_size"),
        (settings.seeding_batch_size, "seeding_batch_size"),
        (settings.deletion_batch_size, "deletion_batch_size"),
        (settings.channel_capacity, "channel_capacity"),
    ] {
        if value == 0 {
            errors.push(format!("{name} must be at least 1"));
        }
    }
    if settings.poll_interval_ms == 0 {
        errors.push("poll_interval_ms must be at least 1".to_string());
    }
    if settings.janitor_interval_ms == 0 {
        errors.push("janitor_interval_ms must be at least 1".to_string());
    }

    let mut kinds: HashMap<&ConnectionName, ConnectionKind> = HashMap::new();
    for connection in &config.connections {
        if kinds.insert(&connection.name, connection.kind).is_some() {
            errors.push(format!("Duplicate connection name '{}'", connection.name));
        }
        validate_connection(connection, &mut errors);
    }

    let mut job_names = HashSet::new();
    for job in &config.jobs {
        let context = format!("job '{}'", job.name);
        if job.name.trim().is_empty() {
            errors.push("Job name must not be empty".to_string());
        }
        if !job_names.insert(job.name.as_str()) {
            errors.push(format!("Duplicate job name '{}'", job.name));
        }
        expect_kind(&kinds, &job.source, ConnectionKind::Repository, &context, &mut errors);
        for (index, stage) in job.pipeline.iter().enumerate() {
            let expected = if stage.is_output {
                ConnectionKind::Output
            } else {
                ConnectionKind::Transformation
            };
            expect_kind(
                &kinds,
                &stage.connection,
                expected,
                &format!("{context} stage {index}"),
                &mut errors,
            );
        }
        errors.extend(job.pipeline_problems());
        if job.priority == 0 {
            errors.push(format!("{context}: priority must be at least 1"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Engine config validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_config_str;

    fn valid_yaml() -> &'static str {
        r#"
connections:
  - name: files
    kind: repository
    connector: filesystem
  - name: strip
    kind: transformation
    connector: process
  - name: sink
    kind: output
    connector: "null"
jobs:
  - name: crawl
    source: files
    pipeline:
      - connection: strip
      - connection: sink
        is_output: true
        prerequisite: 0
"#
    }

    fn errors_for(yaml: &str) -> String {
        let config = parse_config_str(yaml).unwrap();
        validate_config(&config).unwrap_err().to_string()
    }

    #[test]
    fn valid_config_passes() {
        let config = parse_config_str(valid_yaml()).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn unknown_backend_fails() {
        let yaml = format!("state:\n  backend: mysql\n{}", valid_yaml());
        assert!(errors_for(&yaml).contains("Unsupported state backend 'mysql'"));
    }

    #[test]
    fn postgres_needs_connection() {
        let yaml = format!("state:\n  backend: postgres\n{}", valid_yaml());
        assert!(errors_for(&yaml).contains("requires a connection string"));
    }

    #[test]
    fn unknown_reference_and_wrong_kind() {
        let yaml = valid_yaml()
            .replace("source: files", "source: sink")
            .replace("- connection: strip", "- connection: nowhere");
        let err = errors_for(&yaml);
        assert!(err.contains("is a output connection, expected repository"), "{err}");
        assert!(err.contains("unknown connection 'nowhere'"), "{err}");
    }

    #[test]
    fn bad_regex_and_zero_pool() {
        let yaml = valid_yaml().replace(
            "    connector: filesystem\n",
            "    connector: filesystem\n    max_pool_size: 0\n    throttles:\n      - bin_regex: \"(\"\n",
        );
        let err = errors_for(&yaml);
        assert!(err.contains("max_pool_size must be at least 1"), "{err}");
        assert!(err.contains("invalid throttle bin_regex"), "{err}");
    }

    #[test]
    fn duplicate_names_are_reported_together() {
        let yaml = format!(
            "{}  - name: crawl\n    source: files\n    pipeline:\n      - connection: sink\n        is_output: true\n",
            valid_yaml().replace("  - name: strip\n    kind: transformation", "  - name: files\n    kind: transformation")
        );
        let err = errors_for(&yaml);
        assert!(err.contains("Duplicate connection name 'files'"), "{err}");
        assert!(err.contains("Duplicate job name 'crawl'"), "{err}");
    }

    #[test]
    fn forward_prerequisite_and_missing_output() {
        let yaml = valid_yaml()
            .replace("        is_output: true\n        prerequisite: 0\n", "        prerequisite: 5\n");
        let err = errors_for(&yaml);
        assert!(err.contains("no output stage"), "{err}");
        assert!(err.contains("prerequisite 5"), "{err}");
    }

    #[test]
    fn zero_workers_fails() {
        let yaml = format!("engine:\n  workers: 0\n{}", valid_yaml());
        assert!(errors_for(&yaml).contains("workers must be at least 1"));
    }
}
