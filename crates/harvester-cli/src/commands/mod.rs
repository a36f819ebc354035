pub mod check;
pub mod connectors;
pub mod history;
pub mod job;
pub mod run;
pub mod spec;

use std::path::Path;

use anyhow::{Context, Result};

use harvester_dest_null::NullOutput;
use harvester_engine::{parse_config, ConnectorRegistry, Engine};
use harvester_source_filesystem::FilesystemRepository;

/// Every connector compiled into the binary, plus the process bridge.
pub fn registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::with_builtins();
    registry.register_repository(harvester_source_filesystem::CONNECTOR_KIND, || {
        Box::new(FilesystemRepository::new())
    });
    registry.register_output(harvester_dest_null::CONNECTOR_KIND, || {
        Box::new(NullOutput::new())
    });
    registry
}

/// Parse, validate, and open the engine described by `config_path`.
pub fn load_engine(config_path: &Path) -> Result<Engine> {
    let config = parse_config(config_path)?;
    Engine::from_config(&config, &registry())
        .with_context(|| format!("Failed to load engine from {}", config_path.display()))
}
