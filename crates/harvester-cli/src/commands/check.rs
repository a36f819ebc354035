use std::path::Path;

use anyhow::Result;

use harvester_types::error::{ValidationResult, ValidationStatus};

use super::load_engine;

/// Execute the `check` command: validate the config and check every
/// connection.
pub fn execute(config_path: &Path) -> Result<()> {
    let engine = load_engine(config_path)?;
    println!("Engine config:     OK");
    println!("State backend:     OK");

    let mut all_ok = true;
    for check in engine.check_connections()? {
        let label = format!("{} ({}):", check.connection, check.kind);
        match &check.result {
            Ok(result) => {
                all_ok &= result.status != ValidationStatus::Failed;
                print_validation(&label, result);
            }
            Err(message) => {
                all_ok = false;
                println!("{label:30} FAILED");
                println!("  {message}");
            }
        }
    }

    if all_ok {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_validation(label: &str, result: &ValidationResult) {
    let status = match result.status {
        ValidationStatus::Success => "OK",
        ValidationStatus::Failed => "FAILED",
        ValidationStatus::Warning => "WARNING",
    };
    println!("{label:30} {status}");
    if !result.message.is_empty() {
        println!("  {}", result.message);
    }
}
