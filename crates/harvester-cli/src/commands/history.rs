use std::path::Path;

use anyhow::Result;

use harvester_types::state::ConnectionName;

use super::load_engine;

/// Execute the `history` command: print recent activity, newest first.
pub fn execute(config_path: &Path, connection: Option<&str>, limit: usize) -> Result<()> {
    let engine = load_engine(config_path)?;
    let connection = connection.map(ConnectionName::new);
    let records = engine.store().recent_activity(connection.as_ref(), limit)?;
    if records.is_empty() {
        println!("No activity recorded.");
        return Ok(());
    }

    for record in records {
        let bytes = record
            .byte_count
            .map(|b| format!(" {b}B"))
            .unwrap_or_default();
        let elapsed = record
            .elapsed_ms
            .map(|ms| format!(" {ms}ms"))
            .unwrap_or_default();
        println!(
            "{} {:16} {:22} {:10} {}{bytes}{elapsed}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.connection.as_str(),
            record.activity_type,
            record.result_code,
            record.entity_id,
        );
        if let Some(description) = record.description {
            println!("    {description}");
        }
    }
    Ok(())
}
