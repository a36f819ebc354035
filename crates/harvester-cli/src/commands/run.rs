use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use super::load_engine;

const FAILURE_POLL: Duration = Duration::from_millis(250);

/// Execute the `run` command: start every engine thread and stop on Ctrl-C
/// or on the first fatal error.
pub async fn execute(config_path: &Path) -> Result<()> {
    let engine = load_engine(config_path)?;
    let settings = &engine.context().settings;
    tracing::info!(
        config = %config_path.display(),
        workers = settings.workers,
        "Engine configured"
    );

    let handle = engine.start()?;
    println!("Harvester running. Press Ctrl-C to stop.");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupt received");
        }
        () = async {
            while !handle.is_stopping() {
                tokio::time::sleep(FAILURE_POLL).await;
            }
        } => {}
    }

    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("Shutdown task panicked")??;
    println!("Harvester stopped.");
    Ok(())
}
