use std::path::Path;

use anyhow::Result;

use crate::JobAction;

use super::load_engine;

/// Execute a `job` subcommand.
pub fn execute(config_path: &Path, action: &JobAction) -> Result<()> {
    let engine = load_engine(config_path)?;
    let jobs = engine.jobs();

    match action {
        JobAction::List => {
            let reports = jobs.list()?;
            if reports.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            println!(
                "{:24} {:12} {:>8} {:>8} {:>10} {:>8}",
                "JOB", "STATUS", "PENDING", "ACTIVE", "COMPLETED", "ERROR"
            );
            for report in reports {
                let c = &report.counts;
                println!(
                    "{:24} {:12} {:>8} {:>8} {:>10} {:>8}",
                    report.job.description.name,
                    report.job.status.to_string(),
                    c.pending,
                    c.active,
                    c.completed,
                    c.error
                );
            }
        }
        JobAction::Status { name } => {
            let report = jobs.status(name)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        JobAction::Start { name } => report(name, "started", jobs.start(name)?),
        JobAction::Pause { name } => report(name, "pausing", jobs.pause(name)?),
        JobAction::Resume { name } => report(name, "resumed", jobs.resume(name)?),
        JobAction::Delete { name } => report(name, "being deleted", jobs.delete(name)?),
    }
    Ok(())
}

fn report(name: &str, what: &str, changed: bool) {
    if changed {
        println!("Job '{name}' {what}.");
    } else {
        println!("Job '{name}' unchanged: not in a state that allows this.");
    }
}
