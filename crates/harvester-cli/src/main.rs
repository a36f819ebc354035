mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Crawl repositories and keep search indexes in sync"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C
    Run {
        /// Path to engine config YAML
        config: PathBuf,
    },
    /// Validate the config and check every connection
    Check {
        /// Path to engine config YAML
        config: PathBuf,
    },
    /// Inspect and control jobs
    Job {
        /// Path to engine config YAML
        config: PathBuf,
        #[command(subcommand)]
        action: JobAction,
    },
    /// Show recent activity history
    History {
        /// Path to engine config YAML
        config: PathBuf,
        /// Only this connection
        #[arg(long)]
        connection: Option<String>,
        /// Maximum records to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Parse a specification file and print it normalized
    Spec {
        /// Path to a specification JSON file
        file: PathBuf,
    },
    /// List registered connector kinds
    Connectors,
}

#[derive(Subcommand)]
pub enum JobAction {
    /// List jobs with document counts
    List,
    /// Show one job as JSON
    Status { name: String },
    /// Start a job run
    Start { name: String },
    /// Pause a running job
    Pause { name: String },
    /// Resume a paused job
    Resume { name: String },
    /// Delete a job and remove its documents from every output
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { config } => commands::run::execute(&config).await,
        Commands::Check { config } => commands::check::execute(&config),
        Commands::Job { config, action } => commands::job::execute(&config, &action),
        Commands::History {
            config,
            connection,
            limit,
        } => commands::history::execute(&config, connection.as_deref(), limit),
        Commands::Spec { file } => commands::spec::execute(&file),
        Commands::Connectors => {
            commands::connectors::execute();
            Ok(())
        }
    }
}
