pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::crawler::task::TaskKind;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; overrides --profile
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Configuration profile name
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file; the data directory's rescrape.log without a path
    #[arg(long, global = true)]
    pub log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume scrape tasks from the queue
    Worker,

    /// Run the recurring scheduler
    Scheduler,

    /// Serve the job status endpoints
    Serve,

    /// Worker, scheduler and status service in one process
    Run,

    /// Queue a single task
    Dispatch {
        /// Task type, e.g. scrape, seo-analysis, keyword-analysis
        #[arg(required = true)]
        kind: TaskKind,

        /// Target URL
        #[arg(required = true)]
        url: String,

        /// Tracked keyword (keyword-analysis)
        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Show the status of a job
    Status {
        #[arg(required = true)]
        kind: TaskKind,

        #[arg(required = true)]
        url: String,

        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Show configuration
    Config {
        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let source = commands::ConfigSource {
        path: cli.config,
        profile: cli.profile,
    };

    match cli.command {
        Commands::Worker => {
            info!("Starting worker");
            commands::worker(&source).await
        },
        Commands::Scheduler => {
            info!("Starting scheduler");
            commands::scheduler(&source).await
        },
        Commands::Serve => {
            info!("Starting status service");
            commands::serve(&source).await
        },
        Commands::Run => {
            info!("Starting all services");
            commands::run_all(&source).await
        },
        Commands::Dispatch { kind, url, keyword } => {
            info!("Dispatching {} for {}", kind, url);
            commands::dispatch(&source, kind, url, keyword).await
        },
        Commands::Status { kind, url, keyword } => {
            commands::status(&source, kind, url, keyword).await
        },
        Commands::Config { list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else {
                commands::show_config(&source).await
            }
        },
    }
}
