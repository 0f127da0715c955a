use anyhow::{Result, Context};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::AppConfig;
use crate::crawler::controller::{shutdown_signal, Controller, DispatchOutcome};
use crate::crawler::task::{TaskKind, TaskMessage};
use crate::storage::schedules;

/// Where the configuration comes from
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub profile: Option<String>,
}

impl ConfigSource {
    fn load(&self) -> Result<AppConfig> {
        AppConfig::resolve(self.path.as_deref(), self.profile.as_deref())
            .context("Failed to load configuration")
    }
}

async fn connect(source: &ConfigSource) -> Result<(AppConfig, Controller)> {
    let config = source.load()?;
    let controller = Controller::connect(config.clone()).await?;
    Ok((config, controller))
}

fn task_message(kind: TaskKind, url: String, keyword: Option<String>) -> TaskMessage {
    match keyword {
        Some(keyword) if kind == TaskKind::KeywordAnalysis => TaskMessage::keyword(url, keyword),
        _ => TaskMessage::new(kind, url),
    }
}

/// Consume tasks until Ctrl-C
pub async fn worker(source: &ConfigSource) -> Result<()> {
    let (_, controller) = connect(source).await?;
    controller.run_worker(shutdown_signal()).await
}

/// Run the recurring scheduler until Ctrl-C
pub async fn scheduler(source: &ConfigSource) -> Result<()> {
    let (config, controller) = connect(source).await?;
    let store = schedules::create_store(&config.storage).await?;
    controller.run_scheduler(store, shutdown_signal()).await
}

/// Serve the status endpoints until Ctrl-C
pub async fn serve(source: &ConfigSource) -> Result<()> {
    let (config, controller) = connect(source).await?;
    let store = schedules::create_store(&config.storage).await?;
    controller.serve(store, shutdown_signal()).await
}

/// Everything in one process until Ctrl-C
pub async fn run_all(source: &ConfigSource) -> Result<()> {
    let (config, controller) = connect(source).await?;
    let store = schedules::create_store(&config.storage).await?;
    controller.run_all(store, shutdown_signal()).await
}

/// Queue one task
pub async fn dispatch(source: &ConfigSource, kind: TaskKind, url: String, keyword: Option<String>) -> Result<()> {
    let (_, controller) = connect(source).await?;

    match controller.dispatch(task_message(kind, url, keyword)).await? {
        DispatchOutcome::Cached(result) => {
            println!("Already completed:");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        DispatchOutcome::Published(message) => {
            println!("Queued {} ({})", message.task_key(), message.id);
            println!("Use `rescrape status {} {}` to check on it", message.kind, message.url);
        }
    }

    Ok(())
}

/// Print the status of a job
pub async fn status(source: &ConfigSource, kind: TaskKind, url: String, keyword: Option<String>) -> Result<()> {
    let (_, controller) = connect(source).await?;
    let message = task_message(kind, url, keyword);

    match controller.status(&message).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => println!("Job not found: {}", message.task_key()),
    }

    Ok(())
}

/// List all configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = AppConfig::list_profiles()?;

    if profiles.is_empty() {
        println!("No profiles in {}", AppConfig::config_dir().join("profiles").display());
    } else {
        println!("Available profiles:");
        for profile in profiles {
            println!("  - {}", profile);
        }
    }

    Ok(())
}

/// Print the effective configuration
pub async fn show_config(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    info!("Configuration directory: {}", AppConfig::config_dir().display());

    let yaml = serde_yaml::to_string(&config)
        .context("Failed to serialize configuration")?;
    println!("{}", yaml);

    Ok(())
}
