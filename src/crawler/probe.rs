use std::time::Duration;

use anyhow::{Result, Context};
use reqwest::Client;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::cli::config::ScrapeSettings;
use crate::crawler::robots::{self, RobotsError, RobotsPolicy};

/// Liveness of the target domain at scrape time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub reachable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Plain HTTP checks that run before any browser work
#[derive(Clone)]
pub struct SiteProbe {
    client: Client,
}

impl SiteProbe {
    pub fn new(settings: &ScrapeSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Fetch the robots policy for the URL's origin
    pub async fn robots(&self, url: &str) -> Result<RobotsPolicy, RobotsError> {
        robots::fetch_policy(&self.client, url).await
    }

    /// Probe whether the URL answers at all
    pub async fn domain_status(&self, url: &str) -> DomainStatus {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!("Domain probe for {} returned {}", url, status);
                DomainStatus {
                    reachable: !status.is_server_error(),
                    status_code: Some(status.as_u16()),
                    error: None,
                }
            }
            Err(e) => {
                warn!("Domain probe for {} failed: {}", url, e);
                DomainStatus {
                    reachable: false,
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
