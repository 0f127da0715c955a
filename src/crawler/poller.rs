use anyhow::{Result, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::cli::config::ScrapeSettings;
use crate::crawler::task::{keyword_task_key, task_key, TaskKind, TaskMessage};
use crate::server::facade::StatusFacade;
use crate::storage::cache::JobStatus;

/// A job the scheduler waits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    Scrape { url: String },
    Keyword { url: String, keyword: String },
}

impl PollTarget {
    /// Target matching a published message
    pub fn for_message(message: &TaskMessage) -> Self {
        match &message.keyword {
            Some(keyword) => PollTarget::Keyword { url: message.url.clone(), keyword: keyword.clone() },
            None => PollTarget::Scrape { url: message.url.clone() },
        }
    }

    /// Job status cache key
    pub fn cache_key(&self) -> String {
        match self {
            PollTarget::Scrape { url } => task_key(url, TaskKind::Scrape),
            PollTarget::Keyword { url, keyword } => keyword_task_key(url, keyword),
        }
    }
}

/// Where job status is read from while polling
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Current state of the job; `None` when nothing is recorded yet
    async fn fetch(&self, target: &PollTarget) -> Result<Option<JobStatus>>;
}

#[async_trait]
impl StatusSource for StatusFacade {
    async fn fetch(&self, target: &PollTarget) -> Result<Option<JobStatus>> {
        match target {
            PollTarget::Scrape { url } => self.get_status(url, TaskKind::Scrape).await,
            PollTarget::Keyword { url, keyword } => self.get_keyword_status(url, keyword).await,
        }
    }
}

/// Polls the status endpoints of a running service
pub struct HttpStatusClient {
    client: Client,
    base_url: String,
}

impl HttpStatusClient {
    pub fn new(base_url: &str, settings: &ScrapeSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusClient {
    async fn fetch(&self, target: &PollTarget) -> Result<Option<JobStatus>> {
        let request = match target {
            PollTarget::Scrape { url } => self.client
                .get(format!("{}/status", self.base_url))
                .query(&[("type", TaskKind::Scrape.as_str()), ("url", url.as_str())]),
            PollTarget::Keyword { url, keyword } => self.client
                .get(format!("{}/keyword-status", self.base_url))
                .query(&[("url", url.as_str()), ("keyword", keyword.as_str())]),
        };

        let response = request.send()
            .await
            .context("Failed to reach status endpoint")?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("No status yet for {}", target.cache_key());
            return Ok(None);
        }

        let status = response.error_for_status()
            .context("Status endpoint returned an error")?
            .json::<JobStatus>()
            .await
            .context("Failed to parse job status")?;

        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpStatusClient {
        HttpStatusClient::new(&format!("{}/", server.uri()), &ScrapeSettings::default()).unwrap()
    }

    #[test]
    fn test_targets_follow_messages() {
        let scrape = PollTarget::for_message(&TaskMessage::new(TaskKind::Scrape, "https://acme.test"));
        assert_eq!(scrape.cache_key(), "https://acme.test-scrape");

        let keyword = PollTarget::for_message(&TaskMessage::keyword("https://acme.test", "tea"));
        assert_eq!(keyword.cache_key(), "https://acme.test-keyword-tea");
        assert_eq!(keyword, PollTarget::Keyword { url: "https://acme.test".to_string(), keyword: "tea".to_string() });
    }

    #[tokio::test]
    async fn test_http_completed_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .and(query_param("type", "scrape"))
            .and(query_param("url", "https://acme.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "https://acme.test",
                "type": "scrape",
                "status": "completed",
                "result": { "url": "https://acme.test" },
                "completed_at": "2026-01-01T00:00:00Z",
            })))
            .mount(&server)
            .await;

        let status = client(&server)
            .fetch(&PollTarget::Scrape { url: "https://acme.test".to_string() })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.result(), Some(&json!({ "url": "https://acme.test" })));
    }

    #[tokio::test]
    async fn test_http_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keyword-status"))
            .and(query_param("keyword", "tea"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "url": "https://acme.test",
                "message": "Job not found",
                "data": null,
            })))
            .mount(&server)
            .await;

        let target = PollTarget::Keyword { url: "https://acme.test".to_string(), keyword: "tea".to_string() };
        assert!(client(&server).fetch(&target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_server_error_is_err() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let target = PollTarget::Scrape { url: "https://acme.test".to_string() };
        assert!(client(&server).fetch(&target).await.is_err());
    }
}
