use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::crawler::task::{keyword_task_key, task_key, TaskKind};
use crate::storage::cache::{JobStatus, JobStatusCache};

/// Read-only view of the job status cache
#[derive(Clone)]
pub struct StatusFacade {
    cache: Arc<dyn JobStatusCache>,
}

impl StatusFacade {
    pub fn new(cache: Arc<dyn JobStatusCache>) -> Self {
        Self { cache }
    }

    /// State of the `<url>-<type>` job; `None` on a miss
    pub async fn get_status(&self, url: &str, kind: TaskKind) -> Result<Option<JobStatus>> {
        self.cache.get(&task_key(url, kind)).await
    }

    /// State of the `<url>-keyword-<keyword>` job; `None` on a miss
    pub async fn get_keyword_status(&self, url: &str, keyword: &str) -> Result<Option<JobStatus>> {
        self.cache.get(&keyword_task_key(url, keyword)).await
    }
}

/// `{url, <echo>, status, result?, ...}` for a found job
pub fn status_body(url: &str, echo: (&str, &str), status: &JobStatus) -> Value {
    let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({ "status": status.name() }));
    body["url"] = json!(url);
    body[echo.0] = json!(echo.1);
    body
}

/// `{url, <echo>, message: "Job not found", data: null}` for a miss
pub fn not_found_body(url: &str, echo: (&str, &str)) -> Value {
    let mut body = json!({
        "url": url,
        "message": "Job not found",
        "data": null,
    });
    body[echo.0] = json!(echo.1);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::MemoryJobCache;
    use std::time::Duration;

    #[tokio::test]
    async fn test_processing_then_completed_reads_back_result() {
        let cache = Arc::new(MemoryJobCache::new());
        let facade = StatusFacade::new(cache.clone());
        let key = task_key("https://acme.test", TaskKind::ScrapeContactInfo);
        let result = json!({ "emails": ["hello@acme.test"], "phones": [], "social_links": [] });

        cache.set(&key, &JobStatus::processing(), Duration::from_secs(60)).await.unwrap();
        let status = facade.get_status("https://acme.test", TaskKind::ScrapeContactInfo).await.unwrap().unwrap();
        assert_eq!(status.name(), "processing");

        cache.set(&key, &JobStatus::completed(result.clone()), Duration::from_secs(60)).await.unwrap();
        let status = facade.get_status("https://acme.test", TaskKind::ScrapeContactInfo).await.unwrap().unwrap();
        assert_eq!(status.result(), Some(&result));
    }

    #[tokio::test]
    async fn test_miss_is_none() {
        let facade = StatusFacade::new(Arc::new(MemoryJobCache::new()));
        assert!(facade.get_keyword_status("https://acme.test", "tea").await.unwrap().is_none());
    }

    #[test]
    fn test_bodies() {
        let body = status_body("https://acme.test", ("type", "scrape"), &JobStatus::completed(json!([1, 2])));
        assert_eq!(body["status"], "completed");
        assert_eq!(body["result"], json!([1, 2]));
        assert_eq!(body["type"], "scrape");

        let miss = not_found_body("https://acme.test", ("keyword", "tea"));
        assert_eq!(miss["message"], "Job not found");
        assert!(miss["data"].is_null());
        assert_eq!(miss["keyword"], "tea");
    }
}
