use anyhow::{Result, Context};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::browser::scraper::PageScraper;
use crate::crawler::probe::SiteProbe;
use crate::crawler::result::{AggregateScrapeResult, ContactInfo, Fallible, Industry, PageMetadata};
use crate::crawler::robots::{origin_of, RobotsPolicy, RobotsSummary};
use crate::crawler::task::{TaskKind, TaskMessage};
use crate::storage::cache::{JobStatus, JobStatusCache};

/// Turns one task into robots check, metadata and sub-scrapes, and merges
/// whatever each of them produced
pub struct ScrapeOrchestrator {
    probe: SiteProbe,
    scraper: Arc<dyn PageScraper>,
    cache: Arc<dyn JobStatusCache>,
    result_ttl: Duration,
}

/// Log a failed branch and substitute its fallback
fn or_fallback<T>(branch: &str, url: &str, result: Result<T>, fallback: impl FnOnce() -> T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("{} failed for {}: {:#}", branch, url, e);
            fallback()
        }
    }
}

fn logged<T>(branch: &str, url: &str, result: Result<T>) -> Fallible<T> {
    if let Err(e) = &result {
        warn!("{} failed for {}: {:#}", branch, url, e);
    }
    Fallible::from_result(result)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("Failed to serialize scrape result")
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl ScrapeOrchestrator {
    pub fn new(
        probe: SiteProbe,
        scraper: Arc<dyn PageScraper>,
        cache: Arc<dyn JobStatusCache>,
        result_ttl: Duration,
    ) -> Self {
        Self {
            probe,
            scraper,
            cache,
            result_ttl,
        }
    }

    /// Run a task and return its result payload
    pub async fn execute(&self, message: &TaskMessage) -> Result<Value> {
        match message.kind {
            TaskKind::Scrape => {
                let aggregate = self.full_scrape(&message.url).await;
                let value = to_json(&aggregate)?;

                // The bare-URL entry lives alongside the per-type job entry
                self.cache.set(&message.url, &JobStatus::completed(value.clone()), self.result_ttl).await?;

                Ok(value)
            }
            _ => self.single(message).await,
        }
    }

    /// Robots policy, failing closed when it cannot be evaluated
    async fn policy(&self, url: &str) -> (RobotsPolicy, RobotsSummary) {
        match self.probe.robots(url).await {
            Ok(policy) => {
                let summary = policy.summary();
                (policy, summary)
            }
            Err(e) => {
                warn!("Robots evaluation failed for {}, denying: {}", url, e);
                let origin = origin_of(url).unwrap_or_else(|_| url.to_string());
                (RobotsPolicy::deny_all(&origin), RobotsSummary::denied(e.to_string()))
            }
        }
    }

    async fn metadata_or_default(&self, url: &str) -> PageMetadata {
        or_fallback("Metadata scrape", url, self.scraper.metadata(url).await, PageMetadata::default)
    }

    /// Robots + liveness, then metadata, then every sub-scrape in parallel
    pub async fn full_scrape(&self, url: &str) -> AggregateScrapeResult {
        let started = Instant::now();

        // Stage 0
        let ((policy, robots), domain_status) = tokio::join!(
            self.policy(url),
            self.probe.domain_status(url),
        );

        if !policy.is_base_url_allowed() {
            info!("Robots policy forbids {}, skipping scrape", url);
            return AggregateScrapeResult::denied(url, robots, domain_status, elapsed_ms(started));
        }

        // Stage 1
        let metadata = self.metadata_or_default(url).await;

        // Stage 2
        let scraper = &self.scraper;
        let metadata_ref = &metadata;
        let policy_ref = &policy;
        let (industry, logo, images, contact_info, addresses, screenshot, seo) = tokio::join!(
            async {
                or_fallback("Industry classification", url,
                    scraper.classify_industry(url, metadata_ref).await, Industry::unknown)
            },
            async { logged("Logo scrape", url, scraper.logo(url, metadata_ref, policy_ref).await) },
            async { or_fallback("Image scrape", url, scraper.images(url).await, Vec::new) },
            async { or_fallback("Contact scrape", url, scraper.contact_info(url).await, ContactInfo::default) },
            async { or_fallback("Address scrape", url, scraper.addresses(url).await, Vec::new) },
            async { logged("Screenshot", url, scraper.screenshot(url).await) },
            async { logged("SEO analysis", url, scraper.seo(url, policy_ref).await) },
        );

        let elapsed = elapsed_ms(started);
        debug!("Full scrape of {} took {} ms", url, elapsed);

        AggregateScrapeResult {
            url: url.to_string(),
            robots,
            domain_status,
            metadata: Some(metadata),
            industry: Some(industry),
            logo: Some(logo),
            images: Some(images),
            contact_info: Some(contact_info),
            addresses: Some(addresses),
            screenshot: Some(screenshot),
            seo: Some(seo),
            elapsed_ms: elapsed,
        }
    }

    /// Robots, metadata if the branch needs it, then the one requested branch
    async fn single(&self, message: &TaskMessage) -> Result<Value> {
        let started = Instant::now();
        let url = message.url.as_str();
        let (policy, robots) = self.policy(url).await;

        if message.kind == TaskKind::ReadRobots {
            return to_json(&robots);
        }

        if !policy.is_base_url_allowed() {
            info!("Robots policy forbids {}, skipping {}", url, message.kind);
            return Ok(json!({ "url": url, "robots": robots }));
        }

        let (field, data) = match message.kind {
            TaskKind::ScrapeMetadata => ("metadata", to_json(&self.scraper.metadata(url).await?)?),
            TaskKind::ClassifyIndustry => {
                let metadata = self.metadata_or_default(url).await;
                ("industry", to_json(&self.scraper.classify_industry(url, &metadata).await?)?)
            }
            TaskKind::ScrapeLogo => {
                let metadata = self.metadata_or_default(url).await;
                ("logo", to_json(&self.scraper.logo(url, &metadata, &policy).await?)?)
            }
            TaskKind::ScrapeImages => ("images", to_json(&self.scraper.images(url).await?)?),
            TaskKind::Screenshot => ("screenshot", to_json(&self.scraper.screenshot(url).await?)?),
            TaskKind::ScrapeContactInfo => ("contact_info", to_json(&self.scraper.contact_info(url).await?)?),
            TaskKind::ScrapeAddresses => ("addresses", to_json(&self.scraper.addresses(url).await?)?),
            TaskKind::SeoAnalysis => ("seo", to_json(&self.scraper.seo(url, &policy).await?)?),
            TaskKind::KeywordAnalysis => {
                let keyword = message.keyword.as_deref().context("keyword-analysis task without keyword")?;
                let report = self.scraper.keyword(url, keyword).await?;
                return Ok(json!({
                    "url": url,
                    "keyword": keyword,
                    "report": report,
                    "elapsed_ms": elapsed_ms(started),
                }));
            }
            TaskKind::Scrape | TaskKind::ReadRobots => unreachable_kind(message.kind)?,
        };

        let mut result = json!({
            "url": url,
            "robots": robots,
            "elapsed_ms": elapsed_ms(started),
        });
        result[field] = data;

        Ok(result)
    }
}

fn unreachable_kind(kind: impl Display) -> Result<(&'static str, Value)> {
    anyhow::bail!("{} is not a single-branch task", kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scraper::MockPageScraper;
    use crate::cli::config::ScrapeSettings;
    use crate::crawler::result::{Screenshot, SeoReport, KeywordReport};
    use crate::storage::cache::MemoryJobCache;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn site(robots: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(robots)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    fn orchestrator(scraper: MockPageScraper, cache: Arc<MemoryJobCache>) -> ScrapeOrchestrator {
        ScrapeOrchestrator::new(
            SiteProbe::new(&ScrapeSettings::default()).unwrap(),
            Arc::new(scraper),
            cache,
            Duration::from_secs(60),
        )
    }

    fn stage_two_expectations(scraper: &mut MockPageScraper) {
        scraper.expect_classify_industry().times(1).returning(|_, _| Err(anyhow::anyhow!("classifier down")));
        scraper.expect_logo().times(1).returning(|_, _, _| Ok(Some("https://cdn.test/logo.png".to_string())));
        scraper.expect_images().times(1).returning(|_| Ok(vec!["https://cdn.test/a.jpg".to_string()]));
        scraper.expect_contact_info().times(1).returning(|_| Err(anyhow::anyhow!("timeout")));
        scraper.expect_addresses().times(1).returning(|_| Ok(vec![]));
        scraper.expect_screenshot().times(1).returning(|_| Ok(Screenshot { png_base64: "iVBORw==".to_string() }));
        scraper.expect_seo().times(1).returning(|_, _| Err(anyhow::anyhow!("render failed")));
    }

    #[tokio::test]
    async fn test_robots_denial_short_circuits() {
        let server = site(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n")).await;

        // No expectations: any sub-scrape call would panic
        let scraper = MockPageScraper::new();
        let result = orchestrator(scraper, Arc::new(MemoryJobCache::new())).full_scrape(&server.uri()).await;

        assert!(!result.robots.allowed);
        assert!(result.domain_status.reachable);
        assert!(result.metadata.is_none());
        assert!(result.industry.is_none());
        assert!(result.logo.is_none());
        assert!(result.images.is_none());
        assert!(result.contact_info.is_none());
        assert!(result.addresses.is_none());
        assert!(result.screenshot.is_none());
        assert!(result.seo.is_none());
    }

    #[tokio::test]
    async fn test_robots_fetch_error_fails_closed() {
        let server = site(ResponseTemplate::new(500)).await;

        let scraper = MockPageScraper::new();
        let result = orchestrator(scraper, Arc::new(MemoryJobCache::new())).full_scrape(&server.uri()).await;

        assert!(!result.robots.allowed);
        assert!(result.robots.error.is_some());
        assert!(result.metadata.is_none());
    }

    #[tokio::test]
    async fn test_metadata_failure_degrades_and_stage_two_runs() {
        let server = site(ResponseTemplate::new(404)).await;

        let mut scraper = MockPageScraper::new();
        scraper.expect_metadata().times(1).returning(|_| Err(anyhow::anyhow!("page crashed")));
        stage_two_expectations(&mut scraper);

        let result = orchestrator(scraper, Arc::new(MemoryJobCache::new())).full_scrape(&server.uri()).await;

        assert!(result.robots.allowed);
        assert_eq!(result.metadata, Some(PageMetadata::default()));
        assert_eq!(result.industry, Some(Industry::unknown()));
        assert_eq!(result.images, Some(vec!["https://cdn.test/a.jpg".to_string()]));
        assert_eq!(result.contact_info, Some(ContactInfo::default()));
        assert_eq!(
            result.logo.as_ref().and_then(|l| l.value().cloned()),
            Some(Some("https://cdn.test/logo.png".to_string()))
        );
        assert!(result.screenshot.as_ref().and_then(|s| s.value()).is_some());
        assert!(result.seo.as_ref().and_then(|s| s.value()).is_none());

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["metadata"]["title"], Value::Null);
        assert_eq!(value["seo"]["error"], "render failed");
    }

    #[tokio::test]
    async fn test_full_scrape_task_writes_bare_url_entry() {
        let server = site(ResponseTemplate::new(404)).await;

        let mut scraper = MockPageScraper::new();
        scraper.expect_metadata().times(1).returning(|_| {
            Ok(PageMetadata { title: Some("Acme".to_string()), ..PageMetadata::default() })
        });
        stage_two_expectations(&mut scraper);

        let cache = Arc::new(MemoryJobCache::new());
        let message = TaskMessage::new(TaskKind::Scrape, server.uri());
        let value = orchestrator(scraper, cache.clone()).execute(&message).await.unwrap();

        assert_eq!(value["metadata"]["title"], "Acme");
        let stored = cache.get(&server.uri()).await.unwrap().unwrap();
        assert_eq!(stored.result(), Some(&value));
    }

    #[tokio::test]
    async fn test_single_branch_task_runs_only_that_branch() {
        let server = site(ResponseTemplate::new(404)).await;

        let mut scraper = MockPageScraper::new();
        scraper.expect_seo().times(1).returning(|_, _| Ok(SeoReport::from_checks(vec![])));

        let cache = Arc::new(MemoryJobCache::new());
        let message = TaskMessage::new(TaskKind::SeoAnalysis, server.uri());
        let value = orchestrator(scraper, cache.clone()).execute(&message).await.unwrap();

        assert_eq!(value["seo"]["score"], 0);
        assert_eq!(value["robots"]["allowed"], true);
        assert!(cache.get(&server.uri()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_branch_error_propagates() {
        let server = site(ResponseTemplate::new(404)).await;

        let mut scraper = MockPageScraper::new();
        scraper.expect_images().times(1).returning(|_| Err(anyhow::anyhow!("no session")));

        let message = TaskMessage::new(TaskKind::ScrapeImages, server.uri());
        let result = orchestrator(scraper, Arc::new(MemoryJobCache::new())).execute(&message).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_keyword_task() {
        let server = site(ResponseTemplate::new(404)).await;

        let mut scraper = MockPageScraper::new();
        scraper.expect_keyword().times(1).returning(|_, keyword| {
            Ok(KeywordReport {
                keyword: keyword.to_string(),
                in_title: true,
                in_description: false,
                in_headings: 2,
                occurrences: 7,
                density: 1.5,
            })
        });

        let message = TaskMessage::keyword(server.uri(), "tea");
        let value = orchestrator(scraper, Arc::new(MemoryJobCache::new())).execute(&message).await.unwrap();

        assert_eq!(value["keyword"], "tea");
        assert_eq!(value["report"]["occurrences"], 7);
    }

    #[tokio::test]
    async fn test_read_robots_task() {
        let server = site(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /cart\n")).await;

        let message = TaskMessage::new(TaskKind::ReadRobots, server.uri());
        let value = orchestrator(MockPageScraper::new(), Arc::new(MemoryJobCache::new()))
            .execute(&message)
            .await
            .unwrap();

        assert_eq!(value["allowed"], true);
        assert_eq!(value["disallowed_paths"], json!(["/cart"]));
    }
}
