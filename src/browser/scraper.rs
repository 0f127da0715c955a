use anyhow::{Result, Context};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Serialize, Deserialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::browser::extract;
use crate::browser::pool::BrowserPool;
use crate::cli::config::ScrapeSettings;
use crate::crawler::result::{ContactInfo, Industry, KeywordReport, PageMetadata, Screenshot, SeoReport};
use crate::crawler::robots::RobotsPolicy;

/// The individual sub-scrapes the orchestrator fans out to.
///
/// Every method may fail; the orchestrator turns failures into fallbacks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageScraper: Send + Sync {
    /// Title, description, keywords and open-graph fields
    async fn metadata(&self, url: &str) -> Result<PageMetadata>;

    /// Industry label for the site
    async fn classify_industry(&self, url: &str, metadata: &PageMetadata) -> Result<Industry>;

    /// Logo URL, preferring the open-graph image
    async fn logo(&self, url: &str, metadata: &PageMetadata, robots: &RobotsPolicy) -> Result<Option<String>>;

    /// Image URLs on the page
    async fn images(&self, url: &str) -> Result<Vec<String>>;

    async fn contact_info(&self, url: &str) -> Result<ContactInfo>;

    async fn addresses(&self, url: &str) -> Result<Vec<String>>;

    async fn screenshot(&self, url: &str) -> Result<Screenshot>;

    async fn seo(&self, url: &str, robots: &RobotsPolicy) -> Result<SeoReport>;

    /// Where a tracked keyword shows up on the page
    async fn keyword(&self, url: &str, keyword: &str) -> Result<KeywordReport>;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    url: &'a str,
    title: Option<&'a str>,
    description: Option<&'a str>,
    keywords: Option<&'a str>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    label: String,
    score: f64,
}

/// Renders pages through the browser pool and extracts from the DOM
pub struct BrowserScraper {
    pool: Arc<BrowserPool>,
    http: Client,
    settings: ScrapeSettings,
}

impl BrowserScraper {
    pub fn new(pool: Arc<BrowserPool>, settings: ScrapeSettings) -> Result<Self> {
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { pool, http, settings })
    }

    async fn sitemap_reachable(&self, page: &Url, robots: &RobotsPolicy) -> bool {
        let Ok(sitemap) = page.join("/sitemap.xml") else {
            return false;
        };
        if !robots.is_path_allowed(sitemap.path()) {
            return false;
        }

        match self.http.head(sitemap.as_str()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Sitemap probe for {} failed: {}", sitemap, e);
                false
            }
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).context(format!("Invalid URL: {}", url))
}

#[async_trait]
impl PageScraper for BrowserScraper {
    async fn metadata(&self, url: &str) -> Result<PageMetadata> {
        let html = self.pool.render(url).await?;
        Ok(extract::parse_metadata(&html))
    }

    async fn classify_industry(&self, url: &str, metadata: &PageMetadata) -> Result<Industry> {
        let endpoint = self.settings.classifier_url.as_deref()
            .context("No classification service configured")?;

        let request = ClassifyRequest {
            url,
            title: metadata.title.as_deref(),
            description: metadata.description.as_deref(),
            keywords: metadata.keywords.as_deref(),
        };

        let response = self.http.post(endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to reach classification service")?
            .error_for_status()
            .context("Classification service rejected the request")?
            .json::<ClassifyResponse>()
            .await
            .context("Failed to parse classification response")?;

        Ok(Industry { label: response.label, score: response.score })
    }

    async fn logo(&self, url: &str, metadata: &PageMetadata, robots: &RobotsPolicy) -> Result<Option<String>> {
        let page = parse_url(url)?;

        if let Some(og_image) = metadata.og_image.as_deref() {
            if let Ok(image) = page.join(og_image) {
                return Ok(Some(image.to_string()));
            }
        }

        let html = self.pool.render(url).await?;
        let candidate = extract::find_logo_candidate(&html, &page)
            .filter(|logo| {
                Url::parse(logo).map_or(false, |u| u.host_str() != page.host_str() || robots.is_path_allowed(u.path()))
            });

        Ok(candidate)
    }

    async fn images(&self, url: &str) -> Result<Vec<String>> {
        let page = parse_url(url)?;
        let html = self.pool.render(url).await?;
        Ok(extract::extract_images(&html, &page, self.settings.max_images))
    }

    async fn contact_info(&self, url: &str) -> Result<ContactInfo> {
        let html = self.pool.render(url).await?;
        Ok(extract::extract_contact_info(&html))
    }

    async fn addresses(&self, url: &str) -> Result<Vec<String>> {
        let html = self.pool.render(url).await?;
        Ok(extract::extract_addresses(&extract::visible_text(&html)))
    }

    async fn screenshot(&self, url: &str) -> Result<Screenshot> {
        let png = self.pool.screenshot(url).await?;
        Ok(Screenshot { png_base64: STANDARD.encode(png) })
    }

    async fn seo(&self, url: &str, robots: &RobotsPolicy) -> Result<SeoReport> {
        let page = parse_url(url)?;
        let html = self.pool.render(url).await?;
        let sitemap_found = self.sitemap_reachable(&page, robots).await;

        Ok(SeoReport::from_checks(extract::seo_checks(&html, &page, sitemap_found)))
    }

    async fn keyword(&self, url: &str, keyword: &str) -> Result<KeywordReport> {
        let html = self.pool.render(url).await?;
        Ok(extract::keyword_report(&html, keyword))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::BrowserSettings;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scraper(classifier_url: Option<String>) -> BrowserScraper {
        let pool = Arc::new(BrowserPool::new(
            BrowserSettings { webdriver_url: "http://127.0.0.1:9".to_string(), ..BrowserSettings::default() },
            "test-agent",
        ));
        let settings = ScrapeSettings { classifier_url, ..ScrapeSettings::default() };
        BrowserScraper::new(pool, settings).unwrap()
    }

    #[tokio::test]
    async fn test_classify_without_service_fails() {
        let result = scraper(None).classify_industry("https://acme.test", &PageMetadata::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_classify_posts_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "label": "Food & Beverage",
                "score": 0.87,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = PageMetadata { title: Some("Acme Tea".to_string()), ..PageMetadata::default() };
        let industry = scraper(Some(format!("{}/classify", server.uri())))
            .classify_industry("https://acme.test", &metadata)
            .await
            .unwrap();

        assert_eq!(industry.label, "Food & Beverage");
        assert!((industry.score - 0.87).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_logo_prefers_og_image_without_rendering() {
        let metadata = PageMetadata { og_image: Some("/brand/og.png".to_string()), ..PageMetadata::default() };
        let robots = RobotsPolicy::unrestricted("https://acme.test");

        // The pool points at a dead WebDriver, so any render would fail
        let logo = scraper(None).logo("https://acme.test/about", &metadata, &robots).await.unwrap();
        assert_eq!(logo.as_deref(), Some("https://acme.test/brand/og.png"));
    }
}
