//! Crawl policy derived from a site's robots.txt.
//!
//! Only rules in the wildcard (`*`) user-agent block are honoured. Paths are
//! compiled to anchored regexes with `*` meaning "match anything". Anything
//! not disallowed is allowed. A missing robots.txt (404) means no
//! restrictions; any other fetch failure must be treated as deny-all.

use regex::Regex;
use reqwest::StatusCode;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Reasons a policy could not be evaluated. Callers fail closed on all of them.
#[derive(Debug, Error)]
pub enum RobotsError {
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("{0} is empty")]
    Empty(String),
}

#[derive(Debug, Clone)]
struct PathRule {
    path: String,
    pattern: Regex,
}

impl PathRule {
    fn new(path: &str) -> Option<Self> {
        let trimmed = path.trim_end_matches('$');
        let body = trimmed
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        Regex::new(&format!("^{}$", body))
            .ok()
            .map(|pattern| Self { path: path.to_string(), pattern })
    }
}

/// Allow/disallow rules for one site
#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    allowed: Vec<PathRule>,
    disallowed: Vec<PathRule>,
    deny_all: bool,
}

impl RobotsPolicy {
    /// Parse robots.txt content for the given origin
    pub fn parse(base_url: &str, content: &str) -> Self {
        let mut allowed: Vec<PathRule> = Vec::new();
        let mut disallowed: Vec<PathRule> = Vec::new();
        let mut in_wildcard_block = false;

        for raw_line in content.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => in_wildcard_block = value == "*",
                "disallow" if in_wildcard_block && !value.is_empty() => {
                    if !disallowed.iter().any(|r| r.path == value) {
                        disallowed.extend(PathRule::new(value));
                    }
                }
                "allow" if in_wildcard_block && !value.is_empty() => {
                    if !allowed.iter().any(|r| r.path == value) {
                        allowed.extend(PathRule::new(value));
                    }
                }
                _ => {}
            }
        }

        debug!("robots.txt for {}: {} allow, {} disallow rule(s)", base_url, allowed.len(), disallowed.len());

        Self {
            allowed,
            disallowed,
            deny_all: false,
        }
    }

    /// Policy for a site without robots.txt
    pub fn unrestricted(base_url: &str) -> Self {
        Self::parse(base_url, "")
    }

    /// Fail-closed policy used when evaluation failed
    pub fn deny_all(base_url: &str) -> Self {
        Self {
            deny_all: true,
            ..Self::unrestricted(base_url)
        }
    }

    pub fn allowed_paths(&self) -> Vec<String> {
        self.allowed.iter().map(|r| r.path.clone()).collect()
    }

    pub fn disallowed_paths(&self) -> Vec<String> {
        self.disallowed.iter().map(|r| r.path.clone()).collect()
    }

    /// Root path is not in the disallowed set
    pub fn is_base_url_allowed(&self) -> bool {
        !self.deny_all && !self.disallowed.iter().any(|r| r.path == "/")
    }

    /// Disallow wins, then allow, then default allow
    pub fn is_path_allowed(&self, path: &str) -> bool {
        if self.deny_all {
            return false;
        }
        if self.disallowed.iter().any(|r| r.pattern.is_match(path)) {
            return false;
        }
        if self.allowed.iter().any(|r| r.pattern.is_match(path)) {
            return true;
        }
        true
    }

    /// Serializable view stored in scrape results
    pub fn summary(&self) -> RobotsSummary {
        RobotsSummary {
            allowed: self.is_base_url_allowed(),
            allowed_paths: self.allowed_paths(),
            disallowed_paths: self.disallowed_paths(),
            error: None,
        }
    }
}

/// Robots outcome as recorded in a scrape result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotsSummary {
    pub allowed: bool,
    pub allowed_paths: Vec<String>,
    pub disallowed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RobotsSummary {
    pub fn denied(error: impl Into<String>) -> Self {
        Self {
            allowed: false,
            allowed_paths: vec![],
            disallowed_paths: vec![],
            error: Some(error.into()),
        }
    }
}

/// `scheme://host[:port]` for a URL
pub fn origin_of(url: &str) -> Result<String, RobotsError> {
    let parsed = Url::parse(url).map_err(|_| RobotsError::InvalidUrl(url.to_string()))?;
    Ok(parsed.origin().ascii_serialization())
}

/// Fetch and parse `{origin}/robots.txt`
pub async fn fetch_policy(client: &reqwest::Client, url: &str) -> Result<RobotsPolicy, RobotsError> {
    let origin = origin_of(url)?;
    let robots_url = format!("{}/robots.txt", origin);

    let response = client.get(&robots_url)
        .send()
        .await
        .map_err(|source| RobotsError::Fetch { url: robots_url.clone(), source })?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        debug!("No robots.txt at {}, assuming no restrictions", robots_url);
        return Ok(RobotsPolicy::unrestricted(&origin));
    }
    if !status.is_success() {
        return Err(RobotsError::Status { url: robots_url, status: status.as_u16() });
    }

    let body = response.text()
        .await
        .map_err(|source| RobotsError::Fetch { url: robots_url.clone(), source })?;

    if body.trim().is_empty() {
        return Err(RobotsError::Empty(robots_url));
    }

    Ok(RobotsPolicy::parse(&origin, &body))
}
