use serde::{Serialize, Deserialize};

use crate::crawler::probe::DomainStatus;
use crate::crawler::robots::RobotsSummary;

/// Page metadata; every field is null when the sub-scrape failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image: Option<String>,
    pub og_type: Option<String>,
    pub og_site_name: Option<String>,
}

/// Industry label from the classification service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Industry {
    pub label: String,
    pub score: f64,
}

impl Industry {
    pub fn unknown() -> Self {
        Self {
            label: "Unknown".to_string(),
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub social_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    /// Base64-encoded PNG
    pub png_base64: String,
}

/// One pass/fail SEO check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeoCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeoReport {
    pub checks: Vec<SeoCheck>,
    /// Share of passed checks, 0-100
    pub score: u32,
}

impl SeoReport {
    pub fn from_checks(checks: Vec<SeoCheck>) -> Self {
        let passed = checks.iter().filter(|c| c.passed).count();
        let score = if checks.is_empty() {
            0
        } else {
            (passed * 100 / checks.len()) as u32
        };
        Self { checks, score }
    }
}

/// Where and how often a tracked keyword appears on a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordReport {
    pub keyword: String,
    pub in_title: bool,
    pub in_description: bool,
    pub in_headings: usize,
    pub occurrences: usize,
    pub density: f64,
}

/// Error marker standing in for a branch that produced nothing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchError {
    pub error: String,
}

/// A branch value or its error marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fallible<T> {
    Failed(BranchError),
    Value(T),
}

impl<T> Fallible<T> {
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Fallible::Value(value),
            Err(e) => Fallible::Failed(BranchError { error: format!("{:#}", e) }),
        }
    }

    #[cfg(test)]
    pub fn value(&self) -> Option<&T> {
        match self {
            Fallible::Value(value) => Some(value),
            Fallible::Failed(_) => None,
        }
    }
}

/// Merged output of a full scrape.
///
/// `robots` and `domain_status` are always present. The remaining fields
/// are absent when robots denied the base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateScrapeResult {
    pub url: String,
    pub robots: RobotsSummary,
    pub domain_status: DomainStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PageMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<Industry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<Fallible<Option<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<ContactInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Fallible<Screenshot>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seo: Option<Fallible<SeoReport>>,

    pub elapsed_ms: u64,
}

impl AggregateScrapeResult {
    /// Result for a URL whose crawl policy forbids scraping
    pub fn denied(url: &str, robots: RobotsSummary, domain_status: DomainStatus, elapsed_ms: u64) -> Self {
        Self {
            url: url.to_string(),
            robots,
            domain_status,
            metadata: None,
            industry: None,
            logo: None,
            images: None,
            contact_info: None,
            addresses: None,
            screenshot: None,
            seo: None,
            elapsed_ms,
        }
    }
}
