use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Kind of scrape work carried by a task message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Full fan-out scrape producing an aggregate result
    Scrape,
    ReadRobots,
    ScrapeMetadata,
    ClassifyIndustry,
    ScrapeLogo,
    ScrapeImages,
    Screenshot,
    ScrapeContactInfo,
    ScrapeAddresses,
    SeoAnalysis,
    KeywordAnalysis,
}

impl TaskKind {
    pub const ALL: [TaskKind; 11] = [
        TaskKind::Scrape,
        TaskKind::ReadRobots,
        TaskKind::ScrapeMetadata,
        TaskKind::ClassifyIndustry,
        TaskKind::ScrapeLogo,
        TaskKind::ScrapeImages,
        TaskKind::Screenshot,
        TaskKind::ScrapeContactInfo,
        TaskKind::ScrapeAddresses,
        TaskKind::SeoAnalysis,
        TaskKind::KeywordAnalysis,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Scrape => "scrape",
            TaskKind::ReadRobots => "read-robots",
            TaskKind::ScrapeMetadata => "scrape-metadata",
            TaskKind::ClassifyIndustry => "classify-industry",
            TaskKind::ScrapeLogo => "scrape-logo",
            TaskKind::ScrapeImages => "scrape-images",
            TaskKind::Screenshot => "screenshot",
            TaskKind::ScrapeContactInfo => "scrape-contact-info",
            TaskKind::ScrapeAddresses => "scrape-addresses",
            TaskKind::SeoAnalysis => "seo-analysis",
            TaskKind::KeywordAnalysis => "keyword-analysis",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
    }
}

/// Rejected input that must never reach the queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing url")]
    MissingUrl,

    #[error("invalid url '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("keyword-analysis requires a keyword")]
    MissingKeyword,

    #[error("unknown task type '{0}'")]
    UnknownKind(String),
}

/// Check that a URL is an absolute http(s) URL
pub fn validate_url(url: &str) -> Result<Url, ValidationError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingUrl);
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| ValidationError::InvalidUrl(trimmed.to_string(), e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ValidationError::UnsupportedScheme(other.to_string())),
    }
}

/// One unit of dispatched scrape work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Idempotency id, shared by every redelivery of the same message
    pub id: Uuid,

    /// What to run
    pub kind: TaskKind,

    /// Target URL
    pub url: String,

    /// Tracked keyword (keyword-analysis only)
    pub keyword: Option<String>,
}

impl TaskMessage {
    pub fn new(kind: TaskKind, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            url: url.into(),
            keyword: None,
        }
    }

    pub fn keyword(url: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: TaskKind::KeywordAnalysis,
            url: url.into(),
            keyword: Some(keyword.into()),
        }
    }

    /// Reject messages that should never be queued
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_url(&self.url)?;

        if self.kind == TaskKind::KeywordAnalysis
            && self.keyword.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(ValidationError::MissingKeyword);
        }

        Ok(())
    }

    /// Cache key tracking this task's job status
    pub fn task_key(&self) -> String {
        match (&self.kind, &self.keyword) {
            (TaskKind::KeywordAnalysis, Some(keyword)) => keyword_task_key(&self.url, keyword),
            _ => task_key(&self.url, self.kind),
        }
    }

    /// Encode into the queue envelope
    pub fn to_envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            id: self.id,
            kind: self.kind,
            data: TaskData {
                url: self.url.clone(),
                keyword: self.keyword.clone(),
            },
        }
    }
}

/// Key for a per-type job: `<url>-<type>`
pub fn task_key(url: &str, kind: TaskKind) -> String {
    format!("{}-{}", url, kind)
}

/// Key for a keyword job: `<url>-keyword-<keyword>`
pub fn keyword_task_key(url: &str, keyword: &str) -> String {
    format!("{}-keyword-{}", url, keyword)
}

/// Queue wire format: `{"id", "type", "data": {"url", "keyword"?}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    pub data: TaskData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl From<TaskEnvelope> for TaskMessage {
    fn from(envelope: TaskEnvelope) -> Self {
        Self {
            id: envelope.id,
            kind: envelope.kind,
            url: envelope.data.url,
            keyword: envelope.data.keyword,
        }
    }
}
