use anyhow::{Result, Context};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::browser::session::BrowserSession;
use crate::cli::config::BrowserSettings;

/// Caps how many browser sessions exist at once
pub struct BrowserPool {
    config: BrowserSettings,
    user_agent: String,
    permits: Arc<Semaphore>,
}

/// A session checked out of the pool. The permit is returned when the
/// guard goes away; the session is quit on `release` or on drop.
pub struct PooledSession {
    session: BrowserSession,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = BrowserSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl PooledSession {
    /// Quit the session and give the slot back
    pub async fn release(mut self) {
        self.session.close().await;
    }
}

impl BrowserPool {
    pub fn new(config: BrowserSettings, user_agent: impl Into<String>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions.max(1)));

        Self {
            config,
            user_agent: user_agent.into(),
            permits,
        }
    }

    /// Free session slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot and open a session in it
    pub async fn acquire(&self) -> Result<PooledSession> {
        let permit = self.permits.clone().acquire_owned().await
            .context("Browser pool closed")?;

        debug!("Acquired browser slot ({} left)", self.available());

        let session = BrowserSession::open(&self.config, &self.user_agent).await?;

        Ok(PooledSession { session, _permit: permit })
    }

    /// Render a page and return its source
    pub async fn render(&self, url: &str) -> Result<String> {
        let session = self.acquire().await?;

        let source = async {
            session.navigate(url).await?;
            session.page_source().await
        }.await;

        session.release().await;
        source
    }

    /// Render a page and capture a full-page PNG screenshot
    pub async fn screenshot(&self, url: &str) -> Result<Vec<u8>> {
        let session = self.acquire().await?;

        let png = async {
            session.navigate(url).await?;
            session.screenshot_png().await
        }.await;

        session.release().await;
        png
    }
}
