use anyhow::{Result, Context};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{json, Value};
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::cli::config::BrowserSettings;

/// One WebDriver session
pub struct BrowserSession {
    /// WebDriver instance
    driver: Option<WebDriver>,
}

impl BrowserSession {
    /// Start a new session against the configured WebDriver endpoint
    pub async fn open(config: &BrowserSettings, user_agent: &str) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", user_agent))?;
        caps.add_chrome_arg(&format!("--window-size={},{}", config.viewport.width, config.viewport.height))?;

        if config.headless {
            caps.set_headless()?;
        }

        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--no-sandbox")?;

        let driver = WebDriver::new(&config.webdriver_url, caps).await
            .context("Failed to connect to WebDriver")?;

        driver.set_page_load_timeout(Duration::from_secs(config.page_load_timeout)).await?;

        debug!("Browser session opened");

        Ok(Self { driver: Some(driver) })
    }

    fn driver(&self) -> Result<&WebDriver> {
        self.driver.as_ref().context("Browser session already closed")
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Navigating to: {}", url);
        self.driver()?.goto(url).await
            .context(format!("Failed to navigate to URL: {}", url))?;

        Ok(())
    }

    /// Get the rendered page source
    pub async fn page_source(&self) -> Result<String> {
        let source = self.driver()?.source().await
            .context("Failed to get page source")?;

        Ok(source)
    }

    /// Capture the whole page as PNG bytes. Falls back to the viewport when
    /// the browser does not speak the DevTools protocol.
    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        match self.full_page_png().await {
            Ok(png) => Ok(png),
            Err(e) => {
                warn!("Full-page capture unavailable, using the viewport: {:#}", e);
                let png = self.driver()?.screenshot_as_png().await
                    .context("Failed to take screenshot")?;
                Ok(png)
            }
        }
    }

    async fn full_page_png(&self) -> Result<Vec<u8>> {
        let dev_tools = ChromeDevTools::new(self.driver()?.handle.clone());

        let metrics = dev_tools.execute_cdp("Page.getLayoutMetrics").await
            .context("Failed to read page layout")?;
        let (width, height) = content_size(&metrics)
            .context("Layout metrics carry no content size")?;

        let capture = dev_tools.execute_cdp_with_params("Page.captureScreenshot", json!({
            "format": "png",
            "captureBeyondViewport": true,
            "clip": { "x": 0, "y": 0, "width": width, "height": height, "scale": 1 },
        })).await
            .context("Failed to capture page")?;

        decode_capture(&capture)
    }

    /// Close the browser session
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}

/// Page size in CSS pixels from `Page.getLayoutMetrics`
fn content_size(metrics: &Value) -> Option<(f64, f64)> {
    let size = metrics.get("cssContentSize").or_else(|| metrics.get("contentSize"))?;
    let width = size.get("width")?.as_f64()?;
    let height = size.get("height")?.as_f64()?;
    (width > 0.0 && height > 0.0).then_some((width, height))
}

/// PNG bytes from a `Page.captureScreenshot` reply
fn decode_capture(capture: &Value) -> Result<Vec<u8>> {
    let data = capture.get("data")
        .or_else(|| capture.pointer("/value/data"))
        .and_then(Value::as_str)
        .context("Screenshot reply carries no data")?;

    STANDARD.decode(data).context("Screenshot data is not base64")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_size_prefers_css_pixels() {
        let metrics = json!({
            "contentSize": { "x": 0, "y": 0, "width": 2560, "height": 9000 },
            "cssContentSize": { "x": 0, "y": 0, "width": 1280, "height": 4500 },
        });
        assert_eq!(content_size(&metrics), Some((1280.0, 4500.0)));

        let legacy = json!({ "contentSize": { "width": 1024, "height": 3000.5 } });
        assert_eq!(content_size(&legacy), Some((1024.0, 3000.5)));

        assert_eq!(content_size(&json!({ "cssContentSize": { "width": 0, "height": 0 } })), None);
        assert_eq!(content_size(&json!({})), None);
    }

    #[test]
    fn test_decode_capture() {
        let png = [0x89, b'P', b'N', b'G'];
        let encoded = STANDARD.encode(png);

        assert_eq!(decode_capture(&json!({ "data": encoded })).unwrap(), png);
        assert_eq!(decode_capture(&json!({ "value": { "data": encoded } })).unwrap(), png);
        assert!(decode_capture(&json!({})).is_err());
        assert!(decode_capture(&json!({ "data": "not base64!" })).is_err());
    }
}
