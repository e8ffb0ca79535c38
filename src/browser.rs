//! Headless browser access for rendering cafe articles.
//!
//! The extractor talks to a [`PageDriver`], one page used strictly
//! sequentially within a job. [`ChromeBrowser`] is the production
//! implementation backed by a headless Chromium instance; tests substitute
//! a scripted driver.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::BROWSER_USER_AGENT;
use crate::session::StorageState;

/// Default viewport width in pixels.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;

/// Default viewport height in pixels.
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 900;

/// Legacy article pages render the post inside this iframe; DOM helpers
/// operate on its document when present.
const ROOT_DOCUMENT_JS: &str = "const __frame = document.querySelector('iframe#cafe_main'); \
     const doc = (__frame && __frame.contentDocument) ? __frame.contentDocument : document;";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
    #[error("browser error: {0}")]
    Browser(String),
}

impl DriverError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// One browsing page. Every call is bounded by a timeout.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to `url` and wait for the load to settle.
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    /// Serialized HTML of the article document (the content frame when present).
    async fn html(&self) -> Result<String, DriverError>;

    /// Scroll the article document down by `pixels`.
    async fn scroll_by(&self, pixels: i64) -> Result<(), DriverError>;

    /// Number of nodes matching a CSS selector.
    async fn count(&self, selector: &str) -> Result<usize, DriverError>;

    /// Click the first node matching a CSS selector. Returns `false` if none matched.
    async fn click_first(&self, selector: &str) -> Result<bool, DriverError>;

    /// Release the page and its browser.
    async fn close(&self);
}

/// Opens an authenticated page for a job.
#[async_trait]
pub trait PageFactory: Send + Sync {
    async fn open(&self, session: &StorageState) -> Result<Box<dyn PageDriver>>;
}

/// Launches a headless Chromium per job.
#[derive(Debug, Clone)]
pub struct ChromeBrowser {
    chrome_path: Option<String>,
    navigation_timeout: Duration,
    dom_timeout: Duration,
}

impl ChromeBrowser {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            chrome_path: config.chrome_path.clone(),
            navigation_timeout: config.navigation_timeout,
            dom_timeout: config.dom_timeout,
        }
    }

    async fn launch(&self) -> Result<(Browser, JoinHandle<()>)> {
        info!("Launching headless browser");

        let mut config_builder = BrowserConfig::builder()
            .window_size(DEFAULT_VIEWPORT_WIDTH, DEFAULT_VIEWPORT_HEIGHT)
            .request_timeout(self.navigation_timeout)
            .no_sandbox()
            .disable_default_args()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--mute-audio")
            .arg("--lang=ko-KR");

        if let Some(ref chrome_path) = self.chrome_path {
            config_builder = config_builder.chrome_executable(chrome_path);
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        Ok((browser, handle))
    }
}

/// Create a blank page carrying the browser user agent and session cookies.
async fn prepare_page(browser: &Browser, session: &StorageState) -> Result<Page> {
    let page = browser
        .new_page("about:blank")
        .await
        .context("Failed to create new page")?;
    page.set_user_agent(BROWSER_USER_AGENT)
        .await
        .context("Failed to set user agent")?;

    let cookies: Vec<CookieParam> = session
        .cookies
        .iter()
        .filter_map(|c| {
            let mut builder = CookieParam::builder()
                .name(c.name.clone())
                .value(c.value.clone())
                .domain(c.domain.clone())
                .path(c.path.clone().unwrap_or_else(|| "/".to_string()));
            if let Some(secure) = c.secure {
                builder = builder.secure(secure);
            }
            if let Some(http_only) = c.http_only {
                builder = builder.http_only(http_only);
            }
            match builder.build() {
                Ok(param) => Some(param),
                Err(e) => {
                    warn!(cookie = %c.name, "Skipping unusable cookie: {e}");
                    None
                }
            }
        })
        .collect();
    page.set_cookies(cookies)
        .await
        .context("Failed to install session cookies")?;
    Ok(page)
}

#[async_trait]
impl PageFactory for ChromeBrowser {
    async fn open(&self, session: &StorageState) -> Result<Box<dyn PageDriver>> {
        let (mut browser, handler) = self.launch().await?;

        let page = match prepare_page(&browser, session).await {
            Ok(page) => page,
            Err(e) => {
                if let Err(close_err) = browser.close().await {
                    warn!("Failed to close browser after setup error: {close_err}");
                }
                handler.abort();
                return Err(e);
            }
        };

        let driver = ChromePage {
            browser: Mutex::new(Some(browser)),
            page,
            handler,
            navigation_timeout: self.navigation_timeout,
            dom_timeout: self.dom_timeout,
        };
        if let Err(e) = driver.restore_local_storage(session).await {
            driver.close().await;
            return Err(e);
        }

        info!(cookies = session.cookies.len(), "Browser page ready with session");
        Ok(Box::new(driver))
    }
}

/// A Chromium page holding the job's session.
pub struct ChromePage {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler: JoinHandle<()>,
    navigation_timeout: Duration,
    dom_timeout: Duration,
}

impl ChromePage {
    async fn restore_local_storage(&self, session: &StorageState) -> Result<()> {
        for origin in &session.origins {
            if origin.local_storage.is_empty() {
                continue;
            }
            self.goto(&origin.origin)
                .await
                .with_context(|| format!("Failed to open {} for local storage", origin.origin))?;
            for entry in &origin.local_storage {
                let script = format!(
                    "(() => {{ localStorage.setItem({}, {}); return true; }})()",
                    serde_json::to_string(&entry.name)?,
                    serde_json::to_string(&entry.value)?
                );
                self.evaluate::<bool>("localStorage", &script)
                    .await
                    .with_context(|| format!("Failed to restore local storage for {}", origin.origin))?;
            }
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, op: &'static str, limit: Duration, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = chromiumoxide::error::Result<T>> + Send,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DriverError::Browser(e.to_string())),
            Err(_) => Err(DriverError::Timeout {
                op,
                secs: limit.as_secs(),
            }),
        }
    }

    async fn evaluate<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
        script: &str,
    ) -> Result<T, DriverError> {
        let result = self
            .bounded(op, self.dom_timeout, self.page.evaluate(script.to_string()))
            .await?;
        result
            .into_value::<T>()
            .map_err(|e| DriverError::Browser(format!("{op}: unexpected script result: {e}")))
    }
}

fn selector_literal(selector: &str) -> Result<String, DriverError> {
    serde_json::to_string(selector).map_err(|e| DriverError::Browser(e.to_string()))
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        debug!(url = %url, "Navigating");
        self.bounded("navigation", self.navigation_timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok(())
        })
        .await
    }

    async fn html(&self) -> Result<String, DriverError> {
        let script = format!(
            "(() => {{ {ROOT_DOCUMENT_JS} return doc.documentElement ? doc.documentElement.outerHTML : ''; }})()"
        );
        self.evaluate("html snapshot", &script).await
    }

    async fn scroll_by(&self, pixels: i64) -> Result<(), DriverError> {
        let script = format!(
            "(() => {{ {ROOT_DOCUMENT_JS} const el = doc.scrollingElement || doc.body; \
             if (el) {{ el.scrollBy(0, {pixels}); }} window.scrollBy(0, {pixels}); return true; }})()"
        );
        self.evaluate::<bool>("scroll", &script).await.map(|_| ())
    }

    async fn count(&self, selector: &str) -> Result<usize, DriverError> {
        let script = format!(
            "(() => {{ {ROOT_DOCUMENT_JS} return doc.querySelectorAll({}).length; }})()",
            selector_literal(selector)?
        );
        self.evaluate("count", &script).await
    }

    async fn click_first(&self, selector: &str) -> Result<bool, DriverError> {
        let script = format!(
            "(() => {{ {ROOT_DOCUMENT_JS} const el = doc.querySelector({}); \
             if (!el) {{ return false; }} el.click(); return true; }})()",
            selector_literal(selector)?
        );
        self.evaluate("click", &script).await
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            warn!("Failed to close page: {e}");
        }
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {e}");
            } else {
                info!("Browser shutdown complete");
            }
        }
        self.handler.abort();
    }
}
