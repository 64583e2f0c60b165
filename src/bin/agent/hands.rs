use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use goal_pilot::dom;
use goal_pilot::surface::{PageSurface, Readiness};
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::path::PathBuf;
use std::sync::Arc;

/// Persistent browser session. Created once, reused for every run.
pub struct BrowserSession {
    // Dropping the browser closes the tab.
    _browser: Browser,
    tab: Arc<Tab>,
}

pub struct LaunchSettings {
    pub attach_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub profile_dir: Option<PathBuf>,
}

impl BrowserSession {
    pub fn launch(settings: &LaunchSettings) -> Result<Self> {
        // 1. Try to attach to a Chrome started with --remote-debugging-port.
        if let Some(url) = &settings.attach_url {
            tracing::info!("attempting to attach to existing Chrome at {url}");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = {
                        let tabs = browser.get_tabs();
                        let tabs = tabs.lock().map_err(|_| anyhow!("tab list lock poisoned"))?;
                        tabs.first().cloned()
                    };
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    tracing::info!("attached to existing Chrome");
                    return Ok(Self { _browser: browser, tab });
                }
                Err(e) => tracing::warn!("could not attach ({e}); launching a new browser"),
            }
        }

        // 2. Launch our own.
        let options = LaunchOptions {
            headless: settings.headless,
            path: settings.chrome_path.clone(),
            user_data_dir: settings.profile_dir.clone(),
            window_size: Some((1280, 800)),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: std::time::Duration::from_secs(600),
            ..Default::default()
        };

        tracing::info!("starting Chrome (headless: {})", settings.headless);
        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        tracing::info!("Chrome ready");

        Ok(Self { _browser: browser, tab })
    }

    /// The page the controller should drive.
    pub fn surface(&self) -> Arc<ChromeSurface> {
        Arc::new(ChromeSurface {
            tab: self.tab.clone(),
        })
    }
}

/// A Chrome tab exposed through the page-surface contract.
///
/// headless_chrome is synchronous, so every call hops onto the blocking pool.
pub struct ChromeSurface {
    tab: Arc<Tab>,
}

impl ChromeSurface {
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {e}"))?
    }
}

#[async_trait]
impl PageSurface for ChromeSurface {
    async fn load(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let script = script.to_string();
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false)?;
            Ok(result.value.unwrap_or(serde_json::Value::Null))
        })
        .await
    }

    async fn capture(&self) -> Result<Vec<u8>> {
        self.blocking(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn readiness(&self) -> Result<Readiness> {
        let value = self.evaluate(dom::READINESS_JS).await?;
        dom::parse_readiness(&value).ok_or_else(|| anyhow!("unexpected readiness probe result: {value}"))
    }
}
