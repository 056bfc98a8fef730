use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use gleaner_core::error::AppError;
use gleaner_core::traits::PageFetcher;

/// Binaries tried when `CHROME_BIN` is unset. The snap path is the real
/// binary; the `/snap/bin` wrapper drops headless flags.
const CHROME_CANDIDATES: &[&str] = &[
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
];

const HEADLESS_ARGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--no-first-run",
];

/// Headless-Chromium fetcher for dataset portals whose metadata is only
/// rendered client-side.
///
/// Clones share one browser process. Each fetch opens a tab, reads the
/// rendered DOM and closes the tab, so a [`FetcherPool`] of clones bounds
/// the number of open tabs. Navigation and rendering failures are
/// retryable fetch errors.
///
/// ```rust,no_run
/// use gleaner_client::BrowserFetcher;
/// use gleaner_core::{FetcherPool, PageFetcher};
///
/// # async fn run() -> Result<(), gleaner_core::AppError> {
/// let pool = FetcherPool::replicate(BrowserFetcher::new().await?, 2)?;
/// let tab = pool.acquire().await?;
/// let html = tab.fetch("https://example.org/dataset/1").await?;
/// # Ok(())
/// # }
/// ```
///
/// [`FetcherPool`]: gleaner_core::FetcherPool
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl BrowserFetcher {
    /// Launch with a 30 s render timeout.
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(binary) = chrome_binary() {
            tracing::info!(binary = %binary.display(), "Using Chrome binary");
            builder = builder.chrome_executable(binary);
        }
        for arg in HEADLESS_ARGS {
            builder = builder.arg(*arg);
        }
        let config = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ConfigError(format!("Failed to launch browser: {e}")))?;

        // CDP messages only flow while the handler is polled.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser connection lost");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
        })
    }

    async fn render(&self, url: &str) -> Result<String, AppError> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| AppError::retryable_fetch(format!("Failed to open {url}: {e}")))?;
        let html = read_rendered(&page).await;
        if let Err(e) = page.close().await {
            tracing::debug!(%url, error = %e, "Failed to close browser tab");
        }
        html
    }
}

async fn read_rendered(page: &Page) -> Result<String, AppError> {
    page.find_element("body")
        .await
        .map_err(|e| AppError::retryable_fetch(format!("Page did not render body: {e}")))?;
    page.content()
        .await
        .map_err(|e| AppError::retryable_fetch(format!("Failed to read page content: {e}")))
}

fn chrome_binary() -> Option<PathBuf> {
    std::env::var_os("CHROME_BIN")
        .map(PathBuf::from)
        .into_iter()
        .chain(CHROME_CANDIDATES.iter().map(PathBuf::from))
        .find(|path| path.exists())
}

impl PageFetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        tokio::time::timeout(self.timeout, self.render(url))
            .await
            .unwrap_or(Err(AppError::Timeout(self.timeout)))
    }
}
