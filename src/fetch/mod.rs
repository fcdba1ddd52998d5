//! Getting a profile page's HTML: transport backends, retries, and the
//! in-session AJAX fallback.

pub mod browser;
pub mod http;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BASE_URL, ScrapeConfig};
use crate::error::FetchError;
use crate::parser::{self, PageScan, Scope};

pub use browser::BrowserTransport;
pub use http::HttpTransport;

/// A session against the site. Cookies and identity persist across calls
/// until [`Transport::close`].
#[async_trait]
pub trait Transport: Send {
    /// Full-page request or render. Returns the document HTML.
    async fn navigate(&mut self, url: &str, referer: &str) -> Result<String, FetchError>;

    /// Narrow in-session request for the listings fragment.
    async fn ajax(&mut self, url: &str, referer: &str) -> Result<String, FetchError>;

    /// One-time session setup before the first page. Not counted against
    /// any page attempt.
    async fn warmup(&mut self) {}

    /// Wall-clock bound for one `navigate` call. Must cover every inner
    /// deadline the transport applies, so the inner ones fire first.
    fn attempt_budget(&self, page_timeout: Duration) -> Duration {
        page_timeout
    }

    /// Release the session. Called once, on every exit path of a run.
    async fn close(&mut self);
}

#[derive(Debug)]
pub enum FetchOutcome {
    Page { scan: PageScan, via_ajax: bool },
    EndOfResults,
    HardStop {
        error: FetchError,
        last_html: Option<String>,
    },
}

pub fn profile_url(user_id: u64, page: usize) -> String {
    format!("{BASE_URL}/costa-rica-es/user/profile/id/{user_id}?page={page}")
}

/// Used when the page does not advertise its own listings endpoint.
pub const CONVENTIONAL_AJAX_PATH: &str = "/costa-rica-es/user/profile/id/{user_id}/listings";

/// Expand `{user_id}`/`{page}` and resolve against the site. A template
/// without `{page}` gets a `page` query parameter.
pub fn ajax_url(template: &str, user_id: u64, page: usize) -> Option<String> {
    let has_page = template.contains("{page}");
    let expanded = template
        .replace("{user_id}", &user_id.to_string())
        .replace("{page}", &page.to_string());
    let mut url = Url::parse(BASE_URL).and_then(|b| b.join(&expanded)).ok()?;
    if !has_page {
        url.query_pairs_mut()
            .append_pair("page", &page.to_string());
    }
    Some(url.to_string())
}

/// The AJAX endpoint answers with either a fragment or JSON wrapping one.
pub fn unwrap_ajax_body(body: &str) -> String {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
            for key in ["html", "listings", "content"] {
                if let Some(s) = json.get(key).and_then(|v| v.as_str()) {
                    return s.to_string();
                }
            }
            return String::new();
        }
    }
    body.to_string()
}

/// Fetches pages for one profile through one transport.
pub struct FetchStrategy {
    transport: Box<dyn Transport>,
    user_id: u64,
    max_attempts: u32,
    backoff_unit: Duration,
    page_timeout: Duration,
    attempt_timeout: Duration,
    warmed: bool,
    snapshot_dir: Option<PathBuf>,
    referer: String,
    last_html: Option<String>,
}

impl FetchStrategy {
    pub fn new(transport: Box<dyn Transport>, user_id: u64, config: &ScrapeConfig) -> Self {
        let attempt_timeout = transport.attempt_budget(config.page_timeout());
        Self {
            transport,
            user_id,
            max_attempts: config.max_attempts.max(1),
            backoff_unit: config.backoff_unit(),
            page_timeout: config.page_timeout(),
            attempt_timeout,
            warmed: false,
            snapshot_dir: config.snapshot_dir.clone(),
            referer: BASE_URL.to_string(),
            last_html: None,
        }
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub async fn fetch(&mut self, page: usize) -> FetchOutcome {
        let url = profile_url(self.user_id, page);
        let html = match self.fetch_primary(&url).await {
            Ok(html) => html,
            Err(error) => {
                let last_html = self.last_html.take();
                if let (Some(dir), Some(html)) =
                    (self.snapshot_dir.as_deref(), last_html.as_deref())
                {
                    snapshot(dir, self.user_id, page, html).await;
                }
                return FetchOutcome::HardStop { error, last_html };
            }
        };

        let scan = parser::scan_page(&html, Scope::Page);
        debug!(
            page,
            len = html.len(),
            container = scan.container_found,
            tiles = scan.tile_count,
            "primary document"
        );
        self.last_html = Some(html);
        self.referer = url.clone();

        if scan.tile_count > 0 {
            return FetchOutcome::Page {
                scan,
                via_ajax: false,
            };
        }

        self.fetch_fallback(page, &url, scan.ajax_template.as_deref())
            .await
    }

    async fn fetch_primary(&mut self, url: &str) -> Result<String, FetchError> {
        if !self.warmed {
            self.warmed = true;
            self.transport.warmup().await;
        }
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            let result = timeout(
                self.attempt_timeout,
                self.transport.navigate(url, &self.referer),
            )
            .await
            .unwrap_or_else(|_| Err(FetchError::Timeout(self.attempt_timeout)));

            match result {
                Ok(html) => return Ok(html),
                Err(e) => {
                    warn!(url, attempt, max = self.max_attempts, "fetch failed: {e}");
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient || attempt == self.max_attempts {
                        break;
                    }
                    sleep(self.backoff_unit * attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or(FetchError::Timeout(self.attempt_timeout)))
    }

    async fn fetch_fallback(
        &mut self,
        page: usize,
        page_url: &str,
        template: Option<&str>,
    ) -> FetchOutcome {
        let Some(url) = ajax_url(
            template.unwrap_or(CONVENTIONAL_AJAX_PATH),
            self.user_id,
            page,
        ) else {
            return FetchOutcome::EndOfResults;
        };
        info!(page, url, "no tiles in page, trying listings endpoint");

        let body = match timeout(self.page_timeout, self.transport.ajax(&url, page_url)).await {
            Ok(Ok(body)) => unwrap_ajax_body(&body),
            Ok(Err(e)) => {
                debug!(page, "listings endpoint failed: {e}");
                return FetchOutcome::EndOfResults;
            }
            Err(_) => {
                debug!(page, "listings endpoint timed out");
                return FetchOutcome::EndOfResults;
            }
        };

        let scan = parser::scan_page(&body, Scope::Fragment);
        if scan.tile_count == 0 {
            return FetchOutcome::EndOfResults;
        }
        FetchOutcome::Page {
            scan,
            via_ajax: true,
        }
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

/// Keep the last document seen before a hard stop for offline inspection.
async fn snapshot(dir: &Path, user_id: u64, page: usize, html: &str) {
    let path = dir.join(format!("enc24_{user_id}_p{page}.html"));
    match tokio::fs::write(&path, html).await {
        Ok(()) => info!(path = %path.display(), "saved diagnostic snapshot"),
        Err(e) => warn!(path = %path.display(), "snapshot failed: {e}"),
    }
}
