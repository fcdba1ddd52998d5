//! Chromium over CDP. One browser and one tab per run.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig, BrowserConfigBuilder};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams as FetchEnableParams, EventAuthRequired,
    EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::Transport;
use crate::config::{ProxySpec, ScrapeConfig};
use crate::error::{FetchError, ScrapeError};
use crate::stealth::{self, Identity};

const READY_POLL: Duration = Duration::from_millis(200);
const LISTINGS_WAIT: Duration = Duration::from_secs(5);
/// Headroom for the scroll scripts themselves.
const SETTLE_SLACK: Duration = Duration::from_secs(2);
const CONTENT_WAIT: Duration = Duration::from_secs(5);

/// Post-load phase: wait for tiles, then scroll. Best effort.
fn settle_budget(scroll_steps: u32, scroll_pause: Duration) -> Duration {
    LISTINGS_WAIT + scroll_pause * scroll_steps + SETTLE_SLACK
}

/// Navigation and readiness share `page_timeout`; settling and reading the
/// DOM get fixed allowances on top.
pub fn attempt_budget_for(
    page_timeout: Duration,
    scroll_steps: u32,
    scroll_pause: Duration,
) -> Duration {
    page_timeout + settle_budget(scroll_steps, scroll_pause) + CONTENT_WAIT
}

/// Launch options: our flag list only, current headless implementation.
fn configure(
    builder: BrowserConfigBuilder,
    identity: &Identity,
    proxy: Option<&ProxySpec>,
    config: &ScrapeConfig,
) -> BrowserConfigBuilder {
    let builder = builder
        .disable_default_args()
        .args(stealth::chrome_args(identity, proxy))
        .request_timeout(config.page_timeout());
    if config.render_headless {
        builder.new_headless_mode()
    } else {
        builder.with_head()
    }
}

pub struct BrowserTransport {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    proxy_auth: Option<JoinHandle<()>>,
    ready_timeout: Duration,
    scroll_steps: u32,
    scroll_pause: Duration,
    closed: bool,
}

impl BrowserTransport {
    /// Start Chromium and prepare the working tab. Any failure here means
    /// the render backend is unavailable for this run.
    pub async fn launch(
        identity: &Identity,
        proxy: Option<&ProxySpec>,
        config: &ScrapeConfig,
    ) -> Result<Self, ScrapeError> {
        let browser_config = configure(BrowserConfig::builder(), identity, proxy, config)
            .build()
            .map_err(ScrapeError::RenderUnavailable)?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScrapeError::RenderUnavailable(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("cdp handler: {e}");
                }
            }
        });

        match prepare_page(&browser, identity, proxy).await {
            Ok((page, proxy_auth)) => {
                info!(
                    headless = config.render_headless,
                    proxied = proxy.is_some(),
                    "browser ready"
                );
                Ok(Self {
                    browser,
                    page,
                    handler,
                    proxy_auth,
                    ready_timeout: config.page_timeout(),
                    scroll_steps: config.scroll_steps,
                    scroll_pause: config.scroll_pause(),
                    closed: false,
                })
            }
            Err(e) => {
                let _ = browser.close().await;
                let _ = browser.wait().await;
                handler.abort();
                Err(ScrapeError::RenderUnavailable(e.to_string()))
            }
        }
    }
}

/// Poll `document.readyState` until interactive, failing at `deadline`.
async fn wait_ready(page: &Page, deadline: Instant, budget: Duration) -> Result<(), FetchError> {
    loop {
        let ready_state = timeout_at(deadline, page.evaluate("document.readyState"))
            .await
            .map_err(|_| FetchError::Timeout(budget))??;
        let state = ready_state.into_value::<String>().unwrap_or_default();
        if state == "interactive" || state == "complete" {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(FetchError::Timeout(budget));
        }
        sleep(READY_POLL).await;
    }
}

/// Tiles may be injected after readiness; give them a moment but never fail
/// on their absence.
async fn wait_for_tiles(page: &Page) {
    let deadline = Instant::now() + LISTINGS_WAIT;
    while Instant::now() < deadline {
        let present = page
            .evaluate("document.querySelector('#currentlistings [data-tracklisting]') !== null")
            .await
            .ok()
            .and_then(|r| r.into_value::<bool>().ok())
            .unwrap_or(false);
        if present {
            break;
        }
        sleep(READY_POLL).await;
    }
}

async fn scroll(page: &Page, steps: u32, pause: Duration) {
    for _ in 0..steps {
        if let Err(e) = page
            .evaluate("window.scrollBy(0, document.body.scrollHeight / 2)")
            .await
        {
            debug!("scroll failed: {e}");
            break;
        }
        sleep(pause).await;
    }
}

async fn prepare_page(
    browser: &Browser,
    identity: &Identity,
    proxy: Option<&ProxySpec>,
) -> Result<(Page, Option<JoinHandle<()>>), FetchError> {
    let page = browser.new_page("about:blank").await?;

    page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
        stealth::STEALTH_SCRIPT,
    ))
    .await?;

    let mut ua = SetUserAgentOverrideParams::new(identity.user_agent.clone());
    ua.accept_language = Some(identity.accept_language.to_string());
    page.execute(ua).await?;

    let proxy_auth = match proxy {
        Some(p) => Some(answer_proxy_auth(&page, p).await?),
        None => None,
    };
    Ok((page, proxy_auth))
}

/// Intercept requests so proxy challenges are answered over CDP instead of
/// raising a credentials prompt.
async fn answer_proxy_auth(page: &Page, proxy: &ProxySpec) -> Result<JoinHandle<()>, FetchError> {
    let mut auth_events = page.event_listener::<EventAuthRequired>().await?;
    let mut paused_events = page.event_listener::<EventRequestPaused>().await?;
    page.execute(FetchEnableParams {
        handle_auth_requests: Some(true),
        ..Default::default()
    })
    .await?;

    let page = page.clone();
    let user = proxy.user.clone();
    let password = proxy.password.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(ev) = auth_events.next() => {
                    let mut answer =
                        AuthChallengeResponse::new(AuthChallengeResponseResponse::ProvideCredentials);
                    answer.username = Some(user.clone());
                    answer.password = Some(password.clone());
                    if let Err(e) = page
                        .execute(ContinueWithAuthParams::new(ev.request_id.clone(), answer))
                        .await
                    {
                        warn!("proxy auth answer failed: {e}");
                    }
                }
                Some(ev) = paused_events.next() => {
                    if let Err(e) = page
                        .execute(ContinueRequestParams::new(ev.request_id.clone()))
                        .await
                    {
                        debug!("continue request failed: {e}");
                    }
                }
                else => break,
            }
        }
    }))
}

#[async_trait]
impl Transport for BrowserTransport {
    async fn navigate(&mut self, url: &str, referer: &str) -> Result<String, FetchError> {
        let deadline = Instant::now() + self.ready_timeout;
        let mut nav = NavigateParams::new(url);
        nav.referrer = Some(referer.to_string());
        timeout_at(deadline, self.page.goto(nav))
            .await
            .map_err(|_| FetchError::Timeout(self.ready_timeout))??;
        wait_ready(&self.page, deadline, self.ready_timeout).await?;

        let settle = settle_budget(self.scroll_steps, self.scroll_pause);
        let settled = timeout(settle, async {
            wait_for_tiles(&self.page).await;
            scroll(&self.page, self.scroll_steps, self.scroll_pause).await;
        })
        .await;
        if settled.is_err() {
            debug!(url, "settle phase cut short");
        }

        let html = timeout(CONTENT_WAIT, self.page.content())
            .await
            .map_err(|_| FetchError::Timeout(CONTENT_WAIT))??;
        debug!(url, len = html.len(), "[render]");
        Ok(html)
    }

    async fn ajax(&mut self, url: &str, _referer: &str) -> Result<String, FetchError> {
        let target = serde_json::to_string(url).map_err(|e| FetchError::Script(e.to_string()))?;
        let script = format!(
            "fetch({target}, {{ credentials: 'include', headers: {{ \
             'X-Requested-With': 'XMLHttpRequest', 'Accept': 'text/html, */*; q=0.01' }} }})\
             .then(r => r.ok ? r.text() : '')"
        );
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(FetchError::Script)?;
        self.page
            .evaluate_expression(params)
            .await?
            .into_value::<String>()
            .map_err(|e| FetchError::Script(e.to_string()))
    }

    fn attempt_budget(&self, page_timeout: Duration) -> Duration {
        attempt_budget_for(page_timeout, self.scroll_steps, self.scroll_pause)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.proxy_auth.take() {
            task.abort();
        }
        if let Err(e) = self.browser.close().await {
            warn!("browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        info!("browser closed");
    }
}

impl Drop for BrowserTransport {
    fn drop(&mut self) {
        if let Some(task) = self.proxy_auth.take() {
            task.abort();
        }
        self.handler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_covers_navigation_settle_and_read() {
        let page_timeout = Duration::from_secs(40);
        let pause = Duration::from_millis(800);
        let budget = attempt_budget_for(page_timeout, 4, pause);
        // goto finishing at 38s plus a full settle phase still fits.
        let worst = Duration::from_secs(38) + LISTINGS_WAIT + pause * 4;
        assert!(budget > worst);
        assert_eq!(budget, Duration::from_millis(40_000 + 5_000 + 3_200 + 2_000 + 5_000));
    }

    #[test]
    fn headless_runs_use_the_new_mode() {
        let identity = stealth::IdentityPool::new(Some(2)).pick();
        let build = |headless: bool| {
            let cfg = ScrapeConfig {
                render_headless: headless,
                ..ScrapeConfig::default()
            };
            let builder = BrowserConfig::builder().chrome_executable("/usr/bin/true");
            let built = configure(builder, &identity, None, &cfg).build().unwrap();
            format!("{built:?}")
        };
        assert!(build(true).contains("headless: New"));
        assert!(build(false).contains("headless: False"));
    }
}
