//! Listings harvester for encuentra24 seller profiles.
//!
//! [`scrape_profile`] walks `?page=N` of a profile until a short or empty
//! page, extracting one [`Listing`] per tile.

pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod pager;
pub mod parser;
pub mod stealth;

use tokio::sync::mpsc;
use tracing::info;

pub use config::{ScrapeConfig, TransportMode};
pub use error::{FetchError, ScrapeError};
pub use model::{Currency, Listing, Operation};
pub use pager::{PageEvent, RunReport, StopReason};

use fetch::{BrowserTransport, FetchStrategy, HttpTransport, Transport};
use pager::Pagination;
use stealth::IdentityPool;

/// Run the whole pipeline for one profile.
///
/// Transport failures end the run early but still return `Ok` with what was
/// collected; only an unusable transport is an `Err`.
pub async fn scrape_profile(user_id: u64, config: &ScrapeConfig) -> Result<RunReport, ScrapeError> {
    let strategy = open(user_id, config).await?;
    Ok(Pagination::new(strategy, config).run().await)
}

/// Like [`scrape_profile`], also sending a [`PageEvent`] per parsed page.
pub async fn scrape_profile_streaming(
    user_id: u64,
    config: &ScrapeConfig,
    events: mpsc::Sender<PageEvent>,
) -> Result<RunReport, ScrapeError> {
    let strategy = open(user_id, config).await?;
    Ok(Pagination::new(strategy, config)
        .with_events(events)
        .run()
        .await)
}

async fn open(user_id: u64, config: &ScrapeConfig) -> Result<FetchStrategy, ScrapeError> {
    let identity = IdentityPool::new(config.identity_seed).pick();
    let proxy = config.proxy_spec();
    info!(
        user_id,
        mode = ?config.transport_mode,
        proxied = proxy.is_some(),
        ua = %identity.user_agent,
        "starting run"
    );

    let transport: Box<dyn Transport> = match config.transport_mode {
        TransportMode::Http => Box::new(HttpTransport::new(
            config::BASE_URL,
            identity,
            proxy.as_ref(),
            config.page_timeout(),
        )?),
        TransportMode::Browser => {
            Box::new(BrowserTransport::launch(&identity, proxy.as_ref(), config).await?)
        }
    };
    Ok(FetchStrategy::new(transport, user_id, config))
}
