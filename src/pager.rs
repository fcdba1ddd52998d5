//! Page loop for one profile run.
//!
//! `FETCHING(n) → PARSING(n) → Continue(n+1) | StopShort | StopEmpty |
//! StopHardFailure`, bounded by `max_pages`.

use std::time::Duration;

use rand::{Rng, rng};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::ScrapeConfig;
use crate::fetch::{FetchOutcome, FetchStrategy};
use crate::model::Listing;
use crate::parser::PageScan;

/// What the controller does after one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStep {
    Continue,
    StopShort,
    StopEmpty,
    StopHardFailure,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ShortPage,
    Empty,
    HardFailure,
    PageCap,
}

/// Diagnostic kept when a run ends on transport failure.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub page: usize,
    pub error: String,
    pub last_html: Option<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub user_id: u64,
    pub listings: Vec<Listing>,
    /// Pages that produced a document, successful or not.
    pub pages: usize,
    pub stop: StopReason,
    pub diagnostic: Option<Diagnostic>,
}

impl RunReport {
    /// No data obtained. The caller decides whether that is an error.
    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

/// Progress for streaming clients, one per page that yielded tiles.
#[derive(Serialize, Clone, Debug)]
pub struct PageEvent {
    pub page: usize,
    pub tiles: usize,
    pub via_ajax: bool,
    pub listings: Vec<Listing>,
    pub total_so_far: usize,
}

/// Per-run state. Never shared between runs.
struct RunState {
    page: usize,
    next_id: u64,
    listings: Vec<Listing>,
}

impl RunState {
    fn new() -> Self {
        Self {
            page: 1,
            next_id: 1,
            listings: Vec::new(),
        }
    }

    /// Number the page's listings and append them. Returns the slice added.
    fn absorb(&mut self, scan: PageScan) -> &[Listing] {
        let start = self.listings.len();
        for mut l in scan.listings {
            l.id = self.next_id;
            self.next_id += 1;
            self.listings.push(l);
        }
        &self.listings[start..]
    }
}

/// Continue only on a full page.
pub fn step_for(tile_count: usize, page_size: usize) -> PageStep {
    match tile_count {
        0 => PageStep::StopEmpty,
        n if n >= page_size => PageStep::Continue,
        _ => PageStep::StopShort,
    }
}

pub struct Pagination {
    strategy: FetchStrategy,
    max_pages: usize,
    page_size: usize,
    delay: Duration,
    jitter: Duration,
    events: Option<mpsc::Sender<PageEvent>>,
}

impl Pagination {
    pub fn new(strategy: FetchStrategy, config: &ScrapeConfig) -> Self {
        Self {
            strategy,
            max_pages: config.max_pages,
            page_size: config.page_size.max(1),
            delay: config.page_delay(),
            jitter: config.page_delay_jitter(),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<PageEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Drive the loop to a terminal state. Always releases the transport.
    pub async fn run(mut self) -> RunReport {
        let user_id = self.strategy.user_id();
        let mut state = RunState::new();
        let mut pages = 0usize;
        let mut diagnostic = None;

        let stop = loop {
            if state.page > self.max_pages {
                info!(user_id, max_pages = self.max_pages, "[pager] page cap reached");
                break StopReason::PageCap;
            }
            let page = state.page;

            let (step, scan, via_ajax) = match self.strategy.fetch(page).await {
                FetchOutcome::Page { scan, via_ajax } => {
                    pages += 1;
                    (step_for(scan.tile_count, self.page_size), Some(scan), via_ajax)
                }
                FetchOutcome::EndOfResults => {
                    pages += 1;
                    (PageStep::StopEmpty, None, false)
                }
                FetchOutcome::HardStop { error, last_html } => {
                    warn!(user_id, page, "[pager] giving up: {error}");
                    diagnostic = Some(Diagnostic {
                        page,
                        error: error.to_string(),
                        last_html,
                    });
                    (PageStep::StopHardFailure, None, false)
                }
            };

            if let Some(scan) = scan {
                let tiles = scan.tile_count;
                let skipped = scan.skipped;
                let added = state.absorb(scan).to_vec();
                info!(
                    user_id,
                    page,
                    tiles,
                    skipped,
                    via_ajax,
                    total = state.listings.len(),
                    "[pager] page parsed"
                );
                if let Some(tx) = &self.events {
                    let _ = tx
                        .send(PageEvent {
                            page,
                            tiles,
                            via_ajax,
                            listings: added,
                            total_so_far: state.listings.len(),
                        })
                        .await;
                }
            }

            match step {
                PageStep::Continue => {
                    state.page += 1;
                    let pause = self.pause();
                    sleep(pause).await;
                }
                PageStep::StopShort => break StopReason::ShortPage,
                PageStep::StopEmpty => break StopReason::Empty,
                PageStep::StopHardFailure => break StopReason::HardFailure,
            }
        };

        self.strategy.close().await;
        info!(
            user_id,
            pages,
            total = state.listings.len(),
            stop = ?stop,
            "[pager] run finished"
        );

        RunReport {
            user_id,
            listings: state.listings,
            pages,
            stop,
            diagnostic,
        }
    }

    fn pause(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let extra = rng().random_range(0.0..=self.jitter.as_secs_f64());
        self.delay + Duration::from_secs_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::fetch::testing::{Scripted, page};

    fn config() -> ScrapeConfig {
        ScrapeConfig {
            page_delay: 0.0,
            page_delay_jitter: 0.0,
            ..ScrapeConfig::default()
        }
    }

    fn pager(t: Scripted, cfg: &ScrapeConfig) -> Pagination {
        Pagination::new(FetchStrategy::new(Box::new(t), 465250, cfg), cfg)
    }

    #[test]
    fn full_page_continues_short_page_stops() {
        assert_eq!(step_for(20, 20), PageStep::Continue);
        assert_eq!(step_for(19, 20), PageStep::StopShort);
        assert_eq!(step_for(1, 20), PageStep::StopShort);
        assert_eq!(step_for(0, 20), PageStep::StopEmpty);
        assert_eq!(step_for(10, 10), PageStep::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_run_across_pages() {
        let mut t = Scripted::default();
        t.pages.push_back(Ok(page(1, 20)));
        t.pages.push_back(Ok(page(21, 20)));
        t.pages.push_back(Ok(page(41, 7)));
        let calls = t.calls.clone();

        let report = pager(t, &config()).run().await;
        assert_eq!(report.stop, StopReason::ShortPage);
        assert_eq!(report.pages, 3);
        let ids: Vec<u64> = report.listings.iter().map(|l| l.id).collect();
        assert_eq!(ids, (1..=47).collect::<Vec<u64>>());
        assert_eq!(report.listings[46].titulo, "Listing 47");
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn page_cap_bounds_the_loop() {
        let mut t = Scripted::default();
        for p in 0..5 {
            t.pages.push_back(Ok(page(p * 20 + 1, 20)));
        }
        let cfg = ScrapeConfig {
            max_pages: 2,
            ..config()
        };
        let report = pager(t, &cfg).run().await;
        assert_eq!(report.stop, StopReason::PageCap);
        assert_eq!(report.listings.len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn page_size_is_configurable() {
        let mut t = Scripted::default();
        t.pages.push_back(Ok(page(1, 5)));
        t.pages.push_back(Ok(page(6, 2)));
        let cfg = ScrapeConfig {
            page_size: 5,
            ..config()
        };
        let report = pager(t, &cfg).run().await;
        assert_eq!(report.stop, StopReason::ShortPage);
        assert_eq!(report.listings.len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_keeps_partial_results_and_closes() {
        let mut t = Scripted::default();
        t.pages.push_back(Ok(page(1, 20)));
        let closed = t.closed.clone();

        let report = pager(t, &config()).run().await;
        assert_eq!(report.stop, StopReason::HardFailure);
        assert_eq!(report.listings.len(), 20);
        let diag = report.diagnostic.unwrap();
        assert_eq!(diag.page, 2);
        assert!(diag.last_html.is_some());
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn streams_one_event_per_page() {
        let mut t = Scripted::default();
        t.pages.push_back(Ok(page(1, 20)));
        t.pages.push_back(Ok(page(21, 3)));
        let (tx, mut rx) = mpsc::channel(8);

        let report = pager(t, &config()).with_events(tx).run().await;
        assert_eq!(report.listings.len(), 23);

        let first = rx.recv().await.unwrap();
        assert_eq!((first.page, first.tiles, first.total_so_far), (1, 20, 20));
        assert_eq!(first.listings[0].id, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!((second.page, second.tiles, second.total_so_far), (2, 3, 23));
        assert_eq!(second.listings[0].id, 21);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_pages_but_not_after_the_last() {
        let mut t = Scripted::default();
        t.pages.push_back(Ok(page(1, 20)));
        t.pages.push_back(Ok(page(21, 20)));
        t.pages.push_back(Ok(page(41, 3)));
        let stamps = t.stamps.clone();
        let cfg = ScrapeConfig {
            page_delay: 1.0,
            page_delay_jitter: 0.0,
            ..ScrapeConfig::default()
        };

        let start = Instant::now();
        let report = pager(t, &cfg).run().await;
        assert_eq!(report.listings.len(), 43);

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![Duration::from_secs(1); 2]);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_bounds() {
        let mut t = Scripted::default();
        t.pages.push_back(Ok(page(1, 20)));
        t.pages.push_back(Ok(page(21, 1)));
        let stamps = t.stamps.clone();
        let cfg = ScrapeConfig {
            page_delay: 1.0,
            page_delay_jitter: 0.5,
            ..ScrapeConfig::default()
        };

        pager(t, &cfg).run().await;
        let stamps = stamps.lock().unwrap();
        let gap = stamps[1] - stamps[0];
        assert!(gap >= Duration::from_secs(1));
        assert!(gap <= Duration::from_millis(1500));
    }
}
