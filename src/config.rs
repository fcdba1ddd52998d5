use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const BASE_URL: &str = "https://www.encuentra24.com";

/// Tiles on a full profile page. A shorter page is the last one.
pub const FULL_PAGE_SIZE: usize = 20;

/// Ceiling on pages per run, whatever the site says.
pub const HARD_PAGE_CAP: usize = 200;

/// Profile scraped when a request names none.
pub const DEFAULT_USER_ID: u64 = 465250;

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Http,
    #[default]
    Browser,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportMode::Http),
            "browser" => Ok(TransportMode::Browser),
            other => Err(format!("unknown transport mode {other:?}")),
        }
    }
}

/// Options for one profile run. Every field has a default so partial
/// query strings and JSON bodies deserialize.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Seconds to wait between successful pages.
    pub page_delay: f64,
    /// Upper bound of the uniform jitter added to `page_delay`.
    pub page_delay_jitter: f64,
    pub max_pages: usize,
    pub page_size: usize,
    pub transport_mode: TransportMode,
    /// `host:port:user:password`
    pub proxy: Option<String>,
    pub render_headless: bool,
    pub page_timeout: f64,
    pub max_attempts: u32,
    pub backoff_unit: f64,
    pub scroll_steps: u32,
    pub scroll_pause: f64,
    /// Fixes identity selection, mostly for tests.
    pub identity_seed: Option<u64>,
    /// Where hard-stop HTML snapshots go. Nothing is written when unset.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            page_delay: 1.0,
            page_delay_jitter: 1.0,
            max_pages: HARD_PAGE_CAP,
            page_size: FULL_PAGE_SIZE,
            transport_mode: TransportMode::default(),
            proxy: None,
            render_headless: true,
            page_timeout: 40.0,
            max_attempts: 3,
            backoff_unit: 1.0,
            scroll_steps: 4,
            scroll_pause: 0.8,
            identity_seed: None,
            snapshot_dir: None,
        }
    }
}

impl ScrapeConfig {
    /// Defaults overlaid with `ENC24_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(mode) = std::env::var("ENC24_TRANSPORT") {
            match mode.parse() {
                Ok(m) => cfg.transport_mode = m,
                Err(e) => warn!("ignoring ENC24_TRANSPORT: {e}"),
            }
        }
        if let Ok(proxy) = std::env::var("ENC24_PROXY") {
            if !proxy.trim().is_empty() {
                cfg.proxy = Some(proxy);
            }
        }
        if let Ok(headless) = std::env::var("ENC24_HEADLESS") {
            cfg.render_headless = !matches!(headless.trim(), "0" | "false" | "no");
        }
        if let Ok(dir) = std::env::var("ENC24_SNAPSHOT_DIR") {
            cfg.snapshot_dir = Some(PathBuf::from(dir));
        }
        cfg
    }

    pub fn page_delay(&self) -> Duration {
        secs(self.page_delay)
    }

    pub fn page_delay_jitter(&self) -> Duration {
        secs(self.page_delay_jitter)
    }

    pub fn page_timeout(&self) -> Duration {
        secs(self.page_timeout)
    }

    pub fn backoff_unit(&self) -> Duration {
        secs(self.backoff_unit)
    }

    pub fn scroll_pause(&self) -> Duration {
        secs(self.scroll_pause)
    }

    /// Parsed proxy credentials. A malformed string disables the proxy
    /// instead of failing the run.
    pub fn proxy_spec(&self) -> Option<ProxySpec> {
        let raw = self.proxy.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match ProxySpec::parse(raw) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("proxy disabled: {e}");
                None
            }
        }
    }
}

fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}

/// Authenticated proxy endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl ProxySpec {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.splitn(4, ':');
        let (Some(host), Some(port), Some(user), Some(password)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err("expected host:port:user:password".to_string());
        };
        if host.is_empty() || user.is_empty() {
            return Err("proxy host and user must not be empty".to_string());
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid proxy port {port:?}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// `host:port`, without credentials.
    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.server())
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for ProxySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
