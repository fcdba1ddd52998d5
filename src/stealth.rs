//! Transport disguise: client identity strings, locale, request headers and
//! the switches that hide browser automation.

use rand::{Rng, SeedableRng, rngs::StdRng};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONNECTION, DNT, HeaderMap, HeaderName, HeaderValue,
    PRAGMA, REFERER, UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};

use crate::config::ProxySpec;

pub const LOCALE: &str = "es-ES,es;q=0.9,en;q=0.8";

const DESKTOP_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
];

/// The face one run presents to the site. Chosen once, then immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    pub accept_language: &'static str,
}

/// Picks identities from fixed tables. Seeded pools are reproducible.
pub struct IdentityPool {
    rng: StdRng,
}

impl IdentityPool {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    pub fn pick(&mut self) -> Identity {
        let i = self.rng.random_range(0..DESKTOP_AGENTS.len());
        Identity {
            user_agent: DESKTOP_AGENTS[i].to_string(),
            accept_language: LOCALE,
        }
    }
}

/// Headers for a top-level document navigation.
pub fn base_headers(identity: &Identity, referer: &str) -> HeaderMap {
    let mut h = identity_headers(identity, referer);
    h.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    h.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    h.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    h.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    h.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("navigate"),
    );
    h.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("document"),
    );
    h
}

/// Headers for the in-page listings request.
pub fn ajax_headers(identity: &Identity, referer: &str) -> HeaderMap {
    let mut h = identity_headers(identity, referer);
    h.insert(ACCEPT, HeaderValue::from_static("text/html, */*; q=0.01"));
    h.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    h.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    h.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("empty"),
    );
    h
}

fn identity_headers(identity: &Identity, referer: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&identity.user_agent) {
        h.insert(USER_AGENT, ua);
    }
    h.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static(identity.accept_language),
    );
    if let Ok(r) = HeaderValue::from_str(referer) {
        h.insert(REFERER, r);
    }
    h.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert(DNT, HeaderValue::from_static("1"));
    h.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
    h
}

/// Chromium command line. Default automation switches are not used, so
/// this list is the whole launch profile.
pub fn chrome_args(identity: &Identity, proxy: Option<&ProxySpec>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--disable-blink-features=AutomationControlled",
        "--disable-infobars",
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-background-networking",
        "--disable-sync",
        "--disable-translate",
        "--disable-popup-blocking",
        "--mute-audio",
        "--window-size=1366,900",
        "--lang=es-ES",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("--user-agent={}", identity.user_agent));
    if let Some(p) = proxy {
        // Credentials are answered over CDP; none go on the command line.
        args.push(format!("--proxy-server={}", p.server()));
    }
    args
}

/// Runs before any page script on every new document.
pub const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined, configurable: true });
Object.defineProperty(navigator, 'languages', { get: () => ['es-ES', 'es', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8 });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
  window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters)
  );
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_pools_agree() {
        let a = IdentityPool::new(Some(7)).pick();
        let b = IdentityPool::new(Some(7)).pick();
        assert_eq!(a, b);
        assert!(DESKTOP_AGENTS.contains(&a.user_agent.as_str()));
        assert_eq!(a.accept_language, LOCALE);
    }

    #[test]
    fn every_pick_is_a_desktop_browser() {
        let mut pool = IdentityPool::new(Some(11));
        for _ in 0..32 {
            let id = pool.pick();
            assert!(DESKTOP_AGENTS.contains(&id.user_agent.as_str()));
            assert!(!id.user_agent.contains("Mobile"));
        }
    }

    #[test]
    fn every_request_carries_identity_and_locale() {
        let id = IdentityPool::new(Some(3)).pick();
        for h in [
            base_headers(&id, "https://www.encuentra24.com"),
            ajax_headers(&id, "https://www.encuentra24.com"),
        ] {
            assert_eq!(h[USER_AGENT], id.user_agent.as_str());
            assert_eq!(h[ACCEPT_LANGUAGE], LOCALE);
            assert_eq!(h[REFERER], "https://www.encuentra24.com");
        }
        assert_eq!(
            ajax_headers(&id, "https://x.example")["x-requested-with"],
            "XMLHttpRequest"
        );
    }

    #[test]
    fn proxy_credentials_stay_off_the_command_line() {
        let id = IdentityPool::new(Some(3)).pick();
        let proxy = ProxySpec::parse("10.0.0.2:3128:alice:hunter2").unwrap();
        let args = chrome_args(&id, Some(&proxy));
        assert!(args.contains(&"--proxy-server=10.0.0.2:3128".to_string()));
        assert!(args.iter().all(|a| !a.contains("hunter2") && !a.contains("alice")));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
    }
}
