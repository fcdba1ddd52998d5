use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Transport;
use crate::config::ProxySpec;
use crate::error::{FetchError, ScrapeError};
use crate::stealth::{self, Identity};

/// Lets the client's own timeout fire before the strategy's.
const CLIENT_GRACE: Duration = Duration::from_secs(1);

/// Plain HTTP session with a cookie jar.
pub struct HttpTransport {
    client: reqwest::Client,
    identity: Identity,
    origin: String,
}

impl HttpTransport {
    /// `origin` is the site root hit once to seed cookies.
    pub fn new(
        origin: &str,
        identity: Identity,
        proxy: Option<&ProxySpec>,
        timeout: Duration,
    ) -> Result<Self, ScrapeError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(identity.user_agent.clone())
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(8))
            .timeout(timeout);

        if let Some(p) = proxy {
            match reqwest::Proxy::all(p.http_url()) {
                Ok(px) => builder = builder.proxy(px.basic_auth(&p.user, &p.password)),
                Err(e) => warn!(proxy = ?p, "proxy disabled: {e}"),
            }
        }

        let client = builder
            .build()
            .map_err(|e| ScrapeError::ClientBuild(e.to_string()))?;
        Ok(Self {
            client,
            identity,
            origin: origin.to_string(),
        })
    }

    async fn get(
        &self,
        url: &str,
        headers: reqwest::header::HeaderMap,
    ) -> Result<String, FetchError> {
        let rsp = self.client.get(url).headers(headers).send().await?;
        let status = rsp.status();
        let final_url = rsp.url().clone();
        let text = rsp.text().await?;
        debug!(
            url,
            status = status.as_u16(),
            %final_url,
            len = text.len(),
            "[fetch]"
        );
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn navigate(&mut self, url: &str, referer: &str) -> Result<String, FetchError> {
        let headers = stealth::base_headers(&self.identity, referer);
        self.get(url, headers).await
    }

    async fn ajax(&mut self, url: &str, referer: &str) -> Result<String, FetchError> {
        let headers = stealth::ajax_headers(&self.identity, referer);
        self.get(url, headers).await
    }

    /// One hit on the home page so the session has cookies before the first
    /// profile request.
    async fn warmup(&mut self) {
        let headers = stealth::base_headers(&self.identity, &self.origin);
        if let Err(e) = self.get(&self.origin, headers).await {
            debug!("[warmup] failed: {e}");
        }
    }

    fn attempt_budget(&self, page_timeout: Duration) -> Duration {
        page_timeout + CLIENT_GRACE
    }

    async fn close(&mut self) {
        debug!("http session closed");
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::stealth::{IdentityPool, LOCALE};

    fn transport(origin: &str, proxy: Option<&ProxySpec>) -> HttpTransport {
        let identity = IdentityPool::new(Some(5)).pick();
        HttpTransport::new(origin, identity, proxy, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn session_cookies_and_identity_reach_every_request() {
        let server = MockServer::start_async().await;
        let ua = IdentityPool::new(Some(5)).pick().user_agent;

        let home = server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200)
                    .header("set-cookie", "sid=abc; Path=/")
                    .body("<html></html>");
            })
            .await;
        let profile = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/costa-rica-es/user/profile/id/9")
                    .query_param("page", "1")
                    .header("cookie", "sid=abc")
                    .header("user-agent", ua.as_str())
                    .header("accept-language", LOCALE);
                then.status(200).body("<div id=\"currentlistings\"></div>");
            })
            .await;
        let listings = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/costa-rica-es/user/profile/id/9/listings")
                    .header("cookie", "sid=abc")
                    .header("x-requested-with", "XMLHttpRequest")
                    .header("accept-language", LOCALE);
                then.status(200).body("<div class=\"d3-ad-tile\"></div>");
            })
            .await;

        let mut t = transport(&server.base_url(), None);
        t.warmup().await;
        let page = t
            .navigate(&server.url("/costa-rica-es/user/profile/id/9?page=1"), &server.base_url())
            .await
            .unwrap();
        assert!(page.contains("currentlistings"));
        let fragment = t
            .ajax(
                &server.url("/costa-rica-es/user/profile/id/9/listings?page=1"),
                &server.url("/costa-rica-es/user/profile/id/9?page=1"),
            )
            .await
            .unwrap();
        assert!(fragment.contains("d3-ad-tile"));

        home.assert_async().await;
        profile.assert_async().await;
        listings.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_reported_and_not_found_is_final() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gone");
                then.status(404).body("no such profile");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/busy");
                then.status(503);
            })
            .await;

        let mut t = transport(&server.base_url(), None);
        let err = t.navigate(&server.url("/gone"), "").await.unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
        assert!(!err.is_transient());

        let err = t.navigate(&server.url("/busy"), "").await.unwrap_err();
        assert!(matches!(err, FetchError::Status(503)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn failed_warmup_is_not_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(500);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/p");
                then.status(200).body("ok");
            })
            .await;

        let mut t = transport(&server.base_url(), None);
        t.warmup().await;
        assert_eq!(t.navigate(&server.url("/p"), "").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn proxy_receives_basic_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf).to_lowercase()
        });

        let proxy = ProxySpec::parse(&format!("127.0.0.1:{port}:bob:pw")).unwrap();
        let mut t = transport("http://enc24.test", Some(&proxy));
        let body = t.navigate("http://enc24.test/x", "").await.unwrap();
        assert_eq!(body, "ok");

        let request = seen.await.unwrap();
        assert!(request.starts_with("get http://enc24.test/x "));
        // base64("bob:pw")
        assert!(request.contains("proxy-authorization: basic ym9ionb3"));
    }

    #[test]
    fn attempt_budget_outlasts_client_timeout() {
        let t = transport("http://enc24.test", None);
        assert!(t.attempt_budget(Duration::from_secs(40)) > Duration::from_secs(40));
    }
}
