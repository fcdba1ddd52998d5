use actix_web::{App, HttpResponse, HttpServer, Responder, get, post, web};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

use enc24_claw::config::DEFAULT_USER_ID;
use enc24_claw::{
    Listing, PageEvent, RunReport, ScrapeConfig, ScrapeError, StopReason, TransportMode, export,
    scrape_profile, scrape_profile_streaming,
};

// -------------------------
// Request / Response Types
// -------------------------

/// Query string or JSON body. Anything unset falls back to the server's
/// environment configuration.
#[derive(Deserialize, Default)]
struct ScrapeParams {
    user_id: Option<u64>,
    transport_mode: Option<TransportMode>,
    max_pages: Option<usize>,
    page_delay: Option<f64>,
    render_headless: Option<bool>,
    proxy: Option<String>,
}

impl ScrapeParams {
    fn user_id(&self) -> u64 {
        self.user_id.unwrap_or(DEFAULT_USER_ID)
    }

    fn apply(&self, base: &ScrapeConfig) -> ScrapeConfig {
        let mut cfg = base.clone();
        if let Some(m) = self.transport_mode {
            cfg.transport_mode = m;
        }
        if let Some(n) = self.max_pages {
            cfg.max_pages = n.min(enc24_claw::config::HARD_PAGE_CAP);
        }
        if let Some(d) = self.page_delay {
            cfg.page_delay = d;
        }
        if let Some(h) = self.render_headless {
            cfg.render_headless = h;
        }
        if let Some(p) = &self.proxy {
            cfg.proxy = Some(p.clone());
        }
        cfg
    }
}

#[derive(Serialize)]
struct Meta {
    user_id: u64,
    pages: usize,
    total: usize,
    stop_reason: StopReason,
}

#[derive(Serialize)]
struct ApiResponse {
    listings: Vec<Listing>,
    meta: Meta,
}

impl From<RunReport> for ApiResponse {
    fn from(r: RunReport) -> Self {
        Self {
            meta: Meta {
                user_id: r.user_id,
                pages: r.pages,
                total: r.listings.len(),
                stop_reason: r.stop,
            },
            listings: r.listings,
        }
    }
}

fn error_json(msg: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": msg.to_string() })
}

/// Zero records is a client-visible error; why it happened picks the status.
fn no_data_response(report: &RunReport) -> HttpResponse {
    match report.stop {
        StopReason::HardFailure => {
            let detail = report
                .diagnostic
                .as_ref()
                .map(|d| d.error.clone())
                .unwrap_or_default();
            HttpResponse::BadGateway().json(error_json(format!(
                "no listings obtained for user {}: {detail}",
                report.user_id
            )))
        }
        _ => HttpResponse::NotFound().json(error_json(format!(
            "no listings found for user {}",
            report.user_id
        ))),
    }
}

/// The transport could not be brought up; nothing was fetched.
fn start_failure(user_id: u64, e: &ScrapeError) -> HttpResponse {
    error!(user_id, "scrape failed to start: {e}");
    HttpResponse::ServiceUnavailable().json(error_json(e))
}

// -------------------------
// HTTP Handlers
// -------------------------

#[get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body(
        "enc24-claw online.\n\
         JSON:\n  GET  /scrape?user_id=465250&transport_mode=http&max_pages=10\n  POST /scrape {\"user_id\":465250,\"transport_mode\":\"browser\"}\n\
         CSV:\n  GET  /scrape/csv?user_id=465250\n\
         Stream:\n  GET  /scrape/stream?user_id=465250 (SSE)",
    )
}

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn run_json(params: &ScrapeParams, base: &ScrapeConfig) -> HttpResponse {
    let cfg = params.apply(base);
    match scrape_profile(params.user_id(), &cfg).await {
        Ok(report) if report.is_empty() => no_data_response(&report),
        Ok(report) => HttpResponse::Ok().json(ApiResponse::from(report)),
        Err(e) => start_failure(params.user_id(), &e),
    }
}

#[post("/scrape")]
async fn scrape_endpoint(
    body: web::Json<ScrapeParams>,
    base: web::Data<ScrapeConfig>,
) -> impl Responder {
    run_json(&body, &base).await
}

#[get("/scrape")]
async fn scrape_get(q: web::Query<ScrapeParams>, base: web::Data<ScrapeConfig>) -> impl Responder {
    run_json(&q, &base).await
}

#[get("/scrape/csv")]
async fn scrape_csv(q: web::Query<ScrapeParams>, base: web::Data<ScrapeConfig>) -> impl Responder {
    let cfg = q.apply(&base);
    let user_id = q.user_id();
    let report = match scrape_profile(user_id, &cfg).await {
        Ok(r) => r,
        Err(e) => return start_failure(user_id, &e),
    };
    if report.is_empty() {
        return no_data_response(&report);
    }
    match export::to_csv(&report.listings) {
        Ok(body) => HttpResponse::Ok()
            .insert_header(("Content-Type", "text/csv; charset=utf-8"))
            .insert_header((
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", export::file_name(user_id)),
            ))
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(error_json(e)),
    }
}

// --------------
// SSE streaming
// --------------

fn sse_event(event: &str, data_json: &str) -> Bytes {
    let payload = format!("event: {}\ndata: {}\n\n", event, data_json);
    Bytes::from(payload)
}

#[get("/scrape/stream")]
async fn scrape_stream(q: web::Query<ScrapeParams>, base: web::Data<ScrapeConfig>) -> impl Responder {
    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    let cfg = q.apply(&base);
    let user_id = q.user_id();

    actix_web::rt::spawn(async move {
        let start = serde_json::json!({ "user_id": user_id, "max_pages": cfg.max_pages });
        let _ = tx.send(sse_event("start", &start.to_string())).await;

        let (ev_tx, mut ev_rx) = mpsc::channel::<PageEvent>(8);
        let forward = async {
            while let Some(ev) = ev_rx.recv().await {
                match serde_json::to_string(&ev) {
                    Ok(json) => {
                        let _ = tx.send(sse_event("page", &json)).await;
                    }
                    Err(e) => error!("page event encoding failed: {e}"),
                }
            }
        };
        let (result, ()) = tokio::join!(scrape_profile_streaming(user_id, &cfg, ev_tx), forward);

        match result {
            Ok(report) => {
                let done = serde_json::json!({
                    "user_id": user_id,
                    "pages": report.pages,
                    "total": report.listings.len(),
                    "stop_reason": report.stop,
                });
                let _ = tx.send(sse_event("done", &done.to_string())).await;
            }
            Err(e) => {
                let _ = tx
                    .send(sse_event("error", &error_json(e).to_string()))
                    .await;
            }
        }
    });

    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/event-stream"))
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("Connection", "keep-alive"))
        .streaming(stream)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let base = ScrapeConfig::from_env();
    let bind = std::env::var("ENC24_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    info!(%bind, mode = ?base.transport_mode, "starting enc24-claw");

    let data = web::Data::new(base);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .service(index)
            .service(healthz)
            .service(scrape_endpoint)
            .service(scrape_get)
            .service(scrape_csv)
            .service(scrape_stream)
    })
    .bind(&bind)
    .with_context(|| format!("cannot bind {bind}"))?
    .run()
    .await
    .context("server stopped")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_override_environment_defaults() {
        let base = ScrapeConfig::default();
        let params: ScrapeParams = serde_json::from_str(
            r#"{"user_id":12,"transport_mode":"http","max_pages":5000,"render_headless":false}"#,
        )
        .unwrap();
        let cfg = params.apply(&base);
        assert_eq!(params.user_id(), 12);
        assert_eq!(cfg.transport_mode, TransportMode::Http);
        assert_eq!(cfg.max_pages, enc24_claw::config::HARD_PAGE_CAP);
        assert!(!cfg.render_headless);
        assert_eq!(ScrapeParams::default().user_id(), DEFAULT_USER_ID);
    }

    #[test]
    fn sse_frames() {
        assert_eq!(
            sse_event("done", r#"{"total":3}"#),
            Bytes::from_static(b"event: done\ndata: {\"total\":3}\n\n")
        );
    }

    #[tokio::test]
    async fn start_failures_share_one_error_shape() {
        let err = ScrapeError::RenderUnavailable("no chrome".into());
        let rsp = start_failure(1, &err);
        assert_eq!(rsp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
        let body = actix_web::body::to_bytes(rsp.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, error_json(&err));
        assert_eq!(json["error"], "render backend unavailable: no chrome");
    }
}
