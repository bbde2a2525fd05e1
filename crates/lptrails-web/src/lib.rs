//! Axum HTTP surface for the trail status scraper.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lptrails_engine::{ScrapeEngine, ScrapeOptions, ScrapeOverrides};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lptrails-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScrapeEngine>,
    /// Options used when a request supplies no overrides.
    pub defaults: ScrapeOptions,
}

impl AppState {
    pub fn new(engine: Arc<ScrapeEngine>, defaults: ScrapeOptions) -> Self {
        Self { engine, defaults }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/TrailStatuses", get(trail_statuses_handler))
        .route("/api/trailstatuses", get(trail_statuses_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("LPTRAILS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trail_statuses_handler(
    State(state): State<Arc<AppState>>,
    Query(overrides): Query<ScrapeOverrides>,
) -> Response {
    let options = state.defaults.clone().with_overrides(&overrides);
    let engine = state.engine.clone();

    // A panic inside the scrape surfaces as a JoinError instead of killing the connection.
    match tokio::spawn(async move { engine.get_trail_statuses(&options).await }).await {
        Ok(result) => Json(&*result).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn server_error(message: String) -> Response {
    error!(%message, "scrape task failed");
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use lptrails_core::{EventType, ScraperResult, TrailState};
    use lptrails_storage::{FetchError, PageFetcher, ResultCache, UrlLookupCache};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const STATUS_PAGE: &str = "status.html";
    const MIRROR_PAGE: &str = "mirror.html";

    struct StaticFetcher {
        pages: HashMap<&'static str, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch_text(&self, url: &str, _timeout: Duration) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Other(format!("no page at {url}")))
        }
    }

    struct PanickingFetcher;

    #[async_trait]
    impl PageFetcher for PanickingFetcher {
        async fn fetch_text(&self, _url: &str, _timeout: Duration) -> Result<String, FetchError> {
            panic!("fetcher blew up");
        }
    }

    fn page(trail: &str, status: &str) -> String {
        format!(
            r#"<html><body><table id="tablepress-14">
              <tr><th>Route</th><th>Info</th><th>Status</th></tr>
              <tr><td>{trail}</td><td></td><td>{status}</td></tr>
            </table></body></html>"#
        )
    }

    fn fetcher() -> Arc<StaticFetcher> {
        Arc::new(StaticFetcher {
            pages: HashMap::from([
                (STATUS_PAGE, page("PR LP 01", "Abierto / Open / Geöffnet")),
                (MIRROR_PAGE, page("SL BV 200", "Cerrado / Closed / Gesperrt")),
            ]),
            calls: AtomicUsize::new(0),
        })
    }

    fn test_app(fetcher: Arc<dyn PageFetcher>) -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let engine = ScrapeEngine::new(
            fetcher,
            Arc::new(UrlLookupCache::new(dir.path().join("lookups.txt"))),
            Arc::new(ResultCache::default()),
        );
        let defaults = ScrapeOptions {
            status_page: STATUS_PAGE.into(),
            ..Default::default()
        };
        (dir, app(AppState::new(Arc::new(engine), defaults)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn trail_statuses_returns_scrape_as_json() {
        let (_dir, app) = test_app(fetcher());

        let (status, body) = get(app, "/api/TrailStatuses").await;

        assert_eq!(status, StatusCode::OK);
        let result: ScraperResult = serde_json::from_str(&body).unwrap();
        assert_eq!(result.result.event_type, EventType::Success);
        assert_eq!(result.trails.len(), 1);
        assert_eq!(result.trails[0].name, "PR LP 01");
        assert_eq!(result.trails[0].status, TrailState::Open);
        assert!(body.contains(r#""lastScraped""#));
    }

    #[tokio::test]
    async fn query_overrides_are_applied() {
        let (_dir, app) = test_app(fetcher());

        let (status, body) = get(
            app,
            "/api/trailstatuses?statusPage=mirror.html&statusPageTimeout=750&useCache=false&clearLookups=true",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let result: ScraperResult = serde_json::from_str(&body).unwrap();
        assert_eq!(result.trails[0].name, "SL BV 200");
        assert_eq!(result.trails[0].status, TrailState::Closed);
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let fetcher = fetcher();
        let (_dir, app) = test_app(fetcher.clone());

        let (first, _) = get(app.clone(), "/api/TrailStatuses").await;
        let calls_after_first = fetcher.calls.load(Ordering::SeqCst);
        let (second, _) = get(app, "/api/TrailStatuses").await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn boolean_flags_accept_any_letter_case() {
        let fetcher = fetcher();
        let (_dir, app) = test_app(fetcher.clone());

        let (first, _) = get(app.clone(), "/api/TrailStatuses?useCache=True").await;
        let calls_after_first = fetcher.calls.load(Ordering::SeqCst);
        let (second, _) = get(app, "/api/TrailStatuses?useCache=FALSE&clearLookups=False").await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert!(fetcher.calls.load(Ordering::SeqCst) > calls_after_first);
    }

    #[tokio::test]
    async fn unknown_flag_value_is_rejected() {
        let (_dir, app) = test_app(fetcher());

        let (status, _) = get(app, "/api/TrailStatuses?useCache=yes").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_status_page_still_returns_ok_with_failure_result() {
        let (_dir, app) = test_app(fetcher());

        let (status, body) = get(app, "/api/TrailStatuses?statusPage=missing.html").await;

        assert_eq!(status, StatusCode::OK);
        let result: ScraperResult = serde_json::from_str(&body).unwrap();
        assert_eq!(result.result.event_type, EventType::Exception);
        assert_eq!(result.result.message, "Cannot read data");
        assert!(result.trails.is_empty());
    }

    #[tokio::test]
    async fn malformed_query_is_rejected() {
        let (_dir, app) = test_app(fetcher());

        let (status, _) = get(app, "/api/TrailStatuses?statusPageTimeout=soon").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn panicking_scrape_maps_to_server_error() {
        let (_dir, app) = test_app(Arc::new(PanickingFetcher));

        let (status, body) = get(app, "/api/TrailStatuses").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("panicked"));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_dir, app) = test_app(fetcher());

        let (status, body) = get(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }
}
