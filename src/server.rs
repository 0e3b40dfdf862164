//! HTTP endpoints.
//!
//! `GET /metrics` runs one scrape and answers with the text exposition format.
//! `GET /` serves a static page linking to the metrics.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::error;

use crate::metrics::{render, CertificateCollector};
use crate::source::SecretSource;

const INDEX_PAGE: &str = r#"<html>
<head><title>HLF cert exporter</title></head>
<body>
<h1>HLF cert exporter</h1>
<p><a href='/metrics'>Metrics</a></p>
</body>
</html>"#;

/// State shared by all requests.
pub struct AppState {
    pub collector: CertificateCollector<dyn SecretSource>,
    /// Process-wide metrics appended to every scrape
    pub registry: Registry,
    /// Terminate the process on a failed scrape instead of answering 500
    pub exit_on_scrape_error: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the router until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

pub async fn index_handler() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Handler for GET /metrics
///
/// A failed scrape answers 500 with the error message, or terminates the
/// process when `exit_on_scrape_error` is set.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut families = match state.collector.collect().await {
        Ok(families) => families,
        Err(e) => {
            error!(error = %e, "Scrape failed");
            if state.exit_on_scrape_error {
                std::process::exit(1);
            }
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("scrape failed: {}", e),
            )
                .into_response();
        }
    };
    families.extend(state.registry.gather());

    match render(&families) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}
