//! HTTP listener and composition route.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use weft_engine::{ComposeRequest, Composer};

use crate::config::ServerConfig;
use crate::error::Result;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The composition engine.
    pub composer: Arc<Composer>,
    /// Server start time for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(composer: Arc<Composer>) -> Self {
        Self {
            composer,
            start_time: Instant::now(),
        }
    }
}

/// Assemble the router: health endpoint plus the composition fallback that
/// serves every other path.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .fallback(compose_page)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn compose_page(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.rsplit_once(':').map_or(host, |(name, _)| name).to_string());

    let compose_request = ComposeRequest {
        path,
        host,
        headers: request.headers().clone(),
    };
    let composed = state.composer.handle(compose_request).await;

    let mut response = Response::new(Body::from_stream(composed.body));
    *response.status_mut() = composed.status;
    *response.headers_mut() = composed.headers;
    response
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(config: ServerConfig, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let address = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&address).await?;
    info!(address = %address, "weft-server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
