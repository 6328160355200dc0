//! weft-server - Streaming HTML fragment composition server
//!
//! Fetches a page template per request, resolves its fragment placeholders
//! from upstream services concurrently, and streams the assembled document.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use weft_engine::{Composer, ContextFetcher, EventSink, StaticContext};
use weft_server::config::ServerConfig;
use weft_server::context::HttpContextFetcher;
use weft_server::logging::init_logging;
use weft_server::server::{AppState, serve};
use weft_server::templates::FsTemplateFetcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before anything reads them.
    dotenvy::dotenv().ok();
    init_logging()?;

    info!("Starting weft-server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env_or_default();
    let composer_config = config.composer_config();

    let (events, events_rx) = EventSink::channel();
    let event_logger = weft_server::events::spawn_event_logger(events_rx);

    let templates = Arc::new(FsTemplateFetcher::new(
        &config,
        &composer_config.fragment_tag,
    )?);
    let context: Arc<dyn ContextFetcher> = match &config.context_url {
        Some(url) => {
            info!(endpoint = %url, "using HTTP context fetcher");
            Arc::new(HttpContextFetcher::new(url.clone())?)
        }
        None => Arc::new(StaticContext::default()),
    };

    let composer = Arc::new(Composer::new(composer_config, templates, context, events)?);
    let state = AppState::new(composer);

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(config, state, shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => info!("weft-server stopped"),
        Ok(Err(e)) => error!("Server error during shutdown: {e}"),
        Err(e) => error!("Server task failed: {e}"),
    }
    event_logger.abort();

    Ok(())
}

async fn wait_for_sigterm() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}
