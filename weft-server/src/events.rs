//! Engine event consumption.
//!
//! The engine pushes [`ComposeEvent`]s into a channel; this task translates
//! them into tracing records so observability stays outside the engine.

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weft_engine::{ComposeEvent, FragmentEventKind};

/// Spawn the task that drains engine events into the log.
pub fn spawn_event_logger(mut rx: UnboundedReceiver<ComposeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(event);
        }
    })
}

fn log_event(event: ComposeEvent) {
    match event {
        ComposeEvent::Start { path } => debug!(path = %path, "composition started"),
        ComposeEvent::Response { status } => debug!(status = %status, "response head written"),
        ComposeEvent::End { bytes } => info!(bytes, "response finished"),
        ComposeEvent::Error { reason } => warn!(reason = %reason, "composition failed"),
        ComposeEvent::ContextError { reason } => {
            warn!(reason = %reason, "context fetch failed, using empty context")
        }
        ComposeEvent::Fragment(fragment) => {
            let index = fragment.index;
            let id = fragment.id.as_deref().unwrap_or("-");
            let url = fragment.url.as_str();
            match fragment.kind {
                FragmentEventKind::Start => {
                    debug!(index, id, url, "fragment dispatched")
                }
                FragmentEventKind::Response { status, .. } => {
                    debug!(index, id, url, status = %status, "fragment responded")
                }
                FragmentEventKind::End { bytes } => {
                    debug!(index, id, url, bytes, "fragment ended")
                }
                FragmentEventKind::Error { kind } => {
                    warn!(index, id, url, error = %kind, "fragment failed")
                }
                FragmentEventKind::Fallback { kind } => {
                    warn!(index, id, url, error = %kind, "fragment served from fallback URL")
                }
                FragmentEventKind::Timeout => {
                    warn!(index, id, url, "fragment timed out")
                }
                FragmentEventKind::Warn { reason } => {
                    warn!(index, id, url, reason = %reason, "fragment warning")
                }
            }
        }
    }
}
