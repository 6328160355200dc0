//! Observability event contract.
//!
//! The engine never logs or records metrics itself; every notable moment is
//! pushed through an [`EventSink`] and the embedder decides what to do with
//! it. Fragments receive a clone of the sink rather than a handle to the
//! request handler, which keeps the ownership graph acyclic.

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;

use crate::error::FragmentErrorKind;

/// Lifecycle events of a single fragment request.
#[derive(Debug, Clone)]
pub enum FragmentEventKind {
    /// Request dispatched upstream.
    Start,
    /// Response head received and accepted.
    Response {
        status: StatusCode,
        headers: HeaderMap,
    },
    /// Body fully consumed.
    End { bytes: u64 },
    /// Terminal failure.
    Error { kind: FragmentErrorKind },
    /// Primary URL failed, fallback URL served instead.
    Fallback { kind: FragmentErrorKind },
    /// No response head within the fragment's timeout.
    Timeout,
    /// Non-fatal condition (retry scheduled, attribute degraded).
    Warn { reason: String },
}

/// A fragment lifecycle event together with the fragment's identity.
#[derive(Debug, Clone)]
pub struct FragmentEvent {
    /// Index assigned by the composition index generator.
    pub index: usize,
    /// Optional stable identifier from the template tag.
    pub id: Option<String>,
    /// Upstream URL the event refers to.
    pub url: String,
    pub kind: FragmentEventKind,
}

/// Events emitted for one composed request.
#[derive(Debug, Clone)]
pub enum ComposeEvent {
    /// Composition started.
    Start { path: String },
    /// Response head written.
    Response { status: StatusCode },
    /// Response body finished; `bytes` is the count actually passed downstream.
    End { bytes: u64 },
    /// Composition failed before the head was written.
    Error { reason: String },
    /// Context fetch failed and an empty context was substituted.
    ContextError { reason: String },
    Fragment(FragmentEvent),
}

/// Push-only event channel handed to the engine.
///
/// Sending never fails from the caller's point of view: a dropped receiver
/// just means nobody is listening.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ComposeEvent>,
}

impl EventSink {
    /// Create a sink and the receiving half for the embedder to consume.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ComposeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink that discards every event.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    pub fn emit(&self, event: ComposeEvent) {
        // Ignore errors - just means no subscribers currently
        let _ = self.tx.send(event);
    }

    pub fn emit_fragment(
        &self,
        index: usize,
        id: Option<&str>,
        url: &str,
        kind: FragmentEventKind,
    ) {
        self.emit(ComposeEvent::Fragment(FragmentEvent {
            index,
            id: id.map(str::to_owned),
            url: url.to_owned(),
            kind,
        }));
    }
}
