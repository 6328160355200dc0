//! Fragment request lifecycle.
//!
//! A [`Fragment`] owns one upstream request: dispatch, first-byte timeout,
//! transient-error retry, fallback URL, and body streaming. The body is
//! exposed as a bounded channel that yields nothing until the upstream body
//! phase begins; lifecycle moments are pushed through the request's
//! [`EventSink`].

pub mod attributes;
pub mod links;
pub mod retry;

pub use attributes::{FragmentAttributes, TagAttributes};

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ComposerConfig;
use crate::error::FragmentErrorKind;
use crate::events::{EventSink, FragmentEventKind};
use retry::{RetryAction, retry_with_backoff};

/// Capacity of the per-fragment body channel. Keeps backpressure between an
/// upstream and the composed output without head-of-line blocking the fetch.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Terminal outcome of one fragment request. Exactly one is produced.
#[derive(Debug, Clone)]
pub enum FragmentOutcome {
    /// Body fully streamed from the fragment's own URL.
    Ended { bytes: u64, scripts: Vec<String> },
    /// The fallback URL served the body after the primary URL failed.
    Fallback {
        kind: FragmentErrorKind,
        scripts: Vec<String>,
    },
    /// Nothing usable was streamed; the composition substitutes fallback
    /// content.
    Errored { kind: FragmentErrorKind },
}

/// Head decision sent by the primary fragment to the request handler.
#[derive(Debug)]
pub enum PrimaryUpdate {
    Response {
        status: StatusCode,
        headers: HeaderMap,
    },
    Fallback,
    Error,
}

/// Incoming-request metadata shared by every fragment of one composition.
#[derive(Debug)]
pub struct RequestMeta {
    /// Host of the page request, for cross-origin preload decisions.
    pub host: Option<String>,
    /// Full incoming header set minus hop-by-hop headers.
    pub public_headers: HeaderMap,
    /// Allow-listed subset forwarded to non-public fragments.
    pub private_headers: HeaderMap,
}

const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const PRIVATE_FORWARD: [&str; 3] = ["accept-language", "referer", "user-agent"];

impl RequestMeta {
    pub fn new(incoming: &HeaderMap, host: Option<String>) -> Self {
        let mut public_headers = incoming.clone();
        for name in HOP_BY_HOP {
            public_headers.remove(name);
        }

        let mut private_headers = HeaderMap::new();
        for name in PRIVATE_FORWARD {
            let header = HeaderName::from_static(name);
            for value in incoming.get_all(&header) {
                private_headers.append(header.clone(), value.clone());
            }
        }

        Self {
            host,
            public_headers,
            private_headers,
        }
    }
}

/// Receiving side of a dispatched fragment.
pub struct FragmentHandles {
    pub body: mpsc::Receiver<Bytes>,
    pub outcome: oneshot::Receiver<FragmentOutcome>,
}

/// One upstream fragment request.
pub struct Fragment {
    attrs: FragmentAttributes,
    index: usize,
    config: Arc<ComposerConfig>,
    client: reqwest::Client,
    request: Arc<RequestMeta>,
    events: EventSink,
    token: CancellationToken,
}

impl Fragment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attrs: FragmentAttributes,
        index: usize,
        config: Arc<ComposerConfig>,
        client: reqwest::Client,
        request: Arc<RequestMeta>,
        events: EventSink,
        token: CancellationToken,
    ) -> Self {
        Self {
            attrs,
            index,
            config,
            client,
            request,
            events,
            token,
        }
    }

    pub fn attrs(&self) -> &FragmentAttributes {
        &self.attrs
    }

    /// Dispatch the request. All fragments of a template are dispatched
    /// up-front, so the fetch runs concurrently with composition.
    ///
    /// `primary_tx` is set for the page's primary fragment and receives the
    /// head decision; `hints_tx` is set for non-primary fragments that opted
    /// into header propagation and receives their preload hints.
    pub fn fetch(
        self,
        primary_tx: Option<oneshot::Sender<PrimaryUpdate>>,
        hints_tx: Option<mpsc::UnboundedSender<Vec<String>>>,
    ) -> FragmentHandles {
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        tokio::spawn(self.run(body_tx, outcome_tx, primary_tx, hints_tx));

        FragmentHandles {
            body: body_rx,
            outcome: outcome_rx,
        }
    }

    async fn run(
        self,
        body_tx: mpsc::Sender<Bytes>,
        outcome_tx: oneshot::Sender<FragmentOutcome>,
        mut primary_tx: Option<oneshot::Sender<PrimaryUpdate>>,
        hints_tx: Option<mpsc::UnboundedSender<Vec<String>>>,
    ) {
        self.emit(FragmentEventKind::Start);
        let timeout = self
            .attrs
            .timeout
            .unwrap_or(self.config.default_fragment_timeout);

        let failure = match self.attempt(&self.attrs.src, timeout).await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                self.emit(FragmentEventKind::Response {
                    status,
                    headers: headers.clone(),
                });
                if let Some(tx) = primary_tx.take() {
                    let _ = tx.send(PrimaryUpdate::Response {
                        status,
                        headers: headers.clone(),
                    });
                }
                if let Some(tx) = &hints_tx {
                    let _ = tx.send(links::preload_hints(&headers, self.request.host.as_deref()));
                }

                let scripts = links::script_uris(&headers);
                match self.stream_body(response, &body_tx).await {
                    BodyResult::Complete(bytes) => {
                        self.emit(FragmentEventKind::End { bytes });
                        let _ = outcome_tx.send(FragmentOutcome::Ended { bytes, scripts });
                    }
                    BodyResult::Failed(kind) => {
                        // Bytes may already be spliced inline; the fallback
                        // URL is only for pre-response failures.
                        self.emit(FragmentEventKind::Error { kind: kind.clone() });
                        let _ = outcome_tx.send(FragmentOutcome::Errored { kind });
                    }
                    BodyResult::Abandoned => {}
                }
                return;
            }
            Err(FragmentErrorKind::Cancelled) => return,
            Err(kind) => kind,
        };

        if let Some(fallback_url) = self.attrs.fallback_url.clone() {
            match self.attempt(&fallback_url, timeout).await {
                Ok(response) => {
                    self.emit(FragmentEventKind::Fallback {
                        kind: failure.clone(),
                    });
                    if let Some(tx) = primary_tx.take() {
                        let _ = tx.send(PrimaryUpdate::Fallback);
                    }

                    let scripts = links::script_uris(response.headers());
                    match self.stream_body(response, &body_tx).await {
                        BodyResult::Complete(_) => {
                            let _ = outcome_tx.send(FragmentOutcome::Fallback {
                                kind: failure,
                                scripts,
                            });
                        }
                        BodyResult::Failed(kind) => {
                            // `fallback` was already this fragment's terminal
                            // event; downgrade the body failure to a warning.
                            self.emit(FragmentEventKind::Warn {
                                reason: format!("fallback body failed: {kind}"),
                            });
                            let _ = outcome_tx.send(FragmentOutcome::Errored { kind });
                        }
                        BodyResult::Abandoned => {}
                    }
                    return;
                }
                Err(FragmentErrorKind::Cancelled) => return,
                Err(fallback_failure) => {
                    self.emit(FragmentEventKind::Warn {
                        reason: format!("fallback URL failed: {fallback_failure}"),
                    });
                }
            }
        }

        self.emit(FragmentEventKind::Error {
            kind: failure.clone(),
        });
        if let Some(tx) = primary_tx.take() {
            let _ = tx.send(PrimaryUpdate::Error);
        }
        let _ = outcome_tx.send(FragmentOutcome::Errored { kind: failure });
    }

    /// One URL attempt: dispatch with the first-byte timeout, retrying
    /// transient transport errors per the engine policy.
    async fn attempt(
        &self,
        url: &Url,
        timeout: std::time::Duration,
    ) -> Result<reqwest::Response, FragmentErrorKind> {
        retry_with_backoff(&self.config.retry, &self.token, |attempt| {
            let url = url.clone();
            async move {
                if attempt > 0 {
                    self.emit(FragmentEventKind::Warn {
                        reason: format!("retrying after transport error (attempt {attempt})"),
                    });
                }

                let headers = if self.attrs.public {
                    self.request.public_headers.clone()
                } else {
                    self.request.private_headers.clone()
                };
                let send = self.client.get(url).headers(headers).send();

                let result = tokio::select! {
                    _ = self.token.cancelled() => {
                        return RetryAction::Fail(FragmentErrorKind::Cancelled);
                    }
                    result = tokio::time::timeout(timeout, send) => result,
                };

                match result {
                    Err(_elapsed) => {
                        self.emit(FragmentEventKind::Timeout);
                        RetryAction::Fail(FragmentErrorKind::Timeout)
                    }
                    Ok(Ok(response)) => {
                        let status = response.status();
                        // 3xx is accepted: a redirecting primary promotes its
                        // status and location to the page response.
                        if status.is_success() || status.is_redirection() {
                            RetryAction::Success(response)
                        } else {
                            RetryAction::Fail(FragmentErrorKind::Status { status })
                        }
                    }
                    Ok(Err(e)) if e.is_connect() || e.is_request() => {
                        RetryAction::Retry(FragmentErrorKind::Transport {
                            reason: e.to_string(),
                        })
                    }
                    Ok(Err(e)) => RetryAction::Fail(FragmentErrorKind::Transport {
                        reason: e.to_string(),
                    }),
                }
            }
        })
        .await
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        body_tx: &mpsc::Sender<Bytes>,
    ) -> BodyResult {
        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = self.token.cancelled() => return BodyResult::Abandoned,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    bytes += chunk.len() as u64;
                    if body_tx.send(chunk).await.is_err() {
                        return BodyResult::Abandoned;
                    }
                }
                Some(Err(e)) => {
                    return BodyResult::Failed(FragmentErrorKind::Body {
                        reason: e.to_string(),
                    });
                }
                None => return BodyResult::Complete(bytes),
            }
        }
    }

    fn emit(&self, kind: FragmentEventKind) {
        self.events
            .emit_fragment(self.index, self.attrs.id.as_deref(), self.attrs.src.as_str(), kind);
    }
}

enum BodyResult {
    Complete(u64),
    Failed(FragmentErrorKind),
    /// The consumer went away or the request was cancelled; no terminal
    /// event is emitted.
    Abandoned,
}
