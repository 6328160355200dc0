//! Request-level composition pipeline.
//!
//! [`Composer::handle`] is the engine's front door: it fetches the template
//! and context in parallel, dispatches every fragment, resolves the
//! head-write latch, and returns a response whose body streams through the
//! content-length meter. The HTTP listener only has to copy status and
//! headers and pipe the body.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::StatusCode;
use reqwest::header::{
    CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue, LINK, LOCATION, PRAGMA,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ComposerConfig;
use crate::error::ComposeError;
use crate::events::{ComposeEvent, EventSink};
use crate::fragment::{FragmentAttributes, PrimaryUpdate, RequestMeta, links};
use crate::stream::{AsyncSection, MeteredStream};
use crate::template::{TemplateToken, processor};

/// Per-request context resolved by the [`ContextFetcher`]: slot name to HTML.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Composed response body: a metered byte stream.
pub type ResponseBody = Pin<Box<dyn Stream<Item = Result<Bytes, ComposeError>> + Send>>;

/// The incoming page request, reduced to what composition needs.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    /// Request path, used to select the template.
    pub path: String,
    /// Host the page was requested from, for cross-origin preload decisions.
    pub host: Option<String>,
    /// Incoming request headers, forwarded to fragments per their `public`
    /// attribute.
    pub headers: HeaderMap,
}

impl ComposeRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Resolves a request to parsed template tokens.
#[async_trait]
pub trait TemplateFetcher: Send + Sync {
    async fn fetch(&self, request: &ComposeRequest) -> Result<Vec<TemplateToken>, ComposeError>;
}

/// Resolves a request to its slot context. Failures are recovered to an
/// empty context by the composer.
#[async_trait]
pub trait ContextFetcher: Send + Sync {
    async fn fetch(&self, request: &ComposeRequest) -> Result<Context, ComposeError>;
}

/// Context fetcher that always resolves to the same map.
#[derive(Debug, Clone, Default)]
pub struct StaticContext(pub Context);

#[async_trait]
impl ContextFetcher for StaticContext {
    async fn fetch(&self, _request: &ComposeRequest) -> Result<Context, ComposeError> {
        Ok(self.0.clone())
    }
}

/// Projection applied to the primary fragment's upstream response headers
/// before they are merged into the page response.
pub trait ResponseHeaderFilter: Send + Sync {
    fn filter(&self, attrs: &FragmentAttributes, headers: &HeaderMap) -> HeaderMap;
}

/// Default projection: nothing passes. `location` and the `link` preload
/// hints are promoted separately by the composer.
#[derive(Debug, Clone, Default)]
pub struct NoResponseHeaders;

impl ResponseHeaderFilter for NoResponseHeaders {
    fn filter(&self, _attrs: &FragmentAttributes, _headers: &HeaderMap) -> HeaderMap {
        HeaderMap::new()
    }
}

/// Response head and body produced for one page request.
pub struct ComposedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

/// The composition engine, shared across requests.
pub struct Composer {
    config: Arc<ComposerConfig>,
    client: reqwest::Client,
    templates: Arc<dyn TemplateFetcher>,
    context: Arc<dyn ContextFetcher>,
    header_filter: Arc<dyn ResponseHeaderFilter>,
    events: EventSink,
}

impl Composer {
    pub fn new(
        config: ComposerConfig,
        templates: Arc<dyn TemplateFetcher>,
        context: Arc<dyn ContextFetcher>,
        events: EventSink,
    ) -> Result<Self, ComposeError> {
        let client = config.build_client()?;
        Ok(Self {
            config: Arc::new(config),
            client,
            templates,
            context,
            header_filter: Arc::new(NoResponseHeaders),
            events,
        })
    }

    /// Replace the primary-response header projection.
    pub fn with_header_filter(mut self, filter: Arc<dyn ResponseHeaderFilter>) -> Self {
        self.header_filter = filter;
        self
    }

    /// Handle one page request. Errors never escape: failures before the
    /// head-write become error responses (404 for a missing template, 500
    /// otherwise), optionally carrying a presentable body.
    pub async fn handle(&self, request: ComposeRequest) -> ComposedResponse {
        match self.compose(request).await {
            Ok(response) => response,
            Err(err) => self.error_response(&err),
        }
    }

    async fn compose(&self, request: ComposeRequest) -> Result<ComposedResponse, ComposeError> {
        self.events.emit(ComposeEvent::Start {
            path: request.path.clone(),
        });
        let token = CancellationToken::new();

        let (context_result, template_result) = tokio::join!(
            self.context.fetch(&request),
            self.templates.fetch(&request)
        );
        let context = match context_result {
            Ok(context) => context,
            Err(err) => {
                self.events.emit(ComposeEvent::ContextError {
                    reason: err.to_string(),
                });
                Context::new()
            }
        };
        let tokens = template_result?;

        let meta = Arc::new(RequestMeta::new(&request.headers, request.host.clone()));
        let (page, mut hooks) = processor::prepare(
            tokens,
            &self.config,
            &self.client,
            &meta,
            &self.events,
            &token,
        );

        let (out_tx, out_rx) = processor::output_channel();
        let (section, drain) = AsyncSection::new(token.clone());
        tokio::spawn(processor::stream(
            page,
            context,
            self.config.clone(),
            out_tx,
            section,
            drain,
            token.clone(),
        ));

        // Head-write latch: resolved exactly once, before any body byte. A
        // page with a primary waits for its head decision; without one the
        // token walk already finished (every fragment is dispatched), so the
        // head is written immediately and the body pipes progressively.
        let decision = match hooks.primary_rx.take() {
            Some(primary_rx) => match primary_rx.await {
                Ok(PrimaryUpdate::Response { status, headers }) => {
                    HeadDecision::Primary { status, headers }
                }
                Ok(PrimaryUpdate::Fallback) => HeadDecision::PrimaryFallback,
                // A vanished primary task is indistinguishable from a failed one.
                Ok(PrimaryUpdate::Error) | Err(_) => HeadDecision::PrimaryError,
            },
            None => HeadDecision::Finished,
        };

        let mut headers = baseline_headers();
        let status = match decision {
            HeadDecision::Primary {
                status,
                headers: upstream,
            } => {
                if let Some(attrs) = &hooks.primary_attrs {
                    merge_headers(&mut headers, self.header_filter.filter(attrs, &upstream));
                }
                if let Some(location) = upstream.get(LOCATION) {
                    headers.insert(LOCATION, location.clone());
                }

                let mut hints = links::preload_hints(&upstream, request.host.as_deref());
                while let Ok(more) = hooks.hints_rx.try_recv() {
                    hints.extend(more);
                }
                apply_link_header(&mut headers, &hints);
                status
            }
            HeadDecision::PrimaryFallback => StatusCode::INTERNAL_SERVER_ERROR,
            HeadDecision::PrimaryError => {
                // The page cannot be served without its primary; stop the
                // remaining fetches and end with an empty body.
                token.cancel();
                self.events.emit(ComposeEvent::Error {
                    reason: "primary fragment failed".to_string(),
                });
                return Ok(self.head_only_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
            HeadDecision::Finished => StatusCode::OK,
        };

        self.events.emit(ComposeEvent::Response { status });
        let body = ReceiverStream::new(out_rx).map(Ok::<Bytes, ComposeError>);
        Ok(ComposedResponse {
            status,
            headers,
            body: self.metered(body),
        })
    }

    /// Error surface for failures before the head-write.
    fn error_response(&self, err: &ComposeError) -> ComposedResponse {
        self.events.emit(ComposeEvent::Error {
            reason: err.to_string(),
        });
        let status = err.status_code();
        let chunks = err
            .presentable()
            .map(|body| Bytes::copy_from_slice(body.as_bytes()))
            .into_iter()
            .map(Ok)
            .collect::<Vec<_>>();
        ComposedResponse {
            status,
            headers: baseline_headers(),
            body: self.metered(stream::iter(chunks)),
        }
    }

    fn head_only_response(&self, status: StatusCode) -> ComposedResponse {
        self.events.emit(ComposeEvent::Response { status });
        ComposedResponse {
            status,
            headers: baseline_headers(),
            body: self.metered(stream::empty()),
        }
    }

    /// Wrap a body in the content-length meter; the meter's completion is
    /// the request's `end` event, fired with the bytes actually passed.
    fn metered<S>(&self, body: S) -> ResponseBody
    where
        S: Stream<Item = Result<Bytes, ComposeError>> + Send + Unpin + 'static,
    {
        let events = self.events.clone();
        Box::pin(MeteredStream::new(body, move |bytes| {
            events.emit(ComposeEvent::End { bytes });
        }))
    }
}

enum HeadDecision {
    Primary {
        status: StatusCode,
        headers: HeaderMap,
    },
    PrimaryFallback,
    PrimaryError,
    Finished,
}

fn baseline_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers
}

fn merge_headers(into: &mut HeaderMap, from: HeaderMap) {
    let mut current = None;
    for (name, value) in from {
        // HeaderMap iteration yields the name only on the first value of a
        // repeated header.
        if let Some(name) = name {
            current = Some(name);
        }
        if let Some(name) = &current {
            into.append(name.clone(), value);
        }
    }
}

fn apply_link_header(headers: &mut HeaderMap, hints: &[String]) {
    if hints.is_empty() {
        return;
    }
    match HeaderValue::from_str(&hints.join(", ")) {
        Ok(value) => {
            headers.insert(LINK, value);
        }
        Err(e) => warn!(error = %e, "preload hints produced an invalid link header"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_headers_disable_caching() {
        let headers = baseline_headers();
        assert_eq!(
            headers.get(CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(headers.get(PRAGMA).unwrap(), "no-cache");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
    }

    #[test]
    fn merge_headers_keeps_repeated_values() {
        let mut into = HeaderMap::new();
        let mut from = HeaderMap::new();
        from.append("x-tag", "one".parse().unwrap());
        from.append("x-tag", "two".parse().unwrap());
        merge_headers(&mut into, from);
        let values: Vec<_> = into.get_all("x-tag").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn link_header_joins_hints() {
        let mut headers = HeaderMap::new();
        apply_link_header(
            &mut headers,
            &[
                "<http://cdn/a.css>; rel=\"preload\"; as=\"style\"; nopush".to_string(),
                "<http://cdn/b.js>; rel=\"preload\"; as=\"script\"; nopush".to_string(),
            ],
        );
        assert_eq!(
            headers.get(LINK).unwrap(),
            "<http://cdn/a.css>; rel=\"preload\"; as=\"style\"; nopush, <http://cdn/b.js>; rel=\"preload\"; as=\"script\"; nopush"
        );
    }

    #[test]
    fn empty_hints_leave_link_absent() {
        let mut headers = HeaderMap::new();
        apply_link_header(&mut headers, &[]);
        assert!(headers.get(LINK).is_none());
    }
}
