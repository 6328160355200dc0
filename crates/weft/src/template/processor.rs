//! Token-stream to byte-stream composition.
//!
//! Materialisation dispatches every fragment fetch before a single byte is
//! emitted, so upstreams run concurrently regardless of where their output
//! lands in the document. The streaming pass then walks the tokens in order,
//! splicing inline fragment bodies between their client-side hook markers and
//! deferring async fragments to the trailing section.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compose::Context;
use crate::config::ComposerConfig;
use crate::error::ComposeError;
use crate::events::{EventSink, FragmentEventKind};
use crate::fragment::{
    Fragment, FragmentAttributes, FragmentHandles, FragmentOutcome, PrimaryUpdate, RequestMeta,
};
use crate::stream::{AsyncSection, Attachment, SectionDrain};
use crate::template::{IndexGenerator, TemplateToken};

/// Capacity of the composed output channel.
const OUTPUT_CHANNEL_CAPACITY: usize = 32;

pub(crate) struct PreparedFragment {
    index: usize,
    attrs: FragmentAttributes,
    handles: FragmentHandles,
    pipe_attrs: Option<String>,
}

enum PageItem {
    Raw(Bytes),
    Slot(String),
    Inline(PreparedFragment),
    Async(PreparedFragment),
}

/// A template with every fragment fetch already in flight.
pub(crate) struct PreparedPage {
    items: Vec<PageItem>,
}

/// Channels the head-write latch listens on, split from the page so the
/// streaming pass can own the items.
pub(crate) struct PageHooks {
    /// Attributes of the surviving primary fragment, if any.
    pub primary_attrs: Option<FragmentAttributes>,
    /// Head decision channel from the primary fragment.
    pub primary_rx: Option<oneshot::Receiver<PrimaryUpdate>>,
    /// Preload hints from non-primary fragments that opted in.
    pub hints_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

/// Output channel pair for one composition.
pub(crate) fn output_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(OUTPUT_CHANNEL_CAPACITY)
}

/// Walk the tokens, enforce per-template fragment invariants, and dispatch
/// every fragment fetch.
pub(crate) fn prepare(
    tokens: Vec<TemplateToken>,
    config: &Arc<ComposerConfig>,
    client: &reqwest::Client,
    request: &Arc<RequestMeta>,
    events: &EventSink,
    token: &CancellationToken,
) -> (PreparedPage, PageHooks) {
    let mut generator = IndexGenerator::new(config.index_step());
    let mut items = Vec::with_capacity(tokens.len());
    let mut primary_attrs = None;
    let mut primary_rx = None;
    let (hints_tx, hints_rx) = mpsc::unbounded_channel();

    for parsed in tokens {
        match parsed {
            TemplateToken::Raw(bytes) => items.push(PageItem::Raw(bytes)),
            TemplateToken::Slot(name) => items.push(PageItem::Slot(name)),
            TemplateToken::Fragment(mut attrs) => {
                let index = generator.next_index();

                if attrs.primary && primary_attrs.is_some() {
                    events.emit_fragment(
                        index,
                        attrs.id.as_deref(),
                        attrs.src.as_str(),
                        FragmentEventKind::Warn {
                            reason: "page already has a primary fragment".to_string(),
                        },
                    );
                    attrs.primary = false;
                }
                if attrs.primary && attrs.is_async {
                    // An async primary cannot precede the head it must set.
                    events.emit_fragment(
                        index,
                        attrs.id.as_deref(),
                        attrs.src.as_str(),
                        FragmentEventKind::Warn {
                            reason: "async ignored on the primary fragment".to_string(),
                        },
                    );
                    attrs.is_async = false;
                }

                let fragment_primary_tx = if attrs.primary {
                    let (tx, rx) = oneshot::channel();
                    primary_attrs = Some(attrs.clone());
                    primary_rx = Some(rx);
                    Some(tx)
                } else {
                    None
                };
                let fragment_hints_tx = (!attrs.primary && attrs.return_headers)
                    .then(|| hints_tx.clone());

                let pipe_attrs = pipe_attributes_json(config, &attrs);
                let fragment = Fragment::new(
                    attrs.clone(),
                    index,
                    config.clone(),
                    client.clone(),
                    request.clone(),
                    events.clone(),
                    token.clone(),
                );
                let handles = fragment.fetch(fragment_primary_tx, fragment_hints_tx);

                let prepared = PreparedFragment {
                    index,
                    attrs,
                    handles,
                    pipe_attrs,
                };
                if prepared.attrs.is_async {
                    items.push(PageItem::Async(prepared));
                } else {
                    items.push(PageItem::Inline(prepared));
                }
            }
        }
    }

    (
        PreparedPage { items },
        PageHooks {
            primary_attrs,
            primary_rx,
            hints_rx,
        },
    )
}

/// Streaming pass: emit the inline section in template order, then plug and
/// append the async section.
pub(crate) async fn stream(
    page: PreparedPage,
    context: Context,
    config: Arc<ComposerConfig>,
    out_tx: mpsc::Sender<Bytes>,
    section: AsyncSection,
    drain: SectionDrain,
    token: CancellationToken,
) {
    let result = stream_inner(page, &context, &config, &out_tx, &section, drain, &token).await;
    if result.is_err() {
        // Downstream went away; stop every in-flight fetch.
        token.cancel();
    }
}

async fn stream_inner(
    page: PreparedPage,
    context: &Context,
    config: &ComposerConfig,
    out_tx: &mpsc::Sender<Bytes>,
    section: &AsyncSection,
    drain: SectionDrain,
    token: &CancellationToken,
) -> Result<(), ComposeError> {
    let pipe = config.pipe_instance.as_str();

    for item in page.items {
        match item {
            PageItem::Raw(bytes) => send(out_tx, bytes).await?,
            PageItem::Slot(name) => {
                match context.get(&name).and_then(|value| value.as_str()) {
                    Some(html) => send(out_tx, Bytes::copy_from_slice(html.as_bytes())).await?,
                    None => debug!(slot = %name, "slot missing from context, writing empty"),
                }
            }
            PageItem::Inline(fragment) => {
                let PreparedFragment {
                    index,
                    mut handles,
                    pipe_attrs,
                    ..
                } = fragment;
                send(out_tx, start_marker(pipe, index, None, None)).await?;

                loop {
                    // Watch the output channel too: a disconnected client
                    // must not leave the splice blocked on a stalled
                    // upstream.
                    let chunk = tokio::select! {
                        _ = token.cancelled() => return Err(ComposeError::Cancelled),
                        _ = out_tx.closed() => return Err(ComposeError::Downstream),
                        chunk = handles.body.recv() => chunk,
                    };
                    match chunk {
                        Some(chunk) => send(out_tx, chunk).await?,
                        None => break,
                    }
                }

                let outcome = handles.outcome.await.unwrap_or(FragmentOutcome::Errored {
                    kind: crate::error::FragmentErrorKind::Cancelled,
                });
                match outcome {
                    FragmentOutcome::Ended { scripts, .. }
                    | FragmentOutcome::Fallback { scripts, .. } => {
                        emit_end_hooks(out_tx, pipe, config, index, pipe_attrs.as_deref(), &scripts)
                            .await?;
                    }
                    FragmentOutcome::Errored { .. } => {
                        send(
                            out_tx,
                            Bytes::copy_from_slice(config.fallback_snippet.as_bytes()),
                        )
                        .await?;
                        send(out_tx, end_marker(pipe, index, None, None)).await?;
                    }
                }
            }
            PageItem::Async(fragment) => {
                let PreparedFragment { index, handles, .. } = fragment;
                send(out_tx, placeholder_marker(pipe, index)).await?;
                let attachment = Attachment {
                    index,
                    open: start_marker(pipe, index, None, None),
                    close: end_marker(pipe, index, None, None),
                    fallback: Bytes::copy_from_slice(config.fallback_snippet.as_bytes()),
                    body: handles.body,
                    outcome: handles.outcome,
                };
                if section.attach(attachment).is_err() {
                    warn!(index, "async attachment rejected: section already plugged");
                }
            }
        }
    }

    section.plug();
    drain.drain(out_tx).await
}

/// Closing hooks for an inline fragment, one start/end pair per asset script
/// within the fragment's reserved index range.
async fn emit_end_hooks(
    out_tx: &mpsc::Sender<Bytes>,
    pipe: &str,
    config: &ComposerConfig,
    base_index: usize,
    attrs: Option<&str>,
    scripts: &[String],
) -> Result<(), ComposeError> {
    send(
        out_tx,
        end_marker(pipe, base_index, scripts.first().map(String::as_str), attrs),
    )
    .await?;

    for (offset, script) in scripts
        .iter()
        .enumerate()
        .skip(1)
        .take(config.index_step().saturating_sub(1))
    {
        let index = base_index + offset;
        send(out_tx, start_marker(pipe, index, Some(script), attrs)).await?;
        send(out_tx, end_marker(pipe, index, Some(script), attrs)).await?;
    }
    Ok(())
}

async fn send(out_tx: &mpsc::Sender<Bytes>, bytes: Bytes) -> Result<(), ComposeError> {
    if bytes.is_empty() {
        return Ok(());
    }
    out_tx.send(bytes).await.map_err(|_| ComposeError::Downstream)
}

fn hook(pipe: &str, call: &str, index: usize, script: Option<&str>, attrs: Option<&str>) -> Bytes {
    let args = match (script, attrs) {
        (Some(script), Some(attrs)) => format!("{index}, \"{script}\", {attrs}"),
        (Some(script), None) => format!("{index}, \"{script}\""),
        _ => index.to_string(),
    };
    Bytes::from(format!("<script>{pipe}.{call}({args})</script>"))
}

fn start_marker(pipe: &str, index: usize, script: Option<&str>, attrs: Option<&str>) -> Bytes {
    hook(pipe, "start", index, script, attrs)
}

fn end_marker(pipe: &str, index: usize, script: Option<&str>, attrs: Option<&str>) -> Bytes {
    hook(pipe, "end", index, script, attrs)
}

fn placeholder_marker(pipe: &str, index: usize) -> Bytes {
    hook(pipe, "placeholder", index, None, None)
}

fn pipe_attributes_json(config: &ComposerConfig, attrs: &FragmentAttributes) -> Option<String> {
    let mut map = serde_json::Map::new();
    for name in &config.pipe_attributes {
        match name.as_str() {
            "id" => {
                if let Some(id) = &attrs.id {
                    map.insert("id".to_string(), serde_json::Value::String(id.clone()));
                }
            }
            "src" => {
                map.insert(
                    "src".to_string(),
                    serde_json::Value::String(attrs.src.to_string()),
                );
            }
            "primary" => {
                map.insert("primary".to_string(), serde_json::Value::Bool(attrs.primary));
            }
            "async" => {
                map.insert("async".to_string(), serde_json::Value::Bool(attrs.is_async));
            }
            other => debug!(attribute = %other, "unsupported pipe attribute ignored"),
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_render_expected_markers() {
        assert_eq!(
            &start_marker("Pipe", 0, None, None)[..],
            b"<script>Pipe.start(0)</script>"
        );
        assert_eq!(
            &placeholder_marker("Pipe", 2)[..],
            b"<script>Pipe.placeholder(2)</script>"
        );
        assert_eq!(
            &end_marker("Pipe", 3, Some("http://cdn/f.js"), Some(r#"{"id":"cart"}"#))[..],
            br#"<script>Pipe.end(3, "http://cdn/f.js", {"id":"cart"})</script>"#
        );
    }

    #[test]
    fn pipe_attributes_default_to_id_only() {
        let config = ComposerConfig::default();
        let attrs = FragmentAttributes::from_tag(
            &[
                ("src".to_string(), Some("http://x/1".to_string())),
                ("id".to_string(), Some("basket".to_string())),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();
        assert_eq!(
            pipe_attributes_json(&config, &attrs).as_deref(),
            Some(r#"{"id":"basket"}"#)
        );

        let anonymous = FragmentAttributes::from_tag(
            &[("src".to_string(), Some("http://x/1".to_string()))]
                .into_iter()
                .collect(),
        )
        .unwrap();
        assert_eq!(pipe_attributes_json(&config, &anonymous), None);
    }
}
