//! End-to-end composition tests against in-process upstreams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use weft_engine::{
    ComposeError, ComposeEvent, ComposeRequest, ComposedResponse, Composer, ComposerConfig,
    Context, ContextFetcher, EventSink, FragmentEventKind, StaticContext, TemplateFetcher,
    TemplateParser, TemplateToken,
};

/// Serve an axum router on an ephemeral local port, returning its base URL.
async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Template fetcher that parses a fixed template string per request.
struct FixedTemplate(String);

#[async_trait]
impl TemplateFetcher for FixedTemplate {
    async fn fetch(&self, _request: &ComposeRequest) -> Result<Vec<TemplateToken>, ComposeError> {
        TemplateParser::new("fragment")?.parse(&self.0)
    }
}

/// Template fetcher that always fails.
struct FailingTemplate(fn() -> ComposeError);

#[async_trait]
impl TemplateFetcher for FailingTemplate {
    async fn fetch(&self, _request: &ComposeRequest) -> Result<Vec<TemplateToken>, ComposeError> {
        Err((self.0)())
    }
}

fn composer_with(
    config: ComposerConfig,
    template: &str,
    context: Context,
) -> (Composer, UnboundedReceiver<ComposeEvent>) {
    let (events, events_rx) = EventSink::channel();
    let composer = Composer::new(
        config,
        Arc::new(FixedTemplate(template.to_string())),
        Arc::new(StaticContext(context)),
        events,
    )
    .unwrap();
    (composer, events_rx)
}

fn composer(template: &str) -> (Composer, UnboundedReceiver<ComposeEvent>) {
    composer_with(ComposerConfig::default(), template, Context::new())
}

async fn body_string(response: ComposedResponse) -> String {
    let mut body = response.body;
    let mut collected = Vec::new();
    while let Some(chunk) = body.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(collected).unwrap()
}

fn drain_events(rx: &mut UnboundedReceiver<ComposeEvent>) -> Vec<ComposeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn fragment_events(events: &[ComposeEvent]) -> Vec<&weft_engine::FragmentEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            ComposeEvent::Fragment(fragment) => Some(fragment),
            _ => None,
        })
        .collect()
}

// S1: a single inline fragment is spliced between its hook markers.
#[tokio::test]
async fn simple_page_streams_fragment_inline() {
    let upstream = spawn_upstream(Router::new().route("/1", get(|| async { "HELLO" }))).await;
    let (composer, mut events_rx) =
        composer(&format!(r#"<a><fragment src="{upstream}/1"/><b>"#));

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.headers.get(header::LINK).is_none());
    assert_eq!(
        response.headers.get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );

    let body = body_string(response).await;
    assert_eq!(
        body,
        "<a><script>Pipe.start(0)</script>HELLO<script>Pipe.end(0)</script><b>"
    );

    let events = drain_events(&mut events_rx);
    let ends: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, ComposeEvent::End { .. }))
        .collect();
    assert_eq!(ends.len(), 1);
    assert!(matches!(ends[0], ComposeEvent::End { bytes } if *bytes == body.len() as u64));
}

// S2: the primary fragment's status, location, and link header promote to
// the page response.
#[tokio::test]
async fn primary_governs_status_and_preload_hints() {
    let first = spawn_upstream(Router::new().route("/a", get(|| async { "A" }))).await;
    let primary = spawn_upstream(Router::new().route("/p", get(|| async {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, "/x".parse().unwrap());
        headers.insert(
            header::LINK,
            "<http://cdn/a.css>; rel=\"stylesheet\"".parse().unwrap(),
        );
        (StatusCode::MOVED_PERMANENTLY, headers, "")
    })))
    .await;

    let (composer, _events_rx) = composer(&format!(
        r#"<fragment src="{first}/a"/><fragment src="{primary}/p" primary/>"#
    ));

    let response = composer
        .handle(ComposeRequest::new("/").with_host("shop"))
        .await;
    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers.get(header::LOCATION).unwrap(), "/x");
    assert_eq!(
        response.headers.get(header::LINK).unwrap(),
        "<http://cdn/a.css>; rel=\"preload\"; as=\"style\"; nopush"
    );
}

// S3: timeout on the fragment URL falls back to the fallback URL.
#[tokio::test]
async fn fragment_timeout_serves_fallback() {
    let slow = spawn_upstream(Router::new().route("/never", get(|| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        "too late"
    })))
    .await;
    let fallback = spawn_upstream(Router::new().route("/", get(|| async { "FB" }))).await;

    let (composer, mut events_rx) = composer(&format!(
        r#"<p><fragment src="{slow}/never" timeout="50" fallback-url="{fallback}/"/></p>"#
    ));

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("<script>Pipe.start(0)</script>FB<script>Pipe.end(0)</script>"));

    let events = drain_events(&mut events_rx);
    let fragments = fragment_events(&events);
    assert!(
        fragments
            .iter()
            .any(|event| matches!(event.kind, FragmentEventKind::Timeout))
    );
    assert!(
        fragments
            .iter()
            .any(|event| matches!(event.kind, FragmentEventKind::Fallback { .. }))
    );
}

// S4: an async fragment's placeholder renders inline, its body lands in the
// trailing section, and the response stays open until it completes.
#[tokio::test]
async fn async_fragment_body_lands_after_inline_section() {
    let fast = spawn_upstream(Router::new().route("/a", get(|| async { "FAST" }))).await;
    let slow = spawn_upstream(Router::new().route("/b", get(|| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        "SLOW"
    })))
    .await;

    let (composer, _events_rx) = composer(&format!(
        r#"<main><fragment src="{fast}/a"/><fragment src="{slow}/b" async/></main>"#
    ));

    let response = composer.handle(ComposeRequest::new("/")).await;
    let body = body_string(response).await;

    let placeholder = body.find("<script>Pipe.placeholder(1)</script>").unwrap();
    let inline_end = body.find("</main>").unwrap();
    let late_start = body.find("<script>Pipe.start(1)</script>").unwrap();
    let late_body = body.find("SLOW").unwrap();

    assert!(placeholder < inline_end, "placeholder must render inline");
    assert!(late_start > inline_end, "late hooks must follow the inline section");
    assert!(late_body > late_start);
    assert!(body.ends_with("SLOW<script>Pipe.end(1)</script>"));
    assert!(body.contains("FAST"));
}

// S4 (streaming half): inline bytes flush while the async fragment is still
// pending.
#[tokio::test]
async fn inline_section_flushes_before_async_fragment_completes() {
    let fast = spawn_upstream(Router::new().route("/a", get(|| async { "FAST" }))).await;
    let slow = spawn_upstream(Router::new().route("/b", get(|| async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        "SLOW"
    })))
    .await;

    let (composer, _events_rx) = composer(&format!(
        r#"<main><fragment src="{fast}/a"/><fragment src="{slow}/b" async/></main>"#
    ));

    let started = std::time::Instant::now();
    let response = composer.handle(ComposeRequest::new("/")).await;

    let mut body = response.body;
    let mut seen = String::new();
    while !seen.contains("</main>") {
        let chunk = body.next().await.expect("inline section must arrive").unwrap();
        seen.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "inline section stalled behind the async fragment"
    );

    while let Some(chunk) = body.next().await {
        seen.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
    }
    assert!(seen.contains("SLOW"));
}

// S5: a missing template is a 404 with a single error event.
#[tokio::test]
async fn template_not_found_is_404() {
    let (events, mut events_rx) = EventSink::channel();
    let composer = Composer::new(
        ComposerConfig::default(),
        Arc::new(FailingTemplate(|| ComposeError::template_not_found("index"))),
        Arc::new(StaticContext::default()),
        events,
    )
    .unwrap();

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers.get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(body_string(response).await, "");

    let events = drain_events(&mut events_rx);
    let errors = events
        .iter()
        .filter(|event| matches!(event, ComposeEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ComposeEvent::End { bytes: 0 }))
    );
}

// S5 variant: a presentable template error becomes the response body.
#[tokio::test]
async fn presentable_template_error_is_served() {
    let (events, _events_rx) = EventSink::channel();
    let composer = Composer::new(
        ComposerConfig::default(),
        Arc::new(FailingTemplate(|| ComposeError::TemplateNotFound {
            name: "index".to_string(),
            presentable: Some("<h1>no such page</h1>".to_string()),
        })),
        Arc::new(StaticContext::default()),
        events,
    )
    .unwrap();

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(body_string(response).await, "<h1>no such page</h1>");
}

// S6: a client disconnect cancels in-flight fragments and still reports the
// bytes written so far.
#[tokio::test]
async fn client_disconnect_reports_bytes_so_far() {
    let drip = spawn_upstream(Router::new().route("/drip", get(|| async {
        let stream = futures::stream::unfold(0u32, |n| async move {
            if n == 0 {
                Some((Ok::<_, std::io::Error>(Bytes::from_static(b"drip")), 1))
            } else {
                tokio::time::sleep(Duration::from_secs(30)).await;
                None
            }
        });
        axum::body::Body::from_stream(stream)
    })))
    .await;

    let (composer, mut events_rx) =
        composer(&format!(r#"<x><fragment src="{drip}/drip"/>"#));

    let response = composer.handle(ComposeRequest::new("/")).await;
    let mut body = response.body;

    // Read the template prefix and the fragment's first bytes, then hang up.
    let mut consumed = 0u64;
    let mut seen = String::new();
    while !seen.contains("drip") {
        let chunk = body.next().await.unwrap().unwrap();
        consumed += chunk.len() as u64;
        seen.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    drop(body);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = drain_events(&mut events_rx);
    let ends: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ComposeEvent::End { bytes } => Some(*bytes),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![consumed]);

    // The cancelled fragment never reaches a terminal event.
    assert!(
        !fragment_events(&events)
            .iter()
            .any(|event| matches!(
                event.kind,
                FragmentEventKind::End { .. } | FragmentEventKind::Error { .. }
            ))
    );
}

// Property 1: inline bytes follow template order regardless of response
// arrival order.
#[tokio::test]
async fn inline_fragments_keep_template_order() {
    let upstream = spawn_upstream(
        Router::new()
            .route("/slow", get(|| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                "ONE"
            }))
            .route("/medium", get(|| async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                "TWO"
            }))
            .route("/fast", get(|| async { "THREE" })),
    )
    .await;

    let (composer, _events_rx) = composer(&format!(
        r#"<fragment src="{upstream}/slow"/><fragment src="{upstream}/medium"/><fragment src="{upstream}/fast"/>"#
    ));

    let body = body_string(composer.handle(ComposeRequest::new("/")).await).await;
    let one = body.find("ONE").unwrap();
    let two = body.find("TWO").unwrap();
    let three = body.find("THREE").unwrap();
    assert!(one < two && two < three);
}

// Property 3: indices advance by max_asset_links.
#[tokio::test]
async fn indices_step_by_max_asset_links() {
    let upstream = spawn_upstream(Router::new().route("/f", get(|| async { "X" }))).await;
    let config = ComposerConfig {
        max_asset_links: 3,
        ..Default::default()
    };
    let (composer, _events_rx) = composer_with(
        config,
        &format!(
            r#"<fragment src="{upstream}/f"/><fragment src="{upstream}/f"/><fragment src="{upstream}/f"/>"#
        ),
        Context::new(),
    );

    let body = body_string(composer.handle(ComposeRequest::new("/")).await).await;
    assert!(body.contains("<script>Pipe.start(0)</script>"));
    assert!(body.contains("<script>Pipe.start(3)</script>"));
    assert!(body.contains("<script>Pipe.start(6)</script>"));
}

// Property 5: every fragment emits exactly one terminal event.
#[tokio::test]
async fn terminal_events_are_unique_per_fragment() {
    let good = spawn_upstream(Router::new().route("/ok", get(|| async { "OK" }))).await;
    let (composer, mut events_rx) = composer(&format!(
        r#"<fragment src="{good}/ok"/><fragment src="http://127.0.0.1:9/dead" timeout="200"/>"#
    ));

    let body = body_string(composer.handle(ComposeRequest::new("/")).await).await;
    assert!(body.contains("OK"));
    assert!(body.contains("<!-- fragment failed -->"));

    let events = drain_events(&mut events_rx);
    for index in [0usize, 1] {
        let terminals = fragment_events(&events)
            .iter()
            .filter(|event| event.index == index)
            .filter(|event| {
                matches!(
                    event.kind,
                    FragmentEventKind::End { .. }
                        | FragmentEventKind::Error { .. }
                        | FragmentEventKind::Fallback { .. }
                )
            })
            .count();
        assert_eq!(terminals, 1, "fragment {index} emitted {terminals} terminal events");
    }
}

// A failed fragment never aborts the page; its slot carries the fallback
// snippet between the usual markers.
#[tokio::test]
async fn failed_fragment_is_replaced_by_snippet() {
    let good = spawn_upstream(Router::new().route("/ok", get(|| async { "OK" }))).await;
    let bad = spawn_upstream(Router::new().route("/err", get(|| async {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom")
    })))
    .await;

    let (composer, _events_rx) = composer(&format!(
        r#"<fragment src="{bad}/err"/><fragment src="{good}/ok"/>"#
    ));

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::OK);
    let body = body_string(response).await;
    assert_eq!(
        body,
        "<script>Pipe.start(0)</script><!-- fragment failed --><script>Pipe.end(0)</script>\
         <script>Pipe.start(1)</script>OK<script>Pipe.end(1)</script>"
    );
}

// First primary in template order wins; later ones degrade with a warning.
#[tokio::test]
async fn later_primary_is_degraded() {
    let first = spawn_upstream(Router::new().route("/p", get(|| async {
        (StatusCode::CREATED, "FIRST")
    })))
    .await;
    let second = spawn_upstream(Router::new().route("/p", get(|| async {
        (StatusCode::ACCEPTED, "SECOND")
    })))
    .await;

    let (composer, mut events_rx) = composer(&format!(
        r#"<fragment src="{first}/p" primary/><fragment src="{second}/p" primary/>"#
    ));

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::CREATED);
    let body = body_string(response).await;
    assert!(body.contains("FIRST") && body.contains("SECOND"));

    let events = drain_events(&mut events_rx);
    assert!(
        fragment_events(&events)
            .iter()
            .any(|event| matches!(&event.kind, FragmentEventKind::Warn { reason }
                if reason.contains("primary")))
    );
}

// A failed primary ends the response with a 500 head and no body.
#[tokio::test]
async fn primary_error_ends_response_with_500() {
    let bad = spawn_upstream(Router::new().route("/p", get(|| async {
        (StatusCode::SERVICE_UNAVAILABLE, "down")
    })))
    .await;

    let (composer, mut events_rx) =
        composer(&format!(r#"<x><fragment src="{bad}/p" primary/>"#));

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "");

    let events = drain_events(&mut events_rx);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ComposeEvent::Error { .. }))
    );
}

// A primary with a fallback URL still pipes the document, but under a 500.
#[tokio::test]
async fn primary_fallback_serves_body_under_500() {
    let fallback = spawn_upstream(Router::new().route("/", get(|| async { "RESCUE" }))).await;
    let (composer, _events_rx) = composer(&format!(
        r#"<x><fragment src="http://127.0.0.1:9/p" primary timeout="200" fallback-url="{fallback}/"/><y>"#
    ));

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains("RESCUE"));
    assert!(body.starts_with("<x>"));
    assert!(body.contains("<y>"));
}

// Slots resolve from the request context; missing slots render empty.
#[tokio::test]
async fn slots_resolve_from_context() {
    let mut context = Context::new();
    context.insert(
        "footer".to_string(),
        serde_json::Value::String("<footer>f</footer>".to_string()),
    );
    let (composer, _events_rx) = composer_with(
        ComposerConfig::default(),
        r#"<a><slot name="footer"/><slot name="missing"/><b>"#,
        context,
    );

    let body = body_string(composer.handle(ComposeRequest::new("/")).await).await;
    assert_eq!(body, "<a><footer>f</footer><b>");
}

// Context failure is non-fatal: the page renders with an empty context.
#[tokio::test]
async fn context_error_is_recovered_to_empty() {
    struct FailingContext;

    #[async_trait]
    impl ContextFetcher for FailingContext {
        async fn fetch(&self, _request: &ComposeRequest) -> Result<Context, ComposeError> {
            Err(ComposeError::context("context service down"))
        }
    }

    let (events, mut events_rx) = EventSink::channel();
    let composer = Composer::new(
        ComposerConfig::default(),
        Arc::new(FixedTemplate(r#"<a><slot name="x"/><b>"#.to_string())),
        Arc::new(FailingContext),
        events,
    )
    .unwrap();

    let response = composer.handle(ComposeRequest::new("/")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body_string(response).await, "<a><b>");

    let events = drain_events(&mut events_rx);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ComposeEvent::ContextError { .. }))
    );
}

// Non-public fragments only receive the allow-listed request headers.
#[tokio::test]
async fn header_scrubbing_follows_public_attribute() {
    async fn echo_session(headers: HeaderMap) -> String {
        headers
            .get("x-shop-session")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("none")
            .to_string()
    }

    let upstream = spawn_upstream(Router::new().route("/echo", get(echo_session))).await;
    let (composer, _events_rx) = composer(&format!(
        r#"<fragment src="{upstream}/echo" public/>|<fragment src="{upstream}/echo"/>"#
    ));

    let mut headers = HeaderMap::new();
    headers.insert("x-shop-session", "secret".parse().unwrap());
    let response = composer
        .handle(ComposeRequest::new("/").with_headers(headers))
        .await;
    let body = body_string(response).await;

    let (public_half, private_half) = body.split_once('|').unwrap();
    assert!(public_half.contains("secret"));
    assert!(private_half.contains("none"));
}

// return-headers opts a non-primary fragment's link header into the preload
// hints, provided it responds before the primary claims the head.
#[tokio::test]
async fn return_headers_fragment_contributes_preload_hints() {
    let assets = spawn_upstream(Router::new().route("/tile", get(|| async {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LINK,
            "<http://cdn/tile.js>; rel=\"fragment-script\"".parse().unwrap(),
        );
        (headers, "TILE")
    })))
    .await;
    let primary = spawn_upstream(Router::new().route("/p", get(|| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        "MAIN"
    })))
    .await;

    let (composer, _events_rx) = composer(&format!(
        r#"<fragment src="{assets}/tile" return-headers/><fragment src="{primary}/p" primary/>"#
    ));

    let response = composer
        .handle(ComposeRequest::new("/").with_host("shop"))
        .await;
    assert_eq!(
        response.headers.get(header::LINK).unwrap(),
        "<http://cdn/tile.js>; rel=\"preload\"; as=\"script\"; nopush; crossorigin"
    );

    let body = body_string(response).await;
    assert!(body.contains(r#"<script>Pipe.end(0, "http://cdn/tile.js")</script>"#));
    assert!(body.contains("MAIN"));
}
