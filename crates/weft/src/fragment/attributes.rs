use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::error::ComposeError;

/// Immutable record parsed from a fragment placeholder tag.
#[derive(Debug, Clone)]
pub struct FragmentAttributes {
    /// Upstream endpoint. Required and absolute.
    pub src: Url,
    /// Stable identifier for logging and client-side correlation.
    pub id: Option<String>,
    /// Whether this fragment's status and headers promote to the page
    /// response. At most one per template survives materialisation.
    pub primary: bool,
    /// Whether the body is deferred to the trailing async section.
    pub is_async: bool,
    /// Whether the full incoming header set is forwarded upstream.
    pub public: bool,
    /// Tried once when the primary URL fails.
    pub fallback_url: Option<Url>,
    /// Dispatch-to-first-byte budget; engine default applies when absent.
    pub timeout: Option<Duration>,
    /// Opts this fragment's `link` response header into preload-hint
    /// accumulation on the page response.
    pub return_headers: bool,
}

/// Attribute values as scanned from a tag: `None` for bare flags.
pub type TagAttributes = HashMap<String, Option<String>>;

fn flag(attrs: &TagAttributes, name: &str) -> bool {
    match attrs.get(name) {
        // Bare attribute or anything but an explicit "false" counts as set.
        Some(None) => true,
        Some(Some(value)) => !value.eq_ignore_ascii_case("false"),
        None => false,
    }
}

fn absolute_url(raw: &str, attribute: &str) -> Result<Url, ComposeError> {
    let url = Url::parse(raw)
        .map_err(|e| ComposeError::template_parse(format!("invalid {attribute} `{raw}`: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ComposeError::template_parse(format!(
            "unsupported scheme `{scheme}` in {attribute} `{raw}`"
        ))),
    }
}

impl FragmentAttributes {
    /// Build the record from a scanned tag attribute map.
    ///
    /// `src` is required and must be an absolute http(s) URL. A `timeout`
    /// that does not parse as milliseconds is ignored and the engine default
    /// applies.
    pub fn from_tag(attrs: &TagAttributes) -> Result<Self, ComposeError> {
        let src = attrs
            .get("src")
            .and_then(|v| v.as_deref())
            .ok_or_else(|| ComposeError::template_parse("fragment tag without src"))?;

        let fallback_url = match attrs.get("fallback-url").and_then(|v| v.as_deref()) {
            Some(raw) => Some(absolute_url(raw, "fallback-url")?),
            None => None,
        };

        let timeout = attrs
            .get("timeout")
            .and_then(|v| v.as_deref())
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis);

        Ok(Self {
            src: absolute_url(src, "src")?,
            id: attrs.get("id").and_then(|v| v.clone()),
            primary: flag(attrs, "primary"),
            is_async: flag(attrs, "async"),
            public: flag(attrs, "public"),
            fallback_url,
            timeout,
            return_headers: flag(attrs, "return-headers"),
        })
    }
}
