//! Upstream `Link` header handling: parsing, preload-hint composition, and
//! script extraction for the client-side hooks.

use reqwest::header::{HeaderMap, LINK};
use url::Url;

/// One entry of a `Link` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub uri: String,
    pub rel: Option<String>,
}

impl LinkEntry {
    /// Whether the entry's `rel` contains the given link relation token.
    pub fn has_rel(&self, token: &str) -> bool {
        self.rel
            .as_deref()
            .is_some_and(|rel| rel.split_ascii_whitespace().any(|t| t.eq_ignore_ascii_case(token)))
    }
}

/// Parse a `Link` header value into its entries. Malformed entries are
/// skipped; an upstream's bad header must not fail the fragment.
pub fn parse_link_header(value: &str) -> Vec<LinkEntry> {
    value
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let rest = part.strip_prefix('<')?;
            let (uri, params) = rest.split_once('>')?;
            if uri.is_empty() {
                return None;
            }

            let rel = params.split(';').find_map(|param| {
                let (name, value) = param.trim().split_once('=')?;
                if !name.trim().eq_ignore_ascii_case("rel") {
                    return None;
                }
                Some(value.trim().trim_matches('"').to_string())
            });

            Some(LinkEntry {
                uri: uri.to_string(),
                rel,
            })
        })
        .collect()
}

/// All `Link` entries across every `link` header value in `headers`.
pub fn link_entries(headers: &HeaderMap) -> Vec<LinkEntry> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(parse_link_header)
        .collect()
}

/// URIs of `rel="fragment-script"` entries, in header order. These feed the
/// client-side `start`/`end` hooks.
pub fn script_uris(headers: &HeaderMap) -> Vec<String> {
    link_entries(headers)
        .into_iter()
        .filter(|entry| entry.has_rel("fragment-script"))
        .map(|entry| entry.uri)
        .collect()
}

/// Compose preload hints for the page response from a fragment's `Link`
/// entries.
///
/// Stylesheets preload as styles; fragment scripts preload as scripts and
/// carry `crossorigin` when served from a host other than the page's.
pub fn preload_hints(headers: &HeaderMap, request_host: Option<&str>) -> Vec<String> {
    link_entries(headers)
        .iter()
        .filter_map(|entry| {
            if entry.has_rel("stylesheet") {
                Some(format!(
                    "<{}>; rel=\"preload\"; as=\"style\"; nopush",
                    entry.uri
                ))
            } else if entry.has_rel("fragment-script") {
                let cross_origin = match (request_host, script_host(&entry.uri)) {
                    (Some(page), Some(script)) => !script.eq_ignore_ascii_case(page),
                    // Unknown host on either side: assume same-origin.
                    _ => false,
                };
                let suffix = if cross_origin { "; crossorigin" } else { "" };
                Some(format!(
                    "<{}>; rel=\"preload\"; as=\"script\"; nopush{suffix}",
                    entry.uri
                ))
            } else {
                None
            }
        })
        .collect()
}

fn script_host(uri: &str) -> Option<String> {
    Url::parse(uri).ok()?.host_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(link: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(LINK, HeaderValue::from_str(link).unwrap());
        map
    }

    #[test]
    fn parses_multiple_entries() {
        let entries = parse_link_header(
            "<http://cdn/a.css>; rel=\"stylesheet\", <http://cdn/b.js>; rel=\"fragment-script\"",
        );
        assert_eq!(entries.len(), 2);
        assert!(entries[0].has_rel("stylesheet"));
        assert!(entries[1].has_rel("fragment-script"));
    }

    #[test]
    fn skips_malformed_entries() {
        let entries = parse_link_header("garbage, <http://cdn/a.css>; rel=stylesheet");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uri, "http://cdn/a.css");
        assert!(entries[0].has_rel("stylesheet"));
    }

    #[test]
    fn stylesheet_becomes_style_preload() {
        let hints = preload_hints(&headers("<http://cdn/a.css>; rel=\"stylesheet\""), Some("shop"));
        assert_eq!(
            hints,
            vec!["<http://cdn/a.css>; rel=\"preload\"; as=\"style\"; nopush"]
        );
    }

    #[test]
    fn same_host_script_has_no_crossorigin() {
        let hints = preload_hints(
            &headers("<http://shop/f.js>; rel=\"fragment-script\""),
            Some("shop"),
        );
        assert_eq!(
            hints,
            vec!["<http://shop/f.js>; rel=\"preload\"; as=\"script\"; nopush"]
        );
    }

    #[test]
    fn cross_host_script_gets_crossorigin() {
        let hints = preload_hints(
            &headers("<http://cdn/f.js>; rel=\"fragment-script\""),
            Some("shop"),
        );
        assert_eq!(
            hints,
            vec!["<http://cdn/f.js>; rel=\"preload\"; as=\"script\"; nopush; crossorigin"]
        );
    }

    #[test]
    fn script_uris_preserve_order() {
        let uris = script_uris(&headers(
            "<http://cdn/one.js>; rel=\"fragment-script\", <http://cdn/a.css>; rel=\"stylesheet\", <http://cdn/two.js>; rel=\"fragment-script\"",
        ));
        assert_eq!(uris, vec!["http://cdn/one.js", "http://cdn/two.js"]);
    }

    #[test]
    fn other_relations_are_ignored() {
        let hints = preload_hints(&headers("<http://x/n>; rel=\"next\""), Some("shop"));
        assert!(hints.is_empty());
    }
}
