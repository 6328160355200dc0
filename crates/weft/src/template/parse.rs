//! Default template parser.
//!
//! A pure transformation from raw template text to [`TemplateToken`]s. Only
//! two tags are recognised: the configured fragment placeholder tag and
//! `<slot name="…">`; everything else passes through as literal bytes.

use bytes::Bytes;
use regex::Regex;

use crate::error::ComposeError;
use crate::fragment::{FragmentAttributes, TagAttributes};
use crate::template::TemplateToken;

/// Recognises fragment and slot tags in raw template text.
pub struct TemplateParser {
    tags: Regex,
    attrs: Regex,
}

impl TemplateParser {
    pub fn new(fragment_tag: &str) -> Result<Self, ComposeError> {
        let tag = regex::escape(fragment_tag);
        let tags = Regex::new(&format!(
            r"<{tag}\b(?P<fragment>[^>]*?)/?>|</{tag}\s*>|<slot\b(?P<slot>[^>]*?)/?>|</slot\s*>"
        ))
        .map_err(|e| ComposeError::template_parse(format!("bad fragment tag pattern: {e}")))?;

        // name, then ="quoted" or =bare, both optional (bare flags).
        let attrs = Regex::new(r#"([a-zA-Z][a-zA-Z0-9_-]*)(?:\s*=\s*(?:"([^"]*)"|([^\s"'>/]+)))?"#)
            .map_err(|e| ComposeError::template_parse(format!("bad attribute pattern: {e}")))?;

        Ok(Self { tags, attrs })
    }

    /// Tokenise a template. Closing fragment/slot tags are swallowed; raw
    /// text between tags is preserved byte for byte.
    pub fn parse(&self, raw: &str) -> Result<Vec<TemplateToken>, ComposeError> {
        let mut tokens = Vec::new();
        let mut cursor = 0;

        for found in self.tags.captures_iter(raw) {
            let matched = found.get(0).expect("regex match has a whole-match group");
            if matched.start() > cursor {
                tokens.push(TemplateToken::Raw(Bytes::copy_from_slice(
                    raw[cursor..matched.start()].as_bytes(),
                )));
            }
            cursor = matched.end();

            if let Some(attr_text) = found.name("fragment") {
                let attrs = self.scan_attributes(attr_text.as_str());
                tokens.push(TemplateToken::Fragment(FragmentAttributes::from_tag(
                    &attrs,
                )?));
            } else if let Some(attr_text) = found.name("slot") {
                let attrs = self.scan_attributes(attr_text.as_str());
                let name = attrs
                    .get("name")
                    .and_then(|v| v.clone())
                    .ok_or_else(|| ComposeError::template_parse("slot tag without name"))?;
                tokens.push(TemplateToken::Slot(name));
            }
            // Closing tags match without a named group and are dropped.
        }

        if cursor < raw.len() {
            tokens.push(TemplateToken::Raw(Bytes::copy_from_slice(
                raw[cursor..].as_bytes(),
            )));
        }

        Ok(tokens)
    }

    fn scan_attributes(&self, text: &str) -> TagAttributes {
        self.attrs
            .captures_iter(text)
            .map(|found| {
                let name = found[1].to_ascii_lowercase();
                let value = found
                    .get(2)
                    .or_else(|| found.get(3))
                    .map(|m| m.as_str().to_string());
                (name, value)
            })
            .collect()
    }
}
