//! Filesystem template store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::debug;
use weft_engine::{ComposeError, ComposeRequest, TemplateFetcher, TemplateParser, TemplateToken};

use crate::config::ServerConfig;
use crate::error::Result;

/// Serves parsed templates from `<template_dir>/<name>.html`, keeping parsed
/// token streams in a TTL cache.
pub struct FsTemplateFetcher {
    root: PathBuf,
    parser: TemplateParser,
    cache: Cache<String, Arc<Vec<TemplateToken>>>,
}

impl FsTemplateFetcher {
    pub fn new(config: &ServerConfig, fragment_tag: &str) -> Result<Self> {
        Ok(Self {
            root: config.template_dir.clone(),
            parser: TemplateParser::new(fragment_tag)?,
            cache: Cache::builder()
                .max_capacity(1024)
                .time_to_live(config.template_cache_ttl)
                .build(),
        })
    }

    async fn load(&self, name: &str) -> std::result::Result<Vec<TemplateToken>, ComposeError> {
        if let Some(tokens) = self.cache.get(name).await {
            debug!(template = %name, "template cache hit");
            return Ok((*tokens).clone());
        }

        let file = self.root.join(format!("{name}.html"));
        let raw = tokio::fs::read_to_string(&file).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ComposeError::template_not_found(name)
            } else {
                ComposeError::template_fetch(format!("{}: {e}", file.display()))
            }
        })?;

        let tokens = self.parser.parse(&raw)?;
        self.cache
            .insert(name.to_string(), Arc::new(tokens.clone()))
            .await;
        Ok(tokens)
    }
}

/// Map a request path to a template name. `/` resolves to `index`; path
/// segments may not start with a dot, so the store never leaves its root.
fn template_name(path: &str) -> std::result::Result<String, ComposeError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok("index".to_string());
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment.starts_with('.') {
            return Err(ComposeError::template_not_found(path));
        }
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

#[async_trait]
impl TemplateFetcher for FsTemplateFetcher {
    async fn fetch(
        &self,
        request: &ComposeRequest,
    ) -> std::result::Result<Vec<TemplateToken>, ComposeError> {
        let name = template_name(&request.path)?;
        self.load(&name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_to_index() {
        assert_eq!(template_name("/").unwrap(), "index");
        assert_eq!(template_name("").unwrap(), "index");
    }

    #[test]
    fn nested_paths_are_joined() {
        assert_eq!(template_name("/shop/product").unwrap(), "shop/product");
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(template_name("/../etc/passwd").is_err());
        assert!(template_name("/shop/../../x").is_err());
        assert!(template_name("/.hidden").is_err());
    }

    #[tokio::test]
    async fn missing_template_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            template_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fetcher = FsTemplateFetcher::new(&config, "fragment").unwrap();
        let err = fetcher
            .fetch(&ComposeRequest::new("/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn template_parses_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            r#"<p><fragment src="http://x/1"/></p>"#,
        )
        .unwrap();
        let config = ServerConfig {
            template_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fetcher = FsTemplateFetcher::new(&config, "fragment").unwrap();

        let tokens = fetcher.fetch(&ComposeRequest::new("/")).await.unwrap();
        assert_eq!(tokens.len(), 3);

        // Deleting the file does not evict the cached tokens.
        std::fs::remove_file(dir.path().join("index.html")).unwrap();
        let cached = fetcher.fetch(&ComposeRequest::new("/")).await.unwrap();
        assert_eq!(cached.len(), 3);
    }
}
