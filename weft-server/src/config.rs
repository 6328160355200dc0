//! Server configuration, loaded from environment variables with defaults.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use weft_engine::ComposerConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Directory holding page templates (`<name>.html`)
    pub template_dir: PathBuf,
    /// Optional endpoint resolving per-request slot context
    pub context_url: Option<Url>,
    /// How long parsed templates stay cached
    pub template_cache_ttl: Duration,
    /// Identifier slots reserved per fragment for its asset links
    pub max_asset_links: usize,
    /// Default fragment dispatch-to-first-byte timeout
    pub fragment_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            template_dir: PathBuf::from("templates"),
            context_url: None,
            template_cache_ttl: Duration::from_secs(60),
            max_asset_links: 1,
            fragment_timeout: weft_engine::config::DEFAULT_FRAGMENT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Load server config from environment variables, falling back to
    /// defaults.
    ///
    /// Supported env vars:
    /// - `WEFT_BIND_ADDRESS` (e.g. "0.0.0.0")
    /// - `WEFT_PORT` (e.g. "8080")
    /// - `WEFT_TEMPLATE_DIR`
    /// - `WEFT_CONTEXT_URL`
    /// - `WEFT_TEMPLATE_CACHE_TTL_SECS`
    /// - `WEFT_MAX_ASSET_LINKS`
    /// - `WEFT_FRAGMENT_TIMEOUT_MS`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(bind_address) = std::env::var("WEFT_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address;
        }

        if let Ok(port) = std::env::var("WEFT_PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            config.port = parsed;
        }

        if let Ok(dir) = std::env::var("WEFT_TEMPLATE_DIR")
            && !dir.trim().is_empty()
        {
            config.template_dir = PathBuf::from(dir);
        }

        if let Ok(raw) = std::env::var("WEFT_CONTEXT_URL")
            && let Ok(url) = Url::parse(&raw)
        {
            config.context_url = Some(url);
        }

        if let Ok(ttl) = std::env::var("WEFT_TEMPLATE_CACHE_TTL_SECS")
            && let Ok(parsed) = ttl.parse::<u64>()
        {
            config.template_cache_ttl = Duration::from_secs(parsed);
        }

        if let Ok(links) = std::env::var("WEFT_MAX_ASSET_LINKS")
            && let Ok(parsed) = links.parse::<usize>()
        {
            config.max_asset_links = parsed.max(1);
        }

        if let Ok(timeout) = std::env::var("WEFT_FRAGMENT_TIMEOUT_MS")
            && let Ok(parsed) = timeout.parse::<u64>()
        {
            config.fragment_timeout = Duration::from_millis(parsed);
        }

        config
    }

    /// Project the server settings onto the engine configuration.
    pub fn composer_config(&self) -> ComposerConfig {
        ComposerConfig {
            max_asset_links: self.max_asset_links,
            default_fragment_timeout: self.fragment_timeout,
            ..Default::default()
        }
    }
}
