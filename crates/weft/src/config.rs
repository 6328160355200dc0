use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ComposeError;
use crate::fragment::retry::RetryPolicy;

/// Default upstream timeout applied to fragments without a `timeout` attribute.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Snippet substituted for an inline fragment that failed with no fallback.
pub const DEFAULT_FALLBACK_SNIPPET: &str = "<!-- fragment failed -->";

/// Configurable options for the composition engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Index step between successive fragments. Each fragment reserves this
    /// many identifier slots for its asset links.
    pub max_asset_links: usize,

    /// Timeout from fragment dispatch to response head, unless the template
    /// tag overrides it.
    pub default_fragment_timeout: Duration,

    /// Tag name recognised as a fragment placeholder.
    pub fragment_tag: String,

    /// Name of the client-side runtime object referenced by emitted markers.
    pub pipe_instance: String,

    /// Template tag attributes copied into the client-side start/end hooks.
    pub pipe_attributes: Vec<String>,

    /// HTML substituted for a failed inline fragment with no fallback URL.
    pub fallback_snippet: String,

    /// Retry behaviour for transient transport errors.
    pub retry: RetryPolicy,

    /// Connection timeout for the shared upstream client.
    pub connect_timeout: Duration,

    /// Maximum idle upstream connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            max_asset_links: 1,
            default_fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            fragment_tag: "fragment".to_string(),
            pipe_instance: "Pipe".to_string(),
            pipe_attributes: vec!["id".to_string()],
            fallback_snippet: DEFAULT_FALLBACK_SNIPPET.to_string(),
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 10,
        }
    }
}

impl ComposerConfig {
    /// Build the shared upstream client from this configuration.
    ///
    /// Redirects are not followed: a fragment's 3xx response is meaningful to
    /// the composition (a primary redirect promotes to the page response).
    pub fn build_client(&self) -> Result<reqwest::Client, ComposeError> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ComposeError::internal(format!("failed to build client: {e}")))
    }

    /// Index step, clamped to at least one.
    pub fn index_step(&self) -> usize {
        self.max_asset_links.max(1)
    }
}
