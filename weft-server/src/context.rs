//! Per-request slot context resolution.

use async_trait::async_trait;
use url::Url;
use weft_engine::{ComposeError, ComposeRequest, Context, ContextFetcher};

use crate::error::Result;

/// Fetches the slot context as a JSON object from a configured endpoint,
/// passing the page path as a query parameter. Failures surface as context
/// errors, which the composer recovers to an empty context.
pub struct HttpContextFetcher {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpContextFetcher {
    pub fn new(endpoint: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| crate::error::Error::config(format!("context client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ContextFetcher for HttpContextFetcher {
    async fn fetch(
        &self,
        request: &ComposeRequest,
    ) -> std::result::Result<Context, ComposeError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("path", &request.path);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ComposeError::context(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ComposeError::context(format!(
                "context endpoint returned {}",
                response.status()
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ComposeError::context(e.to_string()))?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(ComposeError::context(format!(
                "context endpoint returned a non-object: {other}"
            ))),
        }
    }
}
