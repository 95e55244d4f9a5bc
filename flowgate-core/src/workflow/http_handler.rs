//! HTTP resource handler: POSTs the state input as JSON to the resource URL

use crate::workflow::error::ResourceError;
use crate::workflow::resource::ResourceHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Error name for a non-success HTTP status
pub const ERROR_HTTP_STATUS: &str = "Http.StatusError";

/// Calls `http://` and `https://` resources
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    /// Create new HTTP handler with a 30 second request timeout
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for HttpHandler {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, ResourceError> {
        let url = Url::parse(resource)
            .map_err(|e| ResourceError::runtime(format!("invalid resource URL '{}': {}", resource, e)))?;

        let response = self
            .client
            .post(url)
            .json(&input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ResourceError::timeout(format!("request to {} timed out", resource))
                } else {
                    ResourceError::task_failed(format!("request to {} failed: {}", resource, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResourceError::new(
                ERROR_HTTP_STATUS,
                format!("{} returned {}: {}", resource, status, body),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ResourceError::task_failed(format!("failed to read response: {}", e)))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::error::ERROR_RUNTIME;

    #[tokio::test]
    async fn test_invalid_url_is_runtime_error() {
        let handler = HttpHandler::new();
        let error = handler
            .invoke("http://exa mple.com/x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(error.error, ERROR_RUNTIME);
    }
}
