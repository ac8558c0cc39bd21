//! Upstream portrait provider client.
//!
//! The provider is opaque: one JSON POST in, a result payload or an error
//! out. The client bounds every attempt with an explicit timeout and wraps
//! the call in a bounded exponential-backoff retry policy that retries
//! transient failures only; content rejections and malformed requests fail
//! immediately.

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// Default per-attempt timeout. The upstream model can be slow; an hour
/// of queueing is still a bug.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Total attempts (first try plus retries of transient failures).
const MAX_ATTEMPTS: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// The work sent upstream.
#[derive(Debug, Clone, Serialize)]
pub struct PortraitJob {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    pub image_base64: String,
    pub image_type: String,
}

/// Whatever the provider returned for a successful generation; passed
/// through to the client untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct PortraitOutput {
    pub data: Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, or a 5xx. Worth one retry.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider refused the content (e.g. safety rejection). Never
    /// retried; retrying the same content cannot succeed.
    #[error("content rejected by provider: {0}")]
    ContentRejected(String),

    /// We sent something the provider could not understand, or could not
    /// understand its reply. Never retried.
    #[error("malformed provider exchange: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// The seam in front of the upstream model. Object-safe so the service
/// can hold `Arc<dyn PortraitProvider>` and tests can swap in a fake.
pub trait PortraitProvider: Send + Sync {
    fn generate<'a>(
        &'a self,
        job: &'a PortraitJob,
    ) -> BoxFuture<'a, Result<PortraitOutput, ProviderError>>;
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: Option<String>,
}

/// HTTP client for the real provider.
#[derive(Debug, Clone)]
pub struct HttpPortraitProvider {
    client: Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpPortraitProvider {
    pub fn new(url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            api_key,
            timeout,
        }
    }

    async fn attempt(&self, job: &PortraitJob) -> Result<PortraitOutput, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(job)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Transient(format!("provider timed out: {e}"))
                } else {
                    ProviderError::Transient(format!("provider unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<PortraitOutput>()
                .await
                .map_err(|e| ProviderError::Malformed(format!("unparseable response: {e}")));
        }

        let message = response
            .json::<ProviderErrorBody>()
            .await
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| format!("provider returned {status}"));

        if status.is_server_error() {
            Err(ProviderError::Transient(message))
        } else if status == StatusCode::UNPROCESSABLE_ENTITY {
            Err(ProviderError::ContentRejected(message))
        } else {
            Err(ProviderError::Malformed(message))
        }
    }
}

impl PortraitProvider for HttpPortraitProvider {
    fn generate<'a>(
        &'a self,
        job: &'a PortraitJob,
    ) -> BoxFuture<'a, Result<PortraitOutput, ProviderError>> {
        Box::pin(async move {
            let strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
                .map(jitter)
                .take(MAX_ATTEMPTS - 1);

            RetryIf::spawn(
                strategy,
                || async {
                    let result = self.attempt(job).await;
                    if let Err(e) = &result {
                        tracing::warn!(error = %e, "Portrait provider attempt failed");
                    }
                    result
                },
                ProviderError::is_transient,
            )
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PortraitJob {
        PortraitJob {
            prompt: "a renaissance portrait".into(),
            style: Some("oil".into()),
            image_base64: "aW1hZ2U=".into(),
            image_type: "image/png".into(),
        }
    }

    fn provider(url: String) -> HttpPortraitProvider {
        HttpPortraitProvider::new(url, "test-key".into(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn success_passes_payload_through() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(r#"{"data":{"image_url":"https://cdn/x.png"}}"#)
            .create_async()
            .await;

        let output = provider(server.url()).generate(&job()).await.unwrap();
        assert_eq!(output.data["image_url"], "https://cdn/x.png");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let mut server = mockito::Server::new_async().await;
        let failure = server
            .mock("POST", "/")
            .with_status(503)
            .with_body(r#"{"error":"overloaded"}"#)
            .expect(1)
            .create_async()
            .await;
        let success = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"data":{"ok":true}}"#)
            .expect(1)
            .create_async()
            .await;

        let output = provider(server.url()).generate(&job()).await.unwrap();
        assert_eq!(output.data["ok"], true);
        failure.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(500)
            .with_body(r#"{"error":"boom"}"#)
            .expect(2)
            .create_async()
            .await;

        let err = provider(server.url()).generate(&job()).await.unwrap_err();
        assert_eq!(err, ProviderError::Transient("boom".into()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn content_rejection_is_never_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(422)
            .with_body(r#"{"error":"unsafe content"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = provider(server.url()).generate(&job()).await.unwrap_err();
        assert_eq!(err, ProviderError::ContentRejected("unsafe content".into()));
        mock.assert_async().await;
    }
}
