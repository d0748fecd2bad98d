//! JSON-over-HTTP plumbing shared by the model clients.

use crate::config::ModelConfig;
use crate::error::{AgentError, AgentResult};
use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP client for one model API.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    config: Arc<ModelConfig>,
    root: url::Url,
}

impl HttpClient {
    /// `headers` carries the provider's authentication headers.
    pub fn new(config: Arc<ModelConfig>, headers: header::HeaderMap) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        let root = config.endpoint_root()?;

        Ok(Self {
            client,
            config,
            root,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Header value from a secret, without echoing it in the error.
    pub fn header_value(value: &str) -> AgentResult<header::HeaderValue> {
        let mut value = header::HeaderValue::from_str(value)
            .map_err(|_| AgentError::Config("Invalid API key format".to_string()))?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Execute a request with retries.
    async fn execute_with_retry(&self, request_builder: RequestBuilder) -> AgentResult<Response> {
        let retry = &self.config.retry;
        let mut attempts = 0;

        loop {
            let request = request_builder
                .try_clone()
                .ok_or_else(|| AgentError::Config("Request cannot be cloned".to_string()))?;

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();

                    if response.status().is_success() {
                        return Ok(response);
                    }

                    if attempts < retry.max_retries && retry.should_retry_status(status) {
                        let backoff = retry_after(&response)
                            .unwrap_or_else(|| retry.backoff_for_attempt(attempts));
                        warn!(
                            status = status,
                            attempt = attempts + 1,
                            backoff_ms = backoff.as_millis(),
                            "Model request failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        continue;
                    }

                    let retry_after_secs = retry_after(&response).map(|d| d.as_secs());
                    let body = response.text().await.unwrap_or_default();
                    return Err(AgentError::from_response(status, &body, retry_after_secs));
                }
                Err(e) => {
                    if attempts < retry.max_retries && (e.is_timeout() || e.is_connect()) {
                        let backoff = retry.backoff_for_attempt(attempts);
                        warn!(
                            attempt = attempts + 1,
                            backoff_ms = backoff.as_millis(),
                            error = %e,
                            "Model request did not complete, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// POST a JSON body to `path` under the API root.
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> AgentResult<T> {
        let url = self.root.join(path)?;
        debug!(url = %url, model = %self.config.model, "POST request");

        let response = self
            .execute_with_retry(self.client.post(url).json(body))
            .await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            AgentError::InvalidResponse(format!("{} in body: {}", e, truncate(&text, 200)))
        })
    }
}

fn retry_after(response: &Response) -> Option<std::time::Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Provider, RetryPolicy};
    use serde::Deserialize;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pong {
        ok: bool,
    }

    fn client(server: &MockServer, retry: RetryPolicy) -> HttpClient {
        let mut config = ModelConfig::new(Provider::Anthropic, "test-model")
            .with_base_url(url::Url::parse(&format!("{}/v1/", server.uri())).unwrap());
        config.retry = retry;
        HttpClient::new(Arc::new(config), header::HeaderMap::new()).unwrap()
    }

    fn quick_retries() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_post_joins_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let pong: Pong = client(&server, RetryPolicy::no_retry())
            .post("messages", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(pong, Pong { ok: true });
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let pong: Pong = client(&server, quick_retries())
            .post("messages", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(pong.ok);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "invalid x-api-key"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, quick_retries())
            .post::<Pong, _>("messages", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Api { status: 401, ref message } if message == "invalid x-api-key"));
    }

    #[tokio::test]
    async fn test_garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server, RetryPolicy::no_retry())
            .post::<Pong, _>("messages", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
    }
}
