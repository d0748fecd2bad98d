//! Configuration types for model clients.

use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1/";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";

/// Which model API to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(alias = "open_ai")]
    OpenAi,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => ANTHROPIC_BASE_URL,
            Self::OpenAi => OPENAI_BASE_URL,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => f.write_str("anthropic"),
            Self::OpenAi => f.write_str("openai"),
        }
    }
}

/// Configuration for a model client.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Model name sent with every request.
    pub model: String,
    pub api_key: Option<String>,
    /// API root, or the provider default when unset. Endpoint paths are
    /// joined onto it, so keep the trailing slash.
    pub base_url: Option<Url>,
    /// Output token limit for orchestrator turns.
    pub max_tokens: u32,
    /// Request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ModelConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: None,
            base_url: None,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }

    pub fn anthropic(model: impl Into<String>) -> Self {
        Self::new(Provider::Anthropic, model)
    }

    pub fn openai(model: impl Into<String>) -> Self {
        Self::new(Provider::OpenAi, model)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn endpoint_root(&self) -> Result<Url, url::ParseError> {
        match &self.base_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(self.provider.default_base_url()),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// HTTP status codes to retry on.
    pub retry_on_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            // 529: Anthropic "overloaded"
            retry_on_status_codes: vec![429, 500, 502, 503, 504, 529],
        }
    }
}

impl RetryPolicy {
    /// A policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (zero based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        std::cmp::min(backoff, self.max_backoff)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status_codes.contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        };

        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn test_should_retry_status() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry_status(429));
        assert!(policy.should_retry_status(529));
        assert!(!policy.should_retry_status(400));
        assert!(!policy.should_retry_status(401));
    }

    #[test]
    fn test_model_config_defaults() {
        let config = ModelConfig::anthropic("claude-sonnet-4-0");
        assert_eq!(config.endpoint_root().unwrap().as_str(), ANTHROPIC_BASE_URL);
        assert_eq!(config.max_tokens, 4096);
        assert!(config.api_key.is_none());

        let config = ModelConfig::openai("gpt-4.1").with_api_key("sk-test");
        assert_eq!(config.provider.to_string(), "openai");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(RetryPolicy::no_retry().max_retries, 0);
    }

    #[test]
    fn test_provider_names() {
        let p: Provider = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(p, Provider::OpenAi);
        let p: Provider = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(p, Provider::Anthropic);
    }
}
