use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use switchyard_agent::{ModelConfig, Provider, RetryPolicy};
use switchyard_mcp::{ServerParams, SessionConfig};
use url::Url;

/// Contents of `switchyard.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub model: ModelSection,

    #[serde(default)]
    pub session: SessionSection,

    /// `file://` URIs exposed to servers as roots
    #[serde(default)]
    pub roots: Vec<String>,

    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_provider")]
    pub provider: Provider,

    /// Falls back to a per-provider default
    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub base_url: Option<Url>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySection,
}

fn default_provider() -> Provider {
    Provider::Anthropic
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_model_timeout_secs() -> u64 {
    120
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key_env: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_model_timeout_secs(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

/// One `[servers.<name>]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub url: Option<Url>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            enabled: true,
        }
    }

    /// Check the table and turn it into connection parameters.
    pub fn params(&self, name: &str) -> Result<ServerParams> {
        match self.transport {
            TransportKind::Stdio => {
                let Some(command) = self.command.as_deref().filter(|c| !c.trim().is_empty()) else {
                    bail!("Server '{}': stdio transport requires a command", name);
                };
                if self.url.is_some() {
                    bail!("Server '{}': url is only valid for the http transport", name);
                }
                Ok(ServerParams::Stdio {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                })
            }
            TransportKind::Http => {
                let Some(url) = &self.url else {
                    bail!("Server '{}': http transport requires a url", name);
                };
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("Server '{}': unsupported url scheme '{}'", name, url.scheme());
                }
                if self.command.is_some() {
                    bail!("Server '{}': command is only valid for the stdio transport", name);
                }
                Ok(ServerParams::Http {
                    url: url.clone(),
                    headers: self.headers.clone(),
                })
            }
        }
    }
}

impl HostConfig {
    /// Load the file if it exists, otherwise use defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!(path = %path.display(), "Configuration file not found, using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, server) in &self.servers {
            if name.trim().is_empty() {
                bail!("Server names must not be empty");
            }
            server.params(name)?;
        }
        if self.model.max_tokens == 0 {
            bail!("model.max_tokens must be positive");
        }
        Ok(())
    }

    /// Add a server from `name=command args...`. Replaces a file entry of the
    /// same name.
    pub fn add_server_spec(&mut self, spec: &str) -> Result<()> {
        let Some((name, command_line)) = spec.split_once('=') else {
            bail!("Invalid server spec '{}', expected name=command args...", spec);
        };
        let mut words = command_line.split_whitespace().map(str::to_string);
        let Some(command) = words.next() else {
            bail!("Server spec '{}' has no command", spec);
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("Server spec '{}' has no name", spec);
        }
        self.servers
            .insert(name.to_string(), ServerConfig::stdio(command, words.collect()));
        Ok(())
    }

    /// Enabled servers in name order.
    pub fn server_params(&self) -> Result<Vec<(String, ServerParams)>> {
        self.servers
            .iter()
            .filter(|(_, server)| server.enabled)
            .map(|(name, server)| Ok((name.clone(), server.params(name)?)))
            .collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: Duration::from_secs(self.session.request_timeout_secs),
            ..Default::default()
        }
    }

    /// `lookup` resolves environment variables.
    pub fn model_config(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<ModelConfig> {
        let section = &self.model;
        let model = section
            .model
            .clone()
            .unwrap_or_else(|| default_model(section.provider).to_string());

        let key_var = section
            .api_key_env
            .clone()
            .unwrap_or_else(|| default_api_key_env(section.provider).to_string());
        let api_key = lookup(&key_var)
            .filter(|k| !k.trim().is_empty())
            .with_context(|| format!("Environment variable {} is not set", key_var))?;

        let mut config = ModelConfig::new(section.provider, model).with_api_key(api_key);
        if let Some(url) = &section.base_url {
            config = config.with_base_url(url.clone());
        }
        config.max_tokens = section.max_tokens;
        config.timeout = Duration::from_secs(section.timeout_secs);
        config.retry = RetryPolicy {
            max_retries: section.retry.max_retries,
            initial_backoff: Duration::from_millis(section.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(section.retry.max_backoff_ms),
            ..Default::default()
        };
        Ok(config)
    }
}

fn default_model(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "claude-sonnet-4-20250514",
        Provider::OpenAi => "gpt-4.1",
    }
}

fn default_api_key_env(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "ANTHROPIC_API_KEY",
        Provider::OpenAi => "OPENAI_API_KEY",
    }
}
