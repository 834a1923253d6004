//! Layered configuration
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. `CONTEXT_RELAY__<SECTION>__<KEY>` environment variables (a `.env` file
//!    is loaded first when present)
//!
//! Credentials are not configuration; they come from a `CredentialStore`.

use crate::api::auth::AuthScheme;
use crate::api::cache::CacheConfig;
use crate::api::retry::RetryConfig;
use crate::context::headroom::HeadroomConfig;
use crate::context::token_estimator::ModelLimits;
use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "CONTEXT_RELAY";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Provider endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Credential store key for this provider
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub auth_scheme: AuthScheme,

    /// Events buffered between the stream reader and its consumer
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_stream_buffer() -> usize {
    64
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            provider: default_provider(),
            api_version: default_api_version(),
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_ms: default_timeout_ms(),
            auth_scheme: AuthScheme::default(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl ApiConfig {
    /// Get timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Messages endpoint URL
    pub fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

/// Context budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub headroom: HeadroomConfig,

    #[serde(default = "default_message_priority")]
    pub message_priority: i32,

    #[serde(default = "default_document_priority")]
    pub document_priority: i32,

    #[serde(default = "default_summary_priority")]
    pub summary_priority: i32,

    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

fn default_message_priority() -> i32 {
    5
}

fn default_document_priority() -> i32 {
    3
}

fn default_summary_priority() -> i32 {
    8
}

fn default_chars_per_token() -> f64 {
    4.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            headroom: HeadroomConfig::default(),
            message_priority: default_message_priority(),
            document_priority: default_document_priority(),
            summary_priority: default_summary_priority(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load defaults, an optional TOML file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(ContextError::Configuration("api.base_url is empty".into()));
        }
        if self.api.max_tokens == 0 {
            return Err(ContextError::Configuration("api.max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.api.temperature) {
            return Err(ContextError::Configuration(format!(
                "api.temperature {} outside [0, 1]",
                self.api.temperature
            )));
        }
        if self.retry.jitter_min <= 0.0 || self.retry.jitter_max < self.retry.jitter_min {
            return Err(ContextError::Configuration(format!(
                "retry jitter range [{}, {}] is invalid",
                self.retry.jitter_min, self.retry.jitter_max
            )));
        }
        if self.budget.chars_per_token <= 0.0 {
            return Err(ContextError::Configuration(
                "budget.chars_per_token must be positive".into(),
            ));
        }
        let capacity = ModelLimits::default().limit_for(&self.api.default_model);
        self.budget.headroom.validate(capacity)?;
        Ok(())
    }
}
