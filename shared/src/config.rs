use rand::Rng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::capabilities::ValidatedUrl;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable {var} is not set")]
    MissingSecret { var: String },
}

/// Reconnect/backoff policy for remote listeners. Delay for attempt `n`
/// (0-based) is `base * 2^min(n, 16)`, capped at `max_backoff_ms`, plus up to
/// `max_jitter_ms` of random jitter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_jitter_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_jitter_ms: 1_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Backoff without jitter.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(16);
        self.base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }

    /// `None` once `attempt` reaches `max_attempts`.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        Some(Duration::from_millis(
            self.backoff_ms(attempt).saturating_add(jitter),
        ))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("retry.base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimerConfig {
    pub tick_ms: u64,
    pub channel: String,
    pub vibrate_ms: u64,
    pub default_interval_minutes: u32,
    pub title: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            channel: "pressure-relief".into(),
            vibrate_ms: 1_000,
            default_interval_minutes: 30,
            title: "Reminder".into(),
        }
    }
}

impl TimerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn body(&self, interval_minutes: u32) -> String {
        format!("Time to shift weight! ({interval_minutes} min)")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub structured_output: bool,
    pub api_key_env: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-3.5-turbo".into(),
            max_tokens: 512,
            temperature: 0.4,
            structured_output: true,
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

impl CompletionConfig {
    pub fn api_key(&self) -> Result<SecretString, ConfigError> {
        secret_from_env(&self.api_key_env)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Number outbound SMS are sent from (E.164).
    pub from_number: String,
    pub bladder_channel: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            from_number: "+15005550006".into(),
            bladder_channel: "bladder".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BillingConfig {
    pub payment_endpoint: String,
    pub currency: String,
    /// Environment variable holding the payment backend key, if it wants one.
    pub api_key_env: Option<String>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            payment_endpoint: "https://us-central1-spinetrack.cloudfunctions.net/createPaymentIntent"
                .into(),
            currency: "usd".into(),
            api_key_env: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub timer: TimerConfig,
    pub completion: CompletionConfig,
    pub relay: RelayConfig,
    pub billing: BillingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            request_timeout_ms: 15_000,
            retry: RetryPolicy::default(),
            timer: TimerConfig::default(),
            completion: CompletionConfig::default(),
            relay: RelayConfig::default(),
            billing: BillingConfig::default(),
        }
    }
}

impl Config {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        let config = Self::from_json(&raw)?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        self.retry.validate()?;

        if self.timer.tick_ms == 0 {
            return Err(ConfigError::Invalid("timer.tick_ms must be > 0".into()));
        }
        if self.timer.default_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "timer.default_interval_minutes must be > 0".into(),
            ));
        }
        if self.timer.channel.trim().is_empty() || self.relay.bladder_channel.trim().is_empty() {
            return Err(ConfigError::Invalid("notification channels cannot be empty".into()));
        }

        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(ConfigError::Invalid(
                "completion.temperature must be within 0..=2".into(),
            ));
        }
        if self.completion.max_tokens == 0 {
            return Err(ConfigError::Invalid("completion.max_tokens must be > 0".into()));
        }

        for endpoint in [&self.completion.endpoint, &self.billing.payment_endpoint] {
            ValidatedUrl::new(endpoint.as_str())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        Ok(())
    }
}

pub fn secret_from_env(var: &str) -> Result<SecretString, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretString::new(value)),
        _ => Err(ConfigError::MissingSecret { var: var.into() }),
    }
}
