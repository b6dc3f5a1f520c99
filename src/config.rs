//! Layered configuration: typed defaults, optionally overridden by a TOML
//! file, with secret fields further overridable from the environment so
//! credentials never need to live on disk.

use crate::constants::*;
use crate::errors::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Twilio,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelProvider {
    None,
    Ngrok,
    TailscaleServe,
    TailscaleFunnel,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub openai_api_key: Option<String>,
    pub silence_duration_ms: u64,
    pub vad_threshold: f32,
    pub stream_path: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            silence_duration_ms: DEFAULT_SILENCE_DURATION_MS,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub port: u16,
    pub bind: String,
    pub path: String,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVE_PORT,
            bind: DEFAULT_SERVE_BIND.to_string(),
            path: DEFAULT_WEBHOOK_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: Option<Provider>,
    pub from_number: Option<String>,
    pub twilio: TwilioConfig,
    pub streaming: StreamingConfig,
    pub serve: ServeConfig,
    pub tunnel_provider: TunnelProvider,
    pub public_url: Option<String>,
    pub max_concurrent_calls: u32,
    pub max_duration_seconds: u64,
    pub store: PathBuf,
    pub agent_wake_url: Option<String>,
    pub agent_wake_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: None,
            from_number: None,
            twilio: TwilioConfig::default(),
            streaming: StreamingConfig::default(),
            serve: ServeConfig::default(),
            tunnel_provider: TunnelProvider::None,
            public_url: None,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_duration_seconds: DEFAULT_MAX_DURATION_SECONDS,
            store: default_store_dir(),
            agent_wake_url: None,
            agent_wake_token: None,
        }
    }
}

fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clawd")
        .join("supercall-logs")
}

impl Config {
    /// Load defaults, merge an optional TOML file (path from `SUPERCALL_CONFIG`),
    /// then let environment variables win for secret fields.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SUPERCALL_CONFIG") {
            Ok(path) => Self::from_toml_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(sid) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = Some(sid);
        }
        if let Ok(token) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = Some(token);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.streaming.openai_api_key = Some(key);
        }
        if let Ok(token) = std::env::var("AGENT_WAKE_TOKEN") {
            config.agent_wake_token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_string(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.provider, Some(Provider::Twilio)) {
            let from = self
                .from_number
                .as_ref()
                .ok_or_else(|| ConfigError::MissingField("fromNumber".to_string()))?;
            if !is_e164(from) {
                return Err(ConfigError::InvalidPhoneNumber(from.clone()));
            }
        }
        Ok(())
    }
}

pub fn is_e164(number: &str) -> bool {
    let mut chars = number.chars();
    match chars.next() {
        Some('+') => {}
        _ => return false,
    }
    let rest: &str = &number[1..];
    !rest.is_empty() && rest.len() <= 15 && rest.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.serve.port, 3334);
        assert_eq!(config.serve.bind, "127.0.0.1");
        assert_eq!(config.serve.path, "/voice/webhook");
        assert_eq!(config.streaming.stream_path, "/voice/stream");
        assert_eq!(config.max_concurrent_calls, 1);
        assert_eq!(config.max_duration_seconds, 300);
    }

    #[test]
    fn validates_e164() {
        assert!(is_e164("+15550001234"));
        assert!(!is_e164("15550001234"));
        assert!(!is_e164("+"));
        assert!(!is_e164("+1555abc1234"));
    }

    #[test]
    fn twilio_without_from_number_fails_validation() {
        let mut config = Config::default();
        config.provider = Some(Provider::Twilio);
        assert!(config.validate().is_err());
    }
}
