//! Typed error enums for the handful of call sites that branch on the
//! specific failure, not just log it. Everywhere else uses `Result<T, String>`,
//! matching how the rest of this crate already reports call-flow failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(String),
    #[error("invalid config file at {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid E.164 number: {0}")]
    InvalidPhoneNumber(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum WebhookVerifyError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature header is not valid base64")]
    BadEncoding,
    #[error("signature does not match computed HMAC")]
    SignatureMismatch,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider credentials rejected the request")]
    Unauthorized,
    #[error("provider returned HTTP {0}")]
    Http(u16),
    #[error("transport error reaching provider: {0}")]
    Transport(String),
}
