//! Error types for the gateway.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Model '{model}' not found")]
    ModelNotFound { model: String },

    /// Upstream answered 429. `retry_after` is what the body suggested, if anything.
    #[error("Upstream rate limited")]
    RateLimited {
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("Upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("No upstream accounts configured")]
    NoCredential,

    #[error("All {tried} accounts are rate limited")]
    AllRateLimited { tried: usize },

    #[error("All accounts exhausted")]
    CredentialExhausted,

    #[error("Token refresh failed: {message}")]
    Refresh { message: String },

    #[error("Credential store error: {message}")]
    Store { message: String },

    #[error("Conversion error: {message}")]
    Conversion { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification used to pick the error `type` string in each public envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    NotFound,
    RateLimit,
    Api,
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn refresh(msg: impl Into<String>) -> Self {
        Self::Refresh {
            message: msg.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
        }
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the orchestrator should mark the account and try another one.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } | Self::Conversion { .. } => ErrorKind::InvalidRequest,
            Self::Unauthorized | Self::NoCredential => ErrorKind::Authentication,
            Self::ModelNotFound { .. } => ErrorKind::NotFound,
            Self::RateLimited { .. } | Self::AllRateLimited { .. } | Self::CredentialExhausted => {
                ErrorKind::RateLimit
            }
            Self::Upstream { status, .. } => match status {
                400 => ErrorKind::InvalidRequest,
                401 | 403 => ErrorKind::Authentication,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::RateLimit,
                _ => ErrorKind::Api,
            },
            _ => ErrorKind::Api,
        }
    }

    /// HTTP status returned to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } | Self::Conversion { .. } => 400,
            Self::Unauthorized | Self::NoCredential => 401,
            Self::ModelNotFound { .. } => 404,
            Self::RateLimited { .. } | Self::AllRateLimited { .. } | Self::CredentialExhausted => {
                429
            }
            Self::Upstream { status, .. } if (400..600).contains(status) => *status,
            Self::Upstream { .. } | Self::Http(_) | Self::Refresh { .. } => 502,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
