use std::time::Duration;

use thiserror::Error;

/// Failures at the language-model boundary, classified by what the caller
/// should do next rather than by message text.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("rate limited or out of quota (HTTP {status})")]
    RateLimited { status: u16 },
    #[error("model server error (HTTP {status})")]
    Server { status: u16 },
    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// Back-off class chosen for a failed model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    RateLimit,
    ServerError,
    Other,
}

impl RetryClass {
    /// Seconds-per-attempt multiplier: the wait before retrying attempt `n`
    /// (1-based) is `multiplier * n` units.
    pub fn multiplier(self) -> u32 {
        match self {
            RetryClass::RateLimit => 25,
            RetryClass::ServerError => 10,
            RetryClass::Other => 3,
        }
    }

    pub fn delay(self, attempt: u32, unit: Duration) -> Duration {
        unit * (self.multiplier() * attempt)
    }
}

impl ModelError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ModelError::RateLimited { .. } => RetryClass::RateLimit,
            ModelError::Server { .. } => RetryClass::ServerError,
            _ => RetryClass::Other,
        }
    }

    /// Map an HTTP status onto the closed error set.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ModelError::RateLimited { status },
            500..=599 => ModelError::Server { status },
            _ => ModelError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ModelError::from_status(status.as_u16(), e.to_string()),
            None if e.is_decode() => ModelError::Decode(e.to_string()),
            None => ModelError::Transport(e.to_string()),
        }
    }
}

/// Page fetch failures. Callers log these and carry on with "no content".
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("empty page")]
    Empty,
}

impl FetchError {
    /// Worth another attempt: throttling and upstream 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Timeout(_) | FetchError::Transport(_) => true,
            _ => false,
        }
    }
}
