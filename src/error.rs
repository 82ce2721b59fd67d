//! Per-item failures. None of these abort a run; they are recorded and skipped.
//! Persistence failures are `anyhow` errors and are fatal.

use thiserror::Error;

/// Why a single seed URL produced no raw page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("robots.txt disallows fetching")]
    RobotsDisallowed,

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("non-success status {0}")]
    Status(u16),

    #[error("failed reading body: {0}")]
    Body(String),

    #[error("cancelled before fetch started")]
    Cancelled,
}

impl FetchError {
    /// Status string written to the manifest.
    pub fn manifest_status(&self) -> String {
        match self {
            Self::InvalidUrl(_) => "invalid-url".to_string(),
            Self::RobotsDisallowed => "robots-disallowed".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::Connect(_) => "connection-error".to_string(),
            Self::Status(code) => format!("http-{code}"),
            Self::Body(_) => "body-error".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            Self::Body(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }
}

/// Why a raw page could not be segmented.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("document is empty")]
    Empty,

    #[error("document looks like binary data")]
    Binary,

    #[error("document contains no markup")]
    NotMarkup,

    #[error("raw page unreadable: {0}")]
    Unreadable(String),
}

/// Why a row was dropped at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum MergeRejection {
    #[error("missing url")]
    MissingUrl,

    #[error("missing body")]
    MissingBody,

    #[error("malformed row")]
    Malformed,
}
