//! Error types for Kino Control

use thiserror::Error;

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane error types
#[derive(Error, Debug)]
pub enum Error {
    // Ad tag errors
    #[error("Failed to fetch {url}: {message}")]
    Fetch {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to parse ad document: {0}")]
    Parse(String),

    #[error("VAST wrapper chain exceeded {depth} levels")]
    WrapperDepthExceeded { depth: usize },

    #[error("No playable linear creative")]
    NoLinearCreative,

    // Ad playback errors
    #[error("Ad media playback failed: {0}")]
    MediaPlayback(String),

    #[error("Ad playback rejected by autoplay policy")]
    AutoplayBlocked,

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a fetch error for an HTTP status
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Error::Fetch {
            url: url.into(),
            status: Some(status),
            message: format!("HTTP {}", status),
        }
    }

    /// Create a fetch error for a transport failure
    pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
        Error::Fetch {
            url: url.into(),
            status: None,
            message: message.to_string(),
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Fetch { .. } | Error::Network(_) | Error::AutoplayBlocked
        )
    }

    /// Returns the error code for analytics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Fetch { .. } => "AD_FETCH",
            Error::Parse(_) => "AD_PARSE",
            Error::WrapperDepthExceeded { .. } => "WRAPPER_LIMIT",
            Error::NoLinearCreative => "NO_LINEAR",
            Error::MediaPlayback(_) => "AD_MEDIA",
            Error::AutoplayBlocked => "AUTOPLAY_BLOCKED",
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Json(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }

    /// IAB VAST error code substituted into `[ERRORCODE]` tracking macros
    pub fn vast_error_code(&self) -> u16 {
        match self {
            Error::Parse(_) => 100,
            Error::Fetch { .. } | Error::Network(_) => 301,
            Error::WrapperDepthExceeded { .. } => 302,
            Error::NoLinearCreative => 401,
            Error::MediaPlayback(_) => 405,
            Error::AutoplayBlocked => 400,
            _ => 900,
        }
    }
}
