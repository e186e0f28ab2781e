// Error types for the booking API client
//
// `ClientError` covers startup problems that make the process useless (missing
// credentials, a client that cannot be built). `ApiError` covers a single call
// and is always handed back to the caller so sibling calls keep running.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Initialization error: {0}")]
    InitError(String),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("request failed with status {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Fetch ended without a result: {0}")]
    Aborted(String),
}

// Flat discriminant for consumers that only care about the category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Auth,
    Transport,
    Decode,
    HttpStatus,
    InvalidUrl,
    Cancelled,
    Aborted,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Config(_) => ErrorKind::Config,
            ApiError::Auth(_) => ErrorKind::Auth,
            ApiError::Transport(_) => ErrorKind::Transport,
            ApiError::Decode(_) => ErrorKind::Decode,
            ApiError::HttpStatus { .. } => ErrorKind::HttpStatus,
            ApiError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::Aborted(_) => ErrorKind::Aborted,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if err.is_timeout() {
            ApiError::Transport(format!("timed out: {}", err))
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}
