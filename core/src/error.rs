//! Error types for QR Parking Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No network connection")]
    Connectivity,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Calling token unavailable: {0}")]
    AuthExpired(String),

    #[error("A call is already in progress: {0}")]
    CallInProgress(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures worth another attempt. Validation and
    /// connectivity errors are never retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend(_) | Error::Http(_))
    }

    /// Text shown to the user when a call is blocked.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::Connectivity => "No internet connection. Check your network and try again.".to_string(),
            Error::AuthExpired(_) => "Your calling session has expired. Please sign in again.".to_string(),
            Error::CallInProgress(_) => "Another call is already in progress.".to_string(),
            Error::NotLoggedIn => "Please sign in to place calls.".to_string(),
            _ => "Unable to start the call. Please try again later.".to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(e.to_string())
    }
}
