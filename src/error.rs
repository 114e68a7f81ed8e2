use thiserror::Error;

use crate::crypto::CryptoError;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bot {0} is already running")]
    AlreadyRunning(i64),

    #[error("Bot {0} is not running")]
    NotRunning(i64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error means a stored credential cannot be recovered with
    /// the current key, so the operator has to re-enter it.
    pub fn is_unrecoverable_credential(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_unrecoverable())
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
