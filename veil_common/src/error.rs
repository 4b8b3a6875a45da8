//! Error handling utilities for the Veil obfuscator

use thiserror::Error;

/// The main error type for Veil operations
#[derive(Error, Debug, Clone)]
pub enum VeilError {
    #[error("Verifier error: {message}")]
    VerifyError { message: String },

    #[error("Evaluation error: {message}")]
    EvalError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },

    #[error("Serialization error: {message}")]
    SerializeError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}

/// Result type alias for Veil operations
pub type VeilResult<T> = Result<T, VeilError>;

impl VeilError {
    pub fn verify(message: impl Into<String>) -> Self {
        Self::VerifyError { message: message.into() }
    }

    pub fn eval(message: impl Into<String>) -> Self {
        Self::EvalError { message: message.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::IoError { message: message.into() }
    }

    pub fn serialize(message: impl Into<String>) -> Self {
        Self::SerializeError { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError { message: message.into() }
    }
}
