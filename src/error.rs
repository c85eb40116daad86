//! Error types for the wallet session manager

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::types::ProviderKind;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the session manager
#[derive(Error, Debug)]
pub enum Error {
    // Provider errors
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(ProviderKind),

    #[error("User rejected the request in {0}")]
    UserRejected(ProviderKind),

    #[error("Provider not connected: {0}")]
    NotConnected(ProviderKind),

    // Coordination errors
    #[error("No active provider")]
    NoActiveProvider,

    #[error("Connect to {kind} timed out after {seconds}s")]
    ConnectTimeout { kind: ProviderKind, seconds: u64 },

    #[error("Disconnect of {kind} timed out after {millis}ms")]
    DisconnectTimeout { kind: ProviderKind, millis: u64 },

    // Extension host errors
    #[error("Host connection failed: {0}")]
    HostConnection(String),

    #[error("Host request failed: {0}")]
    HostRequest(String),

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Credential store errors
    #[error("Credential store error: {0}")]
    Store(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Stable error category carried on session snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProviderUnavailable,
    UserRejected,
    NotConnected,
    Timeout,
    Rpc,
    Internal,
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UserRejected(_)
                | Error::ConnectTimeout { .. }
                | Error::DisconnectTimeout { .. }
                | Error::HostConnection(_)
                | Error::Rpc(_)
                | Error::RpcTimeout(_)
        )
    }

    /// Map to the coarse category shown on session snapshots
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
            Error::UserRejected(_) => ErrorCode::UserRejected,
            Error::NotConnected(_) | Error::NoActiveProvider => ErrorCode::NotConnected,
            Error::ConnectTimeout { .. } | Error::DisconnectTimeout { .. } => ErrorCode::Timeout,
            Error::Rpc(_) | Error::RpcTimeout(_) => ErrorCode::Rpc,
            _ => ErrorCode::Internal,
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from URL parse errors
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", e))
    }
}
