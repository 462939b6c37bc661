//! Error types for the inter-service layer

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Service {service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Service is not registered")]
    NotRegistered,

    #[error("Service is already registered")]
    AlreadyRegistered,

    #[error("Circuit breaker open for {service}")]
    CircuitOpen { service: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Unavailable { .. } | Error::Connection(_) | Error::CircuitOpen { .. } => {
                Self::unavailable(err.to_string())
            }
            Error::NotRegistered => Self::failed_precondition(err.to_string()),
            Error::AlreadyRegistered => Self::already_exists(err.to_string()),
            Error::Timeout(_) => Self::deadline_exceeded(err.to_string()),
            Error::Store(_) | Error::Serialization(_) | Error::Configuration(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
