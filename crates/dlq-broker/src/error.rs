//! Error types for broker operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all broker operations
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Message {sequence_number} not found in {entity}")]
    MessageNotFound {
        entity: String,
        sequence_number: i64,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl BrokerError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NamespaceNotFound { .. } => false,
            Self::EntityNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::Unavailable { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true,
            Self::InvalidRequest { .. } => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Short machine-readable code for history rows and logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::NamespaceNotFound { .. } => "namespace_not_found",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::MessageNotFound { .. } => "message_not_found",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::ProviderError { .. } => "provider_error",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
