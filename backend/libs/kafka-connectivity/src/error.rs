//! Error types for the Kafka connectivity library.

use thiserror::Error;

/// Result type alias for connectivity operations.
pub type Result<T> = std::result::Result<T, KafkaConnectivityError>;

/// Errors raised by consumer streams, their supervisor and the publisher.
#[derive(Error, Debug)]
pub enum KafkaConnectivityError {
    /// Invalid address or settings, never retried
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Error reported by the broker client
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The downstream sink no longer accepts messages
    #[error("Downstream sink closed")]
    SinkClosed,

    /// The sink asked for a message to be delivered again
    #[error("Redelivery requested for {topic}/{partition} at offset {offset}")]
    RedeliveryRequested {
        topic: String,
        partition: i32,
        offset: i64,
    },

    /// Failed to commit consumer offsets
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// Creating a consumer stream failed
    #[error("Failed to start consumer stream: {0}")]
    StreamStart(String),

    /// The consumer stream task terminated abnormally
    #[error("Consumer stream failed: {0}")]
    StreamFailed(String),

    /// The restart supervisor has already stopped
    #[error("Consumer stream supervisor stopped")]
    SupervisorStopped,

    /// The consumer actor has already stopped
    #[error("Consumer actor stopped")]
    ActorStopped,
}

/// Configuration problems surfaced synchronously at parse or load time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Malformed publish target address
    #[error("Invalid target address '{address}': {reason}")]
    InvalidTarget { address: String, reason: String },

    /// Settings failed to load or validate
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl ConfigurationError {
    pub(crate) fn invalid_target(address: &str, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidTarget {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::InvalidSettings(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ConfigurationError {
    fn from(err: validator::ValidationErrors) -> Self {
        ConfigurationError::InvalidSettings(err.to_string())
    }
}

impl From<resilience::BackoffError> for ConfigurationError {
    fn from(err: resilience::BackoffError) -> Self {
        ConfigurationError::InvalidSettings(err.to_string())
    }
}

impl KafkaConnectivityError {
    /// Check if the error should be answered with a stream restart
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KafkaConnectivityError::Kafka(_)
                | KafkaConnectivityError::RedeliveryRequested { .. }
                | KafkaConnectivityError::OffsetCommit(_)
                | KafkaConnectivityError::StreamStart(_)
                | KafkaConnectivityError::StreamFailed(_)
        )
    }
}
