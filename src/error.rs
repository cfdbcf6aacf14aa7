//! Error types for the connection supervisor
//!
//! Each variant maps to one class of failure: configuration problems surface
//! immediately, dial failures are retried before they surface, channel and
//! queue failures carry any cleanup failure alongside them, and publish-time
//! state errors never touch the network.

use crate::config::ConfigError;
use crate::supervisor::ResourceKind;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to the broker after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u64,
        #[source]
        source: TransportError,
    },

    #[error("Failed to connect to the broker: no connection attempts configured")]
    NoAttempts,

    #[error("Missing connection")]
    MissingConnection,

    #[error("Connection was replaced while a channel was being set up")]
    Superseded,

    #[error("Failed to open a channel: {0}")]
    ChannelFailed(#[source] TransportError),

    #[error("Failed to declare queue '{queue}': {source}")]
    QueueDeclareFailed {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("{primary} and close connection: {cleanup}")]
    CleanupFailed {
        primary: Box<SupervisorError>,
        #[source]
        cleanup: TransportError,
    },

    #[error("Failed to publish a message, connection is missing")]
    PublishWithoutConnection,

    #[error("Failed to publish a message, connection is closed")]
    PublishOnClosedConnection,

    #[error("Failed to publish a message, channel is missing")]
    PublishWithoutChannel,

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish a message: {0}")]
    PublishFailed(#[source] TransportError),

    #[error("Failed to close {kind}: {source}")]
    CloseFailed {
        kind: ResourceKind,
        #[source]
        source: TransportError,
    },

    #[error("Supervisor has been shut down")]
    ShutDown,
}

impl SupervisorError {
    /// Attach a failed cleanup to the error that triggered it
    pub fn with_cleanup_failure(self, cleanup: TransportError) -> Self {
        Self::CleanupFailed {
            primary: Box::new(self),
            cleanup,
        }
    }

    /// Whether the operation never reached the broker because of local state
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::MissingConnection
                | Self::Superseded
                | Self::PublishWithoutConnection
                | Self::PublishOnClosedConnection
                | Self::PublishWithoutChannel
                | Self::ShutDown
        )
    }
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;
