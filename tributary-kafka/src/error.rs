//! Error types for the Kafka pool.

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Error returned by a host callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while connecting, subscribing, producing or
/// disconnecting.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error raised by the underlying Kafka client.
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// A client, consumer or producer failed to connect.
    #[error("failed to connect cluster {cluster}: {message}")]
    Connect {
        /// Cluster name.
        cluster: String,
        /// Error description.
        message: String,
    },

    /// Subscribing the consumer to topics failed.
    #[error("failed to subscribe on cluster {cluster}: {message}")]
    Subscribe {
        /// Cluster name.
        cluster: String,
        /// Error description.
        message: String,
    },

    /// A produce request was not acknowledged.
    #[error("failed to send to {cluster}/{topic}: {message}")]
    Send {
        /// Cluster name.
        cluster: String,
        /// Topic name.
        topic: String,
        /// Error description.
        message: String,
    },

    /// Closing a consumer or producer failed.
    #[error("failed to disconnect cluster {cluster}: {message}")]
    Disconnect {
        /// Cluster name.
        cluster: String,
        /// Error description.
        message: String,
    },

    /// The cluster name is not in the registry.
    #[error("unknown cluster: {cluster}")]
    UnknownCluster {
        /// Cluster name.
        cluster: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error description.
        message: String,
    },

    /// Backend-specific failure that has no better category.
    #[error("backend error: {message}")]
    Backend {
        /// Error description.
        message: String,
    },
}

impl PoolError {
    /// Create a backend error from any displayable error.
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }

    /// Returns the cluster this error relates to, if any.
    #[must_use]
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Self::Connect { cluster, .. }
            | Self::Subscribe { cluster, .. }
            | Self::Send { cluster, .. }
            | Self::Disconnect { cluster, .. }
            | Self::UnknownCluster { cluster } => Some(cluster),
            Self::Kafka(_) | Self::InvalidConfig { .. } | Self::Backend { .. } => None,
        }
    }

    /// Returns true if this error came from establishing a connection.
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}
