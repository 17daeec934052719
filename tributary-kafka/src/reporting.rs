//! Consume error reporting.
//!
//! Failed callbacks are not retried or dead-lettered. Each failure becomes one
//! structured log record tagged `consume` and one [`PoolEvent::ConsumeError`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::events::{EventBus, PoolEvent};

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    /// Cluster name.
    pub cluster: String,
    /// Topic name.
    pub topic: String,
    /// Partition index.
    pub partition: i32,
}

/// What failed while handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeErrorMetadata {
    /// Decoded message key.
    pub key: Option<String>,
    /// Decoded message value.
    pub value: Option<String>,
    /// Message of the first failing callback.
    pub error_message: String,
}

/// A reported consume failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeErrorRecord {
    /// When the failure was recorded.
    pub inserted_at: DateTime<Utc>,
    /// Message origin.
    pub context: DispatchContext,
    /// Failure details.
    pub metadata: ConsumeErrorMetadata,
}

/// Sink for consume failures.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    events: EventBus,
}

impl ErrorReporter {
    /// Creates a reporter publishing on `events`.
    #[must_use]
    pub const fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Logs a consume failure and publishes it to event receivers.
    pub fn on_error(
        &self,
        context: DispatchContext,
        metadata: ConsumeErrorMetadata,
    ) -> Arc<ConsumeErrorRecord> {
        let record = Arc::new(ConsumeErrorRecord {
            inserted_at: Utc::now(),
            context,
            metadata,
        });

        error!(
            target: "tributary",
            kind = "consume",
            inserted_at = %record.inserted_at.to_rfc3339(),
            cluster = %record.context.cluster,
            topic = %record.context.topic,
            partition = record.context.partition,
            key = ?record.metadata.key,
            value = ?record.metadata.value,
            error = %record.metadata.error_message,
            "Kafka consume error"
        );

        self.events.emit(PoolEvent::ConsumeError(Arc::clone(&record)));
        record
    }
}
