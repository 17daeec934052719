//! Topic dispatch.
//!
//! Each consumer runs with one [`TopicDispatcher`]. For every message it looks
//! up the callbacks registered for the message's topic and runs them
//! concurrently. Failures, panics included, are folded into a single consume
//! error per message, and the consumer keeps reading.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::client::{IncomingMessage, MessageHandler};
use crate::registry::TopicTable;
use crate::error::CallbackError;
use crate::registry::TopicCallback;
use crate::reporting::{ConsumeErrorMetadata, DispatchContext, ErrorReporter};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    match detail {
        Some(detail) => format!("callback panicked: {detail}"),
        None => "callback panicked".to_string(),
    }
}

/// Runs one callback, turning a panic into an error.
async fn invoke(
    callback: &TopicCallback,
    key: Option<String>,
    value: Option<String>,
) -> Result<(), CallbackError> {
    AssertUnwindSafe(async { callback(key, value).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()).into()))
}

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No callback is registered for the topic.
    Unrouted,
    /// Every callback succeeded.
    Delivered {
        /// Callbacks invoked.
        callbacks: usize,
    },
    /// At least one callback failed; one error was reported.
    Failed {
        /// Callbacks invoked.
        callbacks: usize,
        /// Callbacks that returned an error.
        failures: usize,
    },
}

/// Routes messages of one consumer to the callbacks of its topic table.
#[derive(Debug)]
pub struct TopicDispatcher {
    cluster: String,
    topics: Arc<TopicTable>,
    reporter: ErrorReporter,
}

impl TopicDispatcher {
    /// Creates a dispatcher for the consumer of `cluster`.
    #[must_use]
    pub fn new(cluster: impl Into<String>, topics: Arc<TopicTable>, reporter: ErrorReporter) -> Self {
        Self {
            cluster: cluster.into(),
            topics,
            reporter,
        }
    }

    /// Cluster this dispatcher serves.
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Runs every callback registered for the message's topic.
    ///
    /// All callbacks run to completion even if one fails or panics, so the
    /// effects of the successful ones always stand. The first failure in
    /// registration order is reported.
    pub async fn dispatch(&self, message: IncomingMessage) -> DispatchOutcome {
        let callbacks = self.topics.callbacks(&message.topic);
        if callbacks.is_empty() {
            debug!(
                cluster = %self.cluster,
                topic = %message.topic,
                partition = message.partition,
                "no callbacks registered for topic, message ignored"
            );
            return DispatchOutcome::Unrouted;
        }

        let key = message.key_text();
        let value = message.value_text();

        trace!(
            cluster = %self.cluster,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            callbacks = callbacks.len(),
            "dispatching message"
        );

        let results = join_all(
            callbacks
                .iter()
                .map(|callback| invoke(callback, key.clone(), value.clone())),
        )
        .await;

        let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        let Some(first) = failures.first() else {
            return DispatchOutcome::Delivered {
                callbacks: callbacks.len(),
            };
        };

        let context = DispatchContext {
            cluster: self.cluster.clone(),
            topic: message.topic,
            partition: message.partition,
        };
        let metadata = ConsumeErrorMetadata {
            key,
            value,
            error_message: first.to_string(),
        };
        self.reporter.on_error(context, metadata);

        DispatchOutcome::Failed {
            callbacks: callbacks.len(),
            failures: failures.len(),
        }
    }
}

#[async_trait]
impl MessageHandler for TopicDispatcher {
    async fn handle(&self, message: IncomingMessage) {
        self.dispatch(message).await;
    }
}
