//! Client capability interface.
//!
//! The pool never talks to a Kafka client library directly. It goes through
//! the traits in this module, which expose only what the pool consumes:
//! connect, disconnect, subscribe, run a message handler, and send a batch.
//!
//! Production code uses the `rdkafka` backend ([`crate::backend::rdkafka`]).
//! Tests and local development use the in-process broker
//! ([`crate::backend::memory`]).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{ClientLogLevel, ConnectionConfig, ConsumerConfig, ProducerConfig, SaslConfig};
use crate::error::PoolResult;

/// Connection settings for one cluster client, after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Cluster name, used for logging and error context.
    pub cluster: String,
    /// Client id shared by every cluster.
    pub client_id: String,
    /// Bootstrap brokers.
    pub brokers: Vec<String>,
    /// TLS enabled.
    pub tls: bool,
    /// SASL credentials.
    pub sasl: Option<SaslConfig>,
    /// Socket connection timeout.
    pub connection_timeout: Option<Duration>,
    /// Client library log verbosity.
    pub log_level: ClientLogLevel,
    /// Extra client library properties.
    pub properties: BTreeMap<String, String>,
}

impl ClientSettings {
    /// Builds settings from a cluster's connection parameters.
    ///
    /// The TLS toggle is normalized here so every backend sees a boolean.
    #[must_use]
    pub fn new(
        cluster: &str,
        client_id: &str,
        connection: &ConnectionConfig,
        log_level: ClientLogLevel,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            client_id: client_id.to_string(),
            brokers: connection.brokers.clone(),
            tls: connection.ssl.enabled(),
            sasl: connection.sasl.clone(),
            connection_timeout: connection.connection_timeout_ms.map(Duration::from_millis),
            log_level,
            properties: connection.properties.clone(),
        }
    }

    /// Comma-separated bootstrap list.
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// A message received by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Raw key.
    pub key: Option<Bytes>,
    /// Raw value.
    pub value: Option<Bytes>,
}

impl IncomingMessage {
    /// Key decoded as UTF-8 (lossy).
    #[must_use]
    pub fn key_text(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|key| String::from_utf8_lossy(key).into_owned())
    }

    /// Value decoded as UTF-8 (lossy).
    #[must_use]
    pub fn value_text(&self) -> Option<String> {
        self.value
            .as_ref()
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Message key.
    pub key: Option<String>,
    /// Message value.
    pub value: Option<String>,
    /// Explicit partition. The client partitioner decides when `None`.
    pub partition: Option<i32>,
    /// Message headers.
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Creates a message with only a value.
    #[must_use]
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Creates a message with a key and a value.
    #[must_use]
    pub fn keyed(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Sets the target partition.
    #[must_use]
    pub const fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A batch handed to a producer, with the send options already merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceBatch {
    /// Destination topic.
    pub topic: String,
    /// Messages in send order.
    pub messages: Vec<OutgoingMessage>,
    /// How long each send may wait in the local queue.
    pub timeout: Duration,
}

/// Broker acknowledgement for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Partition the message was written to.
    pub partition: i32,
    /// Offset assigned by the broker.
    pub offset: i64,
}

/// Receives messages from a running consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one message. The consumer awaits this before reading the next
    /// message from the same stream.
    async fn handle(&self, message: IncomingMessage);
}

/// Builds cluster clients.
pub trait KafkaConnector: Send + Sync + 'static {
    /// Creates a client for one cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are rejected by the client library.
    fn client(&self, settings: &ClientSettings) -> PoolResult<Arc<dyn KafkaClient>>;
}

/// A client bound to one cluster, used to build consumers and producers.
#[async_trait]
pub trait KafkaClient: Send + Sync {
    /// Creates a consumer in the given group. The consumer is not connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be created.
    async fn consumer(
        &self,
        group_id: &str,
        config: &ConsumerConfig,
    ) -> PoolResult<Arc<dyn ConsumerHandle>>;

    /// Creates a producer. The producer is not connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer cannot be created.
    async fn producer(&self, config: &ProducerConfig) -> PoolResult<Arc<dyn ProducerHandle>>;

    /// Lists the topics known to the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if cluster metadata cannot be fetched.
    async fn list_topics(&self) -> PoolResult<Vec<String>>;
}

/// A group consumer on one cluster.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    /// Connects to the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the brokers cannot be reached.
    async fn connect(&self) -> PoolResult<()>;

    /// Adds topics to the subscription. Topics subscribed by earlier calls stay
    /// subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription is rejected.
    async fn subscribe(&self, topics: &[String]) -> PoolResult<()>;

    /// Starts delivering messages to `handler`. Returns once delivery has
    /// started; messages keep flowing until [`ConsumerHandle::disconnect`].
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer is already running or not connected.
    async fn run(&self, handler: Arc<dyn MessageHandler>) -> PoolResult<()>;

    /// Stops delivery and leaves the group.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be closed cleanly.
    async fn disconnect(&self) -> PoolResult<()>;
}

/// A producer on one cluster.
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    /// Connects to the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the brokers cannot be reached.
    async fn connect(&self) -> PoolResult<()>;

    /// Sends a batch and waits for every acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure.
    async fn send(&self, batch: ProduceBatch) -> PoolResult<Vec<DeliveryReport>>;

    /// Flushes outstanding messages and closes the producer.
    ///
    /// # Errors
    ///
    /// Returns an error if outstanding messages cannot be flushed.
    async fn disconnect(&self) -> PoolResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSetting;

    #[test]
    fn test_settings_normalize_tls() {
        let text = ConnectionConfig::new(["a:9092"]).with_ssl("true");
        let flag = ConnectionConfig::new(["b:9092"]).with_ssl(true);
        let off = ConnectionConfig::new(["c:9092"]).with_ssl(TlsSetting::Text("no".into()));

        assert!(ClientSettings::new("a", "cms", &text, ClientLogLevel::Error).tls);
        assert!(ClientSettings::new("b", "cms", &flag, ClientLogLevel::Error).tls);
        assert!(!ClientSettings::new("c", "cms", &off, ClientLogLevel::Error).tls);
    }

    #[test]
    fn test_bootstrap_servers() {
        let connection = ConnectionConfig::new(["k1:9092", "k2:9092"]);
        let settings = ClientSettings::new("main", "cms", &connection, ClientLogLevel::Error);
        assert_eq!(settings.bootstrap_servers(), "k1:9092,k2:9092");
    }

    #[test]
    fn test_message_text() {
        let message = IncomingMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset: 7,
            key: Some(Bytes::from_static(b"id-1")),
            value: None,
        };
        assert_eq!(message.key_text().as_deref(), Some("id-1"));
        assert!(message.value_text().is_none());
    }

    #[test]
    fn test_outgoing_builders() {
        let message = OutgoingMessage::keyed("k", "v")
            .with_partition(2)
            .with_header("trace", "abc");
        assert_eq!(message.key.as_deref(), Some("k"));
        assert_eq!(message.partition, Some(2));
        assert_eq!(message.headers, vec![("trace".to_string(), "abc".to_string())]);
    }
}
