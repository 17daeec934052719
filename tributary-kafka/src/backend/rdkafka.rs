//! `rdkafka` backend.
//!
//! Consumers are [`StreamConsumer`]s read by one tokio task each, so messages
//! of a consumer reach the handler one at a time. Producers are
//! [`FutureProducer`]s; a batch resolves when every delivery future does.
//! Blocking metadata calls run on the blocking pool.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{
    ClientSettings, ConsumerHandle, DeliveryReport, IncomingMessage, KafkaClient, KafkaConnector,
    MessageHandler, ProduceBatch, ProducerHandle,
};
use crate::config::{ClientLogLevel, ConsumerConfig, ProducerConfig};
use crate::error::{PoolError, PoolResult};

/// Metadata timeout used when the cluster sets no connection timeout.
const METADATA_TIMEOUT_DEFAULT: Duration = Duration::from_secs(10);

/// Flush timeout when a producer disconnects.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

const fn log_level(level: ClientLogLevel) -> RDKafkaLogLevel {
    match level {
        ClientLogLevel::Nothing => RDKafkaLogLevel::Emerg,
        ClientLogLevel::Error => RDKafkaLogLevel::Error,
        ClientLogLevel::Warn => RDKafkaLogLevel::Warning,
        ClientLogLevel::Info => RDKafkaLogLevel::Info,
        ClientLogLevel::Debug => RDKafkaLogLevel::Debug,
    }
}

const fn security_protocol(tls: bool, sasl: bool) -> &'static str {
    match (tls, sasl) {
        (false, false) => "plaintext",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    }
}

/// Builds the client configuration shared by a cluster's consumer and
/// producer.
#[must_use]
pub fn base_config(settings: &ClientSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", settings.bootstrap_servers())
        .set("client.id", &settings.client_id)
        .set(
            "security.protocol",
            security_protocol(settings.tls, settings.sasl.is_some()),
        )
        .set_log_level(log_level(settings.log_level));

    if let Some(sasl) = &settings.sasl {
        config
            .set("sasl.mechanism", sasl.mechanism.as_str())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    if let Some(timeout) = settings.connection_timeout {
        config.set(
            "socket.connection.setup.timeout.ms",
            timeout.as_millis().to_string(),
        );
    }

    for (key, value) in &settings.properties {
        config.set(key, value);
    }

    config
}

/// Connector creating `rdkafka` clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdKafkaConnector;

impl RdKafkaConnector {
    /// Creates a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl KafkaConnector for RdKafkaConnector {
    fn client(&self, settings: &ClientSettings) -> PoolResult<Arc<dyn KafkaClient>> {
        if settings.brokers.is_empty() {
            return Err(PoolError::InvalidConfig {
                message: format!("cluster {} has no brokers", settings.cluster),
            });
        }

        Ok(Arc::new(RdKafkaClient {
            cluster: settings.cluster.clone(),
            config: base_config(settings),
            metadata_timeout: settings
                .connection_timeout
                .unwrap_or(METADATA_TIMEOUT_DEFAULT),
        }))
    }
}

struct RdKafkaClient {
    cluster: String,
    config: ClientConfig,
    metadata_timeout: Duration,
}

impl RdKafkaClient {
    fn connect_error(&self, err: impl std::fmt::Display) -> PoolError {
        PoolError::Connect {
            cluster: self.cluster.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl KafkaClient for RdKafkaClient {
    async fn consumer(
        &self,
        group_id: &str,
        config: &ConsumerConfig,
    ) -> PoolResult<Arc<dyn ConsumerHandle>> {
        let mut client_config = self.config.clone();
        client_config.set("group.id", group_id);
        if let Some(timeout) = config.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }
        if let Some(reset) = config.auto_offset_reset {
            client_config.set("auto.offset.reset", reset.as_str());
        }
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| self.connect_error(e))?;

        Ok(Arc::new(RdKafkaConsumer {
            cluster: self.cluster.clone(),
            consumer: Arc::new(consumer),
            metadata_timeout: self.metadata_timeout,
            topics: Mutex::new(BTreeSet::new()),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }))
    }

    async fn producer(&self, config: &ProducerConfig) -> PoolResult<Arc<dyn ProducerHandle>> {
        let mut client_config = self.config.clone();
        client_config.set("message.timeout.ms", config.send_timeout_ms.to_string());
        if let Some(acks) = config.acks {
            client_config.set("acks", acks.to_string());
        }
        if let Some(compression) = &config.compression {
            client_config.set("compression.codec", compression);
        }
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| self.connect_error(e))?;

        Ok(Arc::new(RdKafkaProducer {
            cluster: self.cluster.clone(),
            producer,
            metadata_timeout: self.metadata_timeout,
        }))
    }

    async fn list_topics(&self) -> PoolResult<Vec<String>> {
        let client: BaseConsumer = self.config.create()?;
        let timeout = self.metadata_timeout;
        let metadata = tokio::task::spawn_blocking(move || client.fetch_metadata(None, timeout))
            .await
            .map_err(PoolError::backend)??;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }
}

fn to_incoming(message: &BorrowedMessage<'_>) -> IncomingMessage {
    IncomingMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
    }
}

struct RdKafkaConsumer {
    cluster: String,
    consumer: Arc<StreamConsumer>,
    metadata_timeout: Duration,
    topics: Mutex<BTreeSet<String>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ConsumerHandle for RdKafkaConsumer {
    async fn connect(&self) -> PoolResult<()> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.metadata_timeout;
        tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(PoolError::backend)?
            .map_err(|e| PoolError::Connect {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, topics: &[String]) -> PoolResult<()> {
        let subscribed: Vec<String> = {
            let mut current = self.topics.lock().expect("lock poisoned");
            current.extend(topics.iter().cloned());
            current.iter().cloned().collect()
        };
        let names: Vec<&str> = subscribed.iter().map(String::as_str).collect();

        self.consumer
            .subscribe(&names)
            .map_err(|e| PoolError::Subscribe {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> PoolResult<()> {
        let mut task = self.task.lock().expect("lock poisoned");
        if task.is_some() {
            return Err(PoolError::Backend {
                message: format!("consumer of cluster {} is already running", self.cluster),
            });
        }

        let consumer = Arc::clone(&self.consumer);
        let shutdown = Arc::clone(&self.shutdown);
        let cluster = self.cluster.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = shutdown.notified() => break,
                    result = consumer.recv() => result.map(|message| to_incoming(&message)),
                };

                match received {
                    Ok(message) => handler.handle(message).await,
                    Err(e) => warn!(%cluster, error = %e, "Kafka consumer error"),
                }
            }
            debug!(%cluster, "Kafka consumer loop stopped");
        }));

        Ok(())
    }

    async fn disconnect(&self) -> PoolResult<()> {
        self.shutdown.notify_one();
        let task = self.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            task.await.map_err(|e| PoolError::Disconnect {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })?;
        }

        if !self.topics.lock().expect("lock poisoned").is_empty() {
            self.consumer.unsubscribe();
        }
        Ok(())
    }
}

struct RdKafkaProducer {
    cluster: String,
    producer: FutureProducer,
    metadata_timeout: Duration,
}

fn headers(pairs: &[(String, String)]) -> Option<OwnedHeaders> {
    if pairs.is_empty() {
        return None;
    }
    let headers = pairs.iter().fold(OwnedHeaders::new(), |headers, (key, value)| {
        headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        })
    });
    Some(headers)
}

#[async_trait]
impl ProducerHandle for RdKafkaProducer {
    async fn connect(&self) -> PoolResult<()> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;
        tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, timeout).map(|_| ())
        })
        .await
        .map_err(PoolError::backend)?
        .map_err(|e| PoolError::Connect {
            cluster: self.cluster.clone(),
            message: e.to_string(),
        })
    }

    async fn send(&self, batch: ProduceBatch) -> PoolResult<Vec<DeliveryReport>> {
        let deliveries = batch.messages.iter().map(|message| {
            let mut record: FutureRecord<'_, str, str> = FutureRecord::to(&batch.topic);
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }
            if let Some(value) = &message.value {
                record = record.payload(value.as_str());
            }
            if let Some(partition) = message.partition {
                record = record.partition(partition);
            }
            if let Some(headers) = headers(&message.headers) {
                record = record.headers(headers);
            }
            self.producer.send(record, batch.timeout)
        });

        let acknowledged = try_join_all(deliveries)
            .await
            .map_err(|(e, _message)| PoolError::Send {
                cluster: self.cluster.clone(),
                topic: batch.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(
            cluster = %self.cluster,
            topic = %batch.topic,
            count = acknowledged.len(),
            "batch acknowledged"
        );

        Ok(acknowledged
            .into_iter()
            .map(|(partition, offset)| DeliveryReport { partition, offset })
            .collect())
    }

    async fn disconnect(&self) -> PoolResult<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(PoolError::backend)?
            .map_err(|e| PoolError::Disconnect {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, SaslConfig, SaslMechanism};

    fn settings(connection: &ConnectionConfig) -> ClientSettings {
        ClientSettings::new("main", "cms", connection, ClientLogLevel::Warn)
    }

    #[test]
    fn test_security_protocol() {
        assert_eq!(security_protocol(false, false), "plaintext");
        assert_eq!(security_protocol(true, false), "ssl");
        assert_eq!(security_protocol(false, true), "sasl_plaintext");
        assert_eq!(security_protocol(true, true), "sasl_ssl");
    }

    #[test]
    fn test_base_config() {
        let connection = ConnectionConfig::new(["k1:9092", "k2:9092"])
            .with_ssl("true")
            .with_sasl(SaslConfig {
                mechanism: SaslMechanism::ScramSha256,
                username: "svc".to_string(),
                password: "secret".to_string(),
            })
            .with_property("socket.keepalive.enable", "true");

        let config = base_config(&settings(&connection));

        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("client.id"), Some("cms"));
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(config.get("sasl.username"), Some("svc"));
        assert_eq!(config.get("socket.keepalive.enable"), Some("true"));
    }

    #[test]
    fn test_string_and_boolean_tls_agree() {
        let text = base_config(&settings(&ConnectionConfig::new(["a:9092"]).with_ssl("true")));
        let flag = base_config(&settings(&ConnectionConfig::new(["a:9092"]).with_ssl(true)));
        assert_eq!(text.get("security.protocol"), Some("ssl"));
        assert_eq!(flag.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_headers() {
        assert!(headers(&[]).is_none());
        let built = headers(&[("trace".to_string(), "abc".to_string())]);
        assert!(built.is_some());
    }

    #[test]
    fn test_connector_rejects_empty_brokers() {
        let connection = ConnectionConfig::new(Vec::<String>::new());
        let result = RdKafkaConnector::new().client(&settings(&connection));
        assert!(matches!(result, Err(PoolError::InvalidConfig { .. })));
    }
}
