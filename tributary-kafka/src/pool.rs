//! The Kafka pool: connection lifecycle, subscriptions and publishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::client::{
    ClientSettings, DeliveryReport, KafkaConnector, OutgoingMessage, ProduceBatch,
};
use crate::config::{ClusterConfig, PoolConfig};
use crate::dispatch::TopicDispatcher;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::registry::{ClusterEntry, ClusterRegistry, ConsumerEntry, ProducerEntry, TopicCallback, TopicTable};
use crate::reporting::ErrorReporter;

/// Topics named by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOptions {
    /// A single topic.
    Topic(String),
    /// Several topics.
    Topics(Vec<String>),
}

impl SubscribeOptions {
    /// Subscribe to one topic.
    #[must_use]
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::Topic(topic.into())
    }

    /// Subscribe to several topics.
    #[must_use]
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Topics(topics.into_iter().map(Into::into).collect())
    }

    /// Topic names in the order given.
    #[must_use]
    pub fn names(&self) -> &[String] {
        match self {
            Self::Topic(topic) => std::slice::from_ref(topic),
            Self::Topics(topics) => topics,
        }
    }

    /// True when at least one topic is named and no name is empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let names = self.names();
        !names.is_empty() && names.iter().all(|name| !name.is_empty())
    }
}

impl From<&str> for SubscribeOptions {
    fn from(topic: &str) -> Self {
        Self::topic(topic)
    }
}

impl From<String> for SubscribeOptions {
    fn from(topic: String) -> Self {
        Self::Topic(topic)
    }
}

impl From<Vec<String>> for SubscribeOptions {
    fn from(topics: Vec<String>) -> Self {
        Self::Topics(topics)
    }
}

/// Per-call overrides for [`KafkaPool::produce_messages`].
///
/// Acks and compression are fixed per producer by [`ProducerConfig`](crate::ProducerConfig).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Overrides the producer's default send timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Sets the send timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resets the in-flight flag when a disconnect ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Connections to every configured cluster.
///
/// The pool owns its registry; several pools can coexist in one process.
pub struct KafkaPool {
    config: PoolConfig,
    connector: Arc<dyn KafkaConnector>,
    registry: ClusterRegistry,
    connecting: Mutex<()>,
    disconnecting: AtomicBool,
    events: EventBus,
    reporter: ErrorReporter,
}

impl std::fmt::Debug for KafkaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPool")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("disconnecting", &self.disconnecting)
            .finish_non_exhaustive()
    }
}

impl KafkaPool {
    /// Creates a pool. Nothing is connected until [`Self::connect_all`].
    #[must_use]
    pub fn new(config: PoolConfig, connector: Arc<dyn KafkaConnector>) -> Self {
        let events = EventBus::new();
        Self {
            config,
            connector,
            registry: ClusterRegistry::new(),
            connecting: Mutex::new(()),
            disconnecting: AtomicBool::new(false),
            reporter: ErrorReporter::new(events.clone()),
            events,
        }
    }

    /// The configuration this pool was built from.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The cluster registry.
    #[must_use]
    pub const fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// The consume error sink.
    #[must_use]
    pub const fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Returns true when the configuration has a client id, a group id and a
    /// table of clusters.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.config.is_usable()
    }

    /// Registers a receiver for pool events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        self.events.emit(event);
    }

    /// Connects every configured cluster that is not registered yet.
    ///
    /// Clusters already in the registry are skipped, so calling this again is
    /// harmless. The first connection failure is returned; clusters connected
    /// before it stay registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster table is missing or a client, consumer
    /// or producer fails to connect.
    pub async fn connect_all(&self) -> PoolResult<()> {
        let _connecting = self.connecting.lock().await;

        let clusters = self.config.clusters().ok_or_else(|| PoolError::InvalidConfig {
            message: "clusters must be a table of cluster definitions".to_string(),
        })?;
        let client_id = self.config.client_id.as_deref().unwrap_or_default();
        let group_id = self.config.group_id.as_deref().unwrap_or_default();

        for (name, cluster) in clusters {
            if self.registry.contains(name).await {
                debug!(cluster = %name, "cluster already connected, skipping");
                continue;
            }

            let entry = self.connect_cluster(name, cluster, client_id, group_id).await?;
            let client = Arc::clone(&entry.client);
            self.registry.insert(entry).await;

            info!(
                cluster = %name,
                consumer = cluster.consumer.is_some(),
                producer = cluster.producer.is_some(),
                "Kafka cluster connected"
            );

            if self.config.debug {
                let pool_size = self.registry.len().await;
                match client.list_topics().await {
                    Ok(topics) => info!(
                        cluster = %name,
                        pool_size,
                        ?topics,
                        "Kafka dev infos"
                    ),
                    Err(e) => warn!(cluster = %name, error = %e, "failed to list topics"),
                }
            }
        }

        Ok(())
    }

    async fn connect_cluster(
        &self,
        name: &str,
        cluster: &ClusterConfig,
        client_id: &str,
        group_id: &str,
    ) -> PoolResult<ClusterEntry> {
        let settings = ClientSettings::new(name, client_id, &cluster.connection, cluster.log);
        let client = self.connector.client(&settings)?;

        let consumer = match &cluster.consumer {
            Some(config) => {
                let instance = client.consumer(group_id, config).await?;
                instance.connect().await?;
                Some(ConsumerEntry {
                    instance,
                    topics: Arc::new(TopicTable::new()),
                })
            }
            None => None,
        };

        let producer = match &cluster.producer {
            Some(config) => {
                let connected = match client.producer(config).await {
                    Ok(instance) => instance.connect().await.map(|()| instance),
                    Err(e) => Err(e),
                };
                match connected {
                    Ok(instance) => Some(ProducerEntry {
                        instance,
                        send_timeout: config.send_timeout(),
                    }),
                    Err(e) => {
                        // The entry is never registered, so nothing else can
                        // reach the consumer to close it.
                        if let Some(consumer) = &consumer {
                            if let Err(close) = consumer.instance.disconnect().await {
                                warn!(
                                    cluster = %name,
                                    error = %close,
                                    "failed to close consumer after producer error"
                                );
                            }
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        Ok(ClusterEntry {
            name: name.to_string(),
            client,
            consumer,
            producer,
        })
    }

    /// Starts message delivery on every registered consumer.
    ///
    /// Returns the number of consumers started.
    ///
    /// # Errors
    ///
    /// Returns the first consumer that fails to start.
    pub async fn run_consumers(&self) -> PoolResult<usize> {
        let consumers = self.registry.consumers().await;
        for (name, consumer) in &consumers {
            let dispatcher = TopicDispatcher::new(
                name.clone(),
                Arc::clone(&consumer.topics),
                self.reporter.clone(),
            );
            consumer.instance.run(Arc::new(dispatcher)).await?;
            debug!(cluster = %name, "consumer running");
        }
        Ok(consumers.len())
    }

    /// Disconnects every consumer, then every producer.
    ///
    /// Only one disconnect runs at a time: a call made while another is in
    /// flight returns immediately without doing anything.
    ///
    /// # Errors
    ///
    /// Returns the first handle that fails to disconnect. Handles after it are
    /// left connected.
    pub async fn disconnect_all(&self) -> PoolResult<()> {
        if self
            .disconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("disconnect already in progress");
            return Ok(());
        }
        let _in_flight = InFlight(&self.disconnecting);

        for (name, consumer) in self.registry.consumers().await {
            consumer.instance.disconnect().await?;
            info!(cluster = %name, "Kafka consumer disconnected");
        }

        for (name, producer) in self.registry.producers().await {
            producer.instance.disconnect().await?;
            info!(cluster = %name, "Kafka producer disconnected");
        }

        Ok(())
    }

    /// Registers `callback` for the topics named by `options` on `cluster`'s
    /// consumer.
    ///
    /// Subscriptions add up across calls. Registering the same callback twice
    /// makes it run twice per message.
    ///
    /// An unknown cluster, a cluster without consumer, or options naming no
    /// topic are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer rejects the subscription.
    pub async fn subscribe_topic(
        &self,
        cluster: &str,
        callback: TopicCallback,
        options: SubscribeOptions,
    ) -> PoolResult<()> {
        let Some(entry) = self.registry.get(cluster).await else {
            warn!(%cluster, "Kafka topic subscribe: cluster is unknown");
            return Ok(());
        };

        if !options.is_valid() {
            warn!(%cluster, ?options, "Kafka subscribe: no topic given in subscribe options");
            return Ok(());
        }

        let Some(consumer) = entry.consumer else {
            warn!(%cluster, "Kafka topic subscribe: cluster has no consumer configured");
            return Ok(());
        };

        consumer.instance.subscribe(options.names()).await?;

        for topic in options.names() {
            consumer.topics.register(topic, Arc::clone(&callback));
        }

        debug!(%cluster, topics = ?options.names(), "subscribed");
        Ok(())
    }

    /// Sends `messages` to `topic` through `cluster`'s producer.
    ///
    /// Resolves once every message is acknowledged. A cluster without
    /// producer is logged and nothing is sent.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownCluster`] if the cluster is not registered,
    /// or the producer's error if a send fails.
    pub async fn produce_messages(
        &self,
        cluster: &str,
        topic: &str,
        messages: Vec<OutgoingMessage>,
        options: SendOptions,
    ) -> PoolResult<Vec<DeliveryReport>> {
        let entry = self
            .registry
            .get(cluster)
            .await
            .ok_or_else(|| PoolError::UnknownCluster {
                cluster: cluster.to_string(),
            })?;

        let Some(producer) = entry.producer else {
            warn!(
                %cluster,
                %topic,
                "Kafka cannot produce a message, no producer found for the cluster"
            );
            return Ok(Vec::new());
        };

        let batch = ProduceBatch {
            topic: topic.to_string(),
            messages,
            timeout: options.timeout.unwrap_or(producer.send_timeout),
        };
        producer.instance.send(batch).await
    }
}
