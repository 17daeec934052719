//! In-process Kafka stand-in.
//!
//! Each named cluster keeps an append-only log per topic and delivers new
//! records to connected consumers subscribed to the topic, once per consumer
//! group. Every connect, subscribe, disconnect and send is counted so tests
//! can assert on how the pool drove its clients.
//!
//! Connects and disconnects yield to the scheduler once, like a network round
//! trip would.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{
    ClientSettings, ConsumerHandle, DeliveryReport, IncomingMessage, KafkaClient, KafkaConnector,
    MessageHandler, ProduceBatch, ProducerHandle,
};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::{PoolError, PoolResult};

/// Call counters for one cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Clients created.
    pub clients: usize,
    /// Successful consumer connects.
    pub consumer_connects: usize,
    /// Consumer disconnects.
    pub consumer_disconnects: usize,
    /// Successful producer connects.
    pub producer_connects: usize,
    /// Producer disconnects.
    pub producer_disconnects: usize,
    /// Subscribe calls.
    pub subscribe_calls: usize,
    /// Messages accepted by producers.
    pub messages_sent: usize,
}

/// A record in a topic log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Partition.
    pub partition: i32,
    /// Offset within the topic log.
    pub offset: i64,
    /// Key.
    pub key: Option<String>,
    /// Value.
    pub value: Option<String>,
    /// Headers.
    pub headers: Vec<(String, String)>,
}

struct ConsumerShared {
    group_id: String,
    topics: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
    sender: mpsc::UnboundedSender<IncomingMessage>,
}

#[derive(Default)]
struct ClusterState {
    clients: Vec<ClientSettings>,
    log: BTreeMap<String, Vec<StoredRecord>>,
    consumers: Vec<Arc<ConsumerShared>>,
    stats: MemoryStats,
    fail_connect: bool,
    fail_producer_connect: bool,
    fail_send: Option<String>,
    send_timeouts: Vec<Duration>,
}

impl ClusterState {
    fn append(&mut self, topic: &str, record: StoredRecord) -> DeliveryReport {
        let log = self.log.entry(topic.to_string()).or_default();
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
        let record = StoredRecord { offset, ..record };
        let report = DeliveryReport {
            partition: record.partition,
            offset,
        };

        let message = IncomingMessage {
            topic: topic.to_string(),
            partition: record.partition,
            offset,
            key: record.key.clone().map(Bytes::from),
            value: record.value.clone().map(Bytes::from),
        };

        let mut delivered_groups = HashSet::new();
        for consumer in &self.consumers {
            if !consumer.connected.load(Ordering::Acquire)
                || delivered_groups.contains(&consumer.group_id)
                || !consumer.topics.lock().expect("lock poisoned").contains(topic)
            {
                continue;
            }
            if consumer.sender.send(message.clone()).is_ok() {
                delivered_groups.insert(consumer.group_id.clone());
            }
        }

        log.push(record);
        report
    }
}

/// One simulated cluster. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryCluster")
            .field("topics", &state.log.keys().collect::<Vec<_>>())
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

impl MemoryCluster {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Call counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Settings of every client created for this cluster, in creation order.
    #[must_use]
    pub fn client_settings(&self) -> Vec<ClientSettings> {
        self.lock().clients.clone()
    }

    /// Records written to a topic.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.lock().log.get(topic).cloned().unwrap_or_default()
    }

    /// Union of every consumer's subscribed topics.
    #[must_use]
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.lock()
            .consumers
            .iter()
            .flat_map(|c| c.topics.lock().expect("lock poisoned").clone())
            .collect()
    }

    /// Appends a record as an external producer would and delivers it to
    /// subscribed consumers.
    pub fn publish(&self, topic: &str, key: Option<&str>, value: Option<&str>) -> DeliveryReport {
        let record = StoredRecord {
            partition: 0,
            offset: 0,
            key: key.map(str::to_string),
            value: value.map(str::to_string),
            headers: Vec::new(),
        };
        self.lock().append(topic, record)
    }

    /// Makes subsequent consumer and producer connects fail.
    pub fn fail_connections(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Makes subsequent producer connects fail while consumers still connect.
    pub fn fail_producer_connections(&self, fail: bool) {
        self.lock().fail_producer_connect = fail;
    }

    /// Timeout of every batch sent, in send order.
    #[must_use]
    pub fn send_timeouts(&self) -> Vec<Duration> {
        self.lock().send_timeouts.clone()
    }

    /// Makes subsequent sends fail with `message`, or succeed again on `None`.
    pub fn fail_sends(&self, message: Option<&str>) {
        self.lock().fail_send = message.map(str::to_string);
    }

    fn check_connect(&self, cluster: &str) -> PoolResult<()> {
        if self.lock().fail_connect {
            return Err(PoolError::Connect {
                cluster: cluster.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Connector handing out clients backed by [`MemoryCluster`]s.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    clusters: Mutex<BTreeMap<String, MemoryCluster>>,
}

impl MemoryConnector {
    /// Creates a connector with no clusters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cluster with this name, creating it if needed.
    #[must_use]
    pub fn cluster(&self, name: &str) -> MemoryCluster {
        self.clusters
            .lock()
            .expect("lock poisoned")
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl KafkaConnector for MemoryConnector {
    fn client(&self, settings: &ClientSettings) -> PoolResult<Arc<dyn KafkaClient>> {
        if settings.brokers.is_empty() {
            return Err(PoolError::InvalidConfig {
                message: format!("cluster {} has no brokers", settings.cluster),
            });
        }

        let cluster = self.cluster(&settings.cluster);
        {
            let mut state = cluster.lock();
            state.clients.push(settings.clone());
            state.stats.clients += 1;
        }
        Ok(Arc::new(MemoryClient {
            name: settings.cluster.clone(),
            cluster,
        }))
    }
}

struct MemoryClient {
    name: String,
    cluster: MemoryCluster,
}

#[async_trait]
impl KafkaClient for MemoryClient {
    async fn consumer(
        &self,
        group_id: &str,
        _config: &ConsumerConfig,
    ) -> PoolResult<Arc<dyn ConsumerHandle>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(ConsumerShared {
            group_id: group_id.to_string(),
            topics: Mutex::new(BTreeSet::new()),
            connected: AtomicBool::new(false),
            sender,
        });
        self.cluster.lock().consumers.push(Arc::clone(&shared));

        Ok(Arc::new(MemoryConsumer {
            name: self.name.clone(),
            cluster: self.cluster.clone(),
            shared,
            receiver: Mutex::new(Some(receiver)),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }))
    }

    async fn producer(&self, _config: &ProducerConfig) -> PoolResult<Arc<dyn ProducerHandle>> {
        Ok(Arc::new(MemoryProducer {
            name: self.name.clone(),
            cluster: self.cluster.clone(),
            connected: AtomicBool::new(false),
        }))
    }

    async fn list_topics(&self) -> PoolResult<Vec<String>> {
        let mut topics: BTreeSet<String> = self.cluster.lock().log.keys().cloned().collect();
        topics.extend(self.cluster.subscriptions());
        Ok(topics.into_iter().collect())
    }
}

struct MemoryConsumer {
    name: String,
    cluster: MemoryCluster,
    shared: Arc<ConsumerShared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    async fn connect(&self) -> PoolResult<()> {
        tokio::task::yield_now().await;
        self.cluster.check_connect(&self.name)?;
        self.shared.connected.store(true, Ordering::Release);
        self.cluster.lock().stats.consumer_connects += 1;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> PoolResult<()> {
        self.shared
            .topics
            .lock()
            .expect("lock poisoned")
            .extend(topics.iter().cloned());
        self.cluster.lock().stats.subscribe_calls += 1;
        Ok(())
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> PoolResult<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(PoolError::Backend {
                message: format!("consumer of cluster {} is not connected", self.name),
            });
        }

        let Some(mut receiver) = self.receiver.lock().expect("lock poisoned").take() else {
            return Err(PoolError::Backend {
                message: format!("consumer of cluster {} is already running", self.name),
            });
        };

        let shutdown = Arc::clone(&self.shutdown);
        let cluster = self.name.clone();
        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = shutdown.notified() => break,
                    message = receiver.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                handler.handle(message).await;
            }
            debug!(%cluster, "memory consumer stopped");
        });

        *self.task.lock().expect("lock poisoned") = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> PoolResult<()> {
        tokio::task::yield_now().await;
        self.shared.connected.store(false, Ordering::Release);
        self.cluster.lock().stats.consumer_disconnects += 1;

        self.shutdown.notify_one();
        let task = self.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(cluster = %self.name, error = %e, "memory consumer task failed");
            }
        }
        Ok(())
    }
}

struct MemoryProducer {
    name: String,
    cluster: MemoryCluster,
    connected: AtomicBool,
}

#[async_trait]
impl ProducerHandle for MemoryProducer {
    async fn connect(&self) -> PoolResult<()> {
        tokio::task::yield_now().await;
        self.cluster.check_connect(&self.name)?;
        if self.cluster.lock().fail_producer_connect {
            return Err(PoolError::Connect {
                cluster: self.name.clone(),
                message: "producer connection refused".to_string(),
            });
        }
        self.connected.store(true, Ordering::Release);
        self.cluster.lock().stats.producer_connects += 1;
        Ok(())
    }

    async fn send(&self, batch: ProduceBatch) -> PoolResult<Vec<DeliveryReport>> {
        let send_error = |message: String| PoolError::Send {
            cluster: self.name.clone(),
            topic: batch.topic.clone(),
            message,
        };

        if !self.connected.load(Ordering::Acquire) {
            return Err(send_error("producer is not connected".to_string()));
        }

        let mut state = self.cluster.lock();
        if let Some(message) = state.fail_send.clone() {
            return Err(send_error(message));
        }
        state.send_timeouts.push(batch.timeout);

        let reports = batch
            .messages
            .iter()
            .map(|message| {
                let record = StoredRecord {
                    partition: message.partition.unwrap_or(0),
                    offset: 0,
                    key: message.key.clone(),
                    value: message.value.clone(),
                    headers: message.headers.clone(),
                };
                state.append(&batch.topic, record)
            })
            .collect::<Vec<_>>();
        state.stats.messages_sent += reports.len();
        Ok(reports)
    }

    async fn disconnect(&self) -> PoolResult<()> {
        tokio::task::yield_now().await;
        self.connected.store(false, Ordering::Release);
        self.cluster.lock().stats.producer_disconnects += 1;
        Ok(())
    }
}
