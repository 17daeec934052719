//! Cluster registry.
//!
//! One entry per configured cluster, created once by
//! [`KafkaPool::connect_all`](crate::KafkaPool::connect_all) and kept until
//! the process exits. Entries are never replaced.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock as AsyncRwLock;

use crate::client::{ConsumerHandle, KafkaClient, ProducerHandle};
use crate::error::CallbackError;

/// A host callback invoked with the decoded key and value of each message on
/// the topics it was registered for.
pub type TopicCallback = Arc<
    dyn Fn(Option<String>, Option<String>) -> BoxFuture<'static, Result<(), CallbackError>>
        + Send
        + Sync,
>;

/// Wraps an async closure into a [`TopicCallback`].
pub fn callback<F, Fut>(f: F) -> TopicCallback
where
    F: Fn(Option<String>, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    Arc::new(move |key, value| f(key, value).boxed())
}

/// Topic name to the callbacks registered for it, in registration order.
#[derive(Default)]
pub struct TopicTable {
    topics: RwLock<HashMap<String, Vec<TopicCallback>>>,
}

impl TopicTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a callback to a topic, creating the topic's list on first use.
    /// The same callback may be registered more than once.
    pub fn register(&self, topic: &str, callback: TopicCallback) {
        let mut topics = self.topics.write().expect("lock poisoned");
        topics.entry(topic.to_string()).or_default().push(callback);
    }

    /// Snapshot of the callbacks for a topic. Empty if the topic was never
    /// subscribed.
    #[must_use]
    pub fn callbacks(&self, topic: &str) -> Vec<TopicCallback> {
        let topics = self.topics.read().expect("lock poisoned");
        topics.get(topic).cloned().unwrap_or_default()
    }

    /// Returns true if the topic has been subscribed.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().expect("lock poisoned").contains_key(topic)
    }

    /// Number of callbacks registered for a topic.
    #[must_use]
    pub fn callback_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .expect("lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Subscribed topic names, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .topics
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for TopicTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.read().expect("lock poisoned");
        let mut map = f.debug_map();
        for (topic, callbacks) in topics.iter() {
            map.entry(topic, &callbacks.len());
        }
        map.finish()
    }
}

/// A connected consumer and its topic table.
#[derive(Clone)]
pub struct ConsumerEntry {
    /// Consumer handle.
    pub instance: Arc<dyn ConsumerHandle>,
    /// Callbacks per subscribed topic.
    pub topics: Arc<TopicTable>,
}

/// A connected producer and its default send timeout.
#[derive(Clone)]
pub struct ProducerEntry {
    /// Producer handle.
    pub instance: Arc<dyn ProducerHandle>,
    /// Timeout used when a send does not specify one.
    pub send_timeout: Duration,
}

/// Everything the pool holds for one cluster.
#[derive(Clone)]
pub struct ClusterEntry {
    /// Cluster name.
    pub name: String,
    /// Client used to build the consumer and producer.
    pub client: Arc<dyn KafkaClient>,
    /// Consumer, if the cluster has consumer settings.
    pub consumer: Option<ConsumerEntry>,
    /// Producer, if the cluster has producer settings.
    pub producer: Option<ProducerEntry>,
}

impl fmt::Debug for ClusterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEntry")
            .field("name", &self.name)
            .field("consumer", &self.consumer.as_ref().map(|c| &c.topics))
            .field("producer", &self.producer.is_some())
            .finish_non_exhaustive()
    }
}

/// Cluster name to cluster entry.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    entries: AsyncRwLock<BTreeMap<String, ClusterEntry>>,
}

impl ClusterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the cluster is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Registers an entry. Returns false, leaving the existing entry in place,
    /// if the name is already taken.
    pub async fn insert(&self, entry: ClusterEntry) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.name) {
            return false;
        }
        entries.insert(entry.name.clone(), entry);
        true
    }

    /// Returns a copy of the entry for a cluster.
    pub async fn get(&self, name: &str) -> Option<ClusterEntry> {
        self.entries.read().await.get(name).cloned()
    }

    /// Number of registered clusters.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if no cluster is registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Registered cluster names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Every registered consumer, by cluster name.
    pub async fn consumers(&self) -> Vec<(String, ConsumerEntry)> {
        self.entries
            .read()
            .await
            .values()
            .filter_map(|entry| {
                entry
                    .consumer
                    .clone()
                    .map(|consumer| (entry.name.clone(), consumer))
            })
            .collect()
    }

    /// Every registered producer, by cluster name.
    pub async fn producers(&self) -> Vec<(String, ProducerEntry)> {
        self.entries
            .read()
            .await
            .values()
            .filter_map(|entry| {
                entry
                    .producer
                    .clone()
                    .map(|producer| (entry.name.clone(), producer))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryConnector;
    use crate::client::{ClientSettings, KafkaConnector};
    use crate::config::{ClientLogLevel, ConnectionConfig};

    fn noop() -> TopicCallback {
        callback(|_, _| async { Ok::<_, CallbackError>(()) })
    }

    fn entry(name: &str) -> ClusterEntry {
        let connection = ConnectionConfig::new(["memory:9092"]);
        let settings = ClientSettings::new(name, "cms", &connection, ClientLogLevel::Error);
        ClusterEntry {
            name: name.to_string(),
            client: MemoryConnector::new().client(&settings).unwrap(),
            consumer: None,
            producer: None,
        }
    }

    #[test]
    fn test_topic_table_accumulates() {
        let table = TopicTable::new();
        assert!(!table.contains("orders"));
        assert!(table.callbacks("orders").is_empty());

        let cb = noop();
        table.register("orders", Arc::clone(&cb));
        table.register("orders", cb);
        table.register("invoices", noop());

        assert!(table.contains("orders"));
        assert_eq!(table.callback_count("orders"), 2);
        assert_eq!(table.callbacks("orders").len(), 2);
        assert_eq!(table.topics(), vec!["invoices".to_string(), "orders".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_insert_once() {
        let registry = ClusterRegistry::new();
        assert!(registry.is_empty().await);

        assert!(registry.insert(entry("main")).await);
        assert!(!registry.insert(entry("main")).await);
        assert!(registry.insert(entry("audit")).await);

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.names().await, vec!["audit".to_string(), "main".to_string()]);
        assert!(registry.contains("main").await);
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_registry_without_handles() {
        let registry = ClusterRegistry::new();
        registry.insert(entry("main")).await;

        assert!(registry.consumers().await.is_empty());
        assert!(registry.producers().await.is_empty());
    }
}
