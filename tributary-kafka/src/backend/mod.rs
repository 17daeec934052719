//! Client backends implementing [`KafkaConnector`](crate::client::KafkaConnector).

pub mod memory;
pub mod rdkafka;

pub use self::memory::{MemoryCluster, MemoryConnector, MemoryStats, StoredRecord};
pub use self::rdkafka::RdKafkaConnector;
