//! Tributary Kafka: a multi-cluster Kafka pool for host processes.
//!
//! A process declares any number of named clusters in configuration. Each
//! cluster gets at most one consumer and one producer, both owned by a
//! [`KafkaPool`]. Host code subscribes async callbacks to topics and sends
//! message batches by cluster name; the pool routes every consumed message to
//! the callbacks registered for its topic.
//!
//! # Lifecycle
//!
//! 1. [`Supervisor::start`] checks the configuration, connects every cluster,
//!    runs the ready hooks (where subscriptions belong), and starts consuming.
//! 2. Callbacks run concurrently per message. A failing callback is reported
//!    through [`ErrorReporter`] as a [`PoolEvent::ConsumeError`].
//! 3. [`Supervisor::stop`] disconnects consumers and then flushes producers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tributary_kafka::{callback, KafkaPool, PoolConfig, RdKafkaConnector, Supervisor};
//!
//! let config = PoolConfig::from_file("tributary.toml")?;
//! let pool = Arc::new(KafkaPool::new(config, Arc::new(RdKafkaConnector::new())));
//!
//! let supervisor = Supervisor::new(pool).on_topics_ready(|pool| async move {
//!     let print = callback(|key, value| async move {
//!         println!("{key:?} => {value:?}");
//!         Ok(())
//!     });
//!     pool.subscribe_topic("main", print, "orders".into()).await
//! });
//!
//! supervisor.start().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod dispatch;
mod events;
mod registry;
mod reporting;

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod supervisor;

pub use backend::{MemoryCluster, MemoryConnector, MemoryStats, RdKafkaConnector, StoredRecord};
pub use client::{
    ClientSettings, ConsumerHandle, DeliveryReport, IncomingMessage, KafkaClient, KafkaConnector,
    MessageHandler, OutgoingMessage, ProduceBatch, ProducerHandle,
};
pub use config::{
    ClientLogLevel, ClusterConfig, ConfigError, ConnectionConfig, ConsumerConfig, OffsetReset,
    PoolConfig, ProducerConfig, SaslConfig, SaslMechanism, TlsSetting,
};
pub use dispatch::{DispatchOutcome, TopicDispatcher};
pub use error::{CallbackError, PoolError, PoolResult};
pub use events::{EventBus, PoolEvent};
pub use pool::{KafkaPool, SendOptions, SubscribeOptions};
pub use registry::{callback, ClusterEntry, ClusterRegistry, ConsumerEntry, ProducerEntry, TopicCallback, TopicTable};
pub use reporting::{ConsumeErrorMetadata, ConsumeErrorRecord, DispatchContext, ErrorReporter};
pub use supervisor::{ReadyHook, StartOutcome, Supervisor};
