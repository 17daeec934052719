//! Pool lifecycle.
//!
//! The owning process calls [`Supervisor::start`] once it has finished its own
//! initialization and [`Supervisor::stop`] when it shuts down. Signal handling
//! belongs to the process entry point, not here.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::error::PoolResult;
use crate::events::PoolEvent;
use crate::pool::KafkaPool;

/// Hook run after every cluster is connected and before consumers start, so
/// subscriptions made here see every message.
pub type ReadyHook = Box<dyn Fn(Arc<KafkaPool>) -> BoxFuture<'static, PoolResult<()>> + Send + Sync>;

/// What [`Supervisor::start`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The pool is disabled in configuration.
    Disabled,
    /// The configuration is incomplete; nothing was connected.
    Misconfigured,
    /// Clusters are connected and consumers are running.
    Running {
        /// Registered clusters.
        clusters: usize,
        /// Consumers started.
        consumers: usize,
    },
}

/// Drives a [`KafkaPool`] through startup and shutdown.
pub struct Supervisor {
    pool: Arc<KafkaPool>,
    ready_hooks: Vec<ReadyHook>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pool", &self.pool)
            .field("ready_hooks", &self.ready_hooks.len())
            .finish()
    }
}

impl Supervisor {
    /// Creates a supervisor for `pool`.
    #[must_use]
    pub fn new(pool: Arc<KafkaPool>) -> Self {
        Self {
            pool,
            ready_hooks: Vec::new(),
        }
    }

    /// Adds a hook run once the clusters are connected.
    #[must_use]
    pub fn on_topics_ready<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<KafkaPool>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = PoolResult<()>> + Send + 'static,
    {
        self.ready_hooks.push(Box::new(move |pool| hook(pool).boxed()));
        self
    }

    /// The supervised pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<KafkaPool> {
        &self.pool
    }

    /// Connects every cluster, runs the ready hooks, announces
    /// [`PoolEvent::TopicsReady`] and starts the consumers.
    ///
    /// A disabled or incomplete configuration is logged and leaves the pool
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns connection failures, ready hook failures, and consumers that
    /// fail to start.
    pub async fn start(&self) -> PoolResult<StartOutcome> {
        let config = self.pool.config();
        if !config.enabled {
            if config.debug {
                warn!("Kafka module is disabled");
            }
            return Ok(StartOutcome::Disabled);
        }

        if !self.pool.is_usable() {
            error!("Kafka module is not properly configured, it cannot be used");
            return Ok(StartOutcome::Misconfigured);
        }

        self.pool.connect_all().await?;

        for hook in &self.ready_hooks {
            hook(Arc::clone(&self.pool)).await?;
        }

        let clusters = self.pool.registry().len().await;
        self.pool.emit(PoolEvent::TopicsReady { clusters });
        info!(
            pool_size = clusters,
            "Kafka: connected to all the clusters and topics"
        );

        let consumers = self.pool.run_consumers().await?;
        Ok(StartOutcome::Running {
            clusters,
            consumers,
        })
    }

    /// Disconnects the pool.
    ///
    /// # Errors
    ///
    /// Returns the first handle that fails to disconnect.
    pub async fn stop(&self) -> PoolResult<()> {
        self.pool.disconnect_all().await
    }
}
