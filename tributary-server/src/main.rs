//! Tributary server binary.
//!
//! Loads a pool configuration, connects every configured Kafka cluster and
//! keeps consuming until the process is told to stop.
//!
//! ```bash
//! tributary-server --config config/tributary.toml --subscribe main:orders
//! ```
//!
//! SIGINT, SIGTERM and SIGUSR2 disconnect the pool before exiting. So does a
//! panic on any thread, including one raised inside a subscribed callback even
//! though the consumer survives it. Whatever triggered the shutdown, the exit
//! status is 0 when every client disconnected cleanly and 1 otherwise.
//!
//! Use `--backend memory` to run against the in-process broker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tributary_kafka::{
    callback, CallbackError, KafkaConnector, KafkaPool, MemoryConnector, PoolConfig, PoolError,
    PoolEvent, PoolResult, RdKafkaConnector, StartOutcome, SubscribeOptions, Supervisor,
};

/// Kafka client implementation.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Backend {
    /// librdkafka through `rdkafka`.
    #[default]
    Rdkafka,
    /// In-process broker, for local development.
    Memory,
}

/// Multi-cluster Kafka consumer and producer pool.
#[derive(Parser, Debug)]
#[command(name = "tributary-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML pool configuration.
    #[arg(long, default_value = "config/tributary.toml")]
    config: PathBuf,

    /// Kafka client implementation.
    #[arg(long, value_enum, default_value = "rdkafka")]
    backend: Backend,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Log every message of a topic, in format `cluster:topic`.
    /// Can be specified multiple times.
    #[arg(long = "subscribe", value_parser = parse_subscription)]
    subscriptions: Vec<Subscription>,
}

/// A topic to log once the pool is connected.
#[derive(Debug, Clone)]
struct Subscription {
    /// Cluster name.
    cluster: String,
    /// Topic name.
    topic: String,
}

/// Parses a subscription in format `cluster:topic`.
fn parse_subscription(s: &str) -> Result<Subscription, String> {
    let Some((cluster, topic)) = s.split_once(':') else {
        return Err(format!(
            "invalid subscription format '{s}', expected 'cluster:topic'"
        ));
    };

    if cluster.is_empty() {
        return Err(format!("empty cluster in subscription '{s}'"));
    }
    if topic.is_empty() {
        return Err(format!("empty topic in subscription '{s}'"));
    }

    Ok(Subscription {
        cluster: cluster.to_string(),
        topic: topic.to_string(),
    })
}

/// Builds the supervisor, registering a logging callback per subscription.
fn build_supervisor(pool: Arc<KafkaPool>, subscriptions: Vec<Subscription>) -> Supervisor {
    let subscriptions = Arc::new(subscriptions);
    Supervisor::new(pool).on_topics_ready(move |pool| {
        let subscriptions = Arc::clone(&subscriptions);
        async move {
            for subscription in subscriptions.iter() {
                let cluster = subscription.cluster.clone();
                let topic = subscription.topic.clone();
                let log = callback(move |key, value| {
                    let cluster = cluster.clone();
                    let topic = topic.clone();
                    async move {
                        info!(%cluster, %topic, ?key, ?value, "message received");
                        Ok::<_, CallbackError>(())
                    }
                });
                pool.subscribe_topic(
                    &subscription.cluster,
                    log,
                    SubscribeOptions::topic(&subscription.topic),
                )
                .await?;
            }
            Ok::<_, PoolError>(())
        }
    })
}

/// Process exit status for the outcome of the final disconnect.
fn exit_code(disconnect: &PoolResult<()>) -> i32 {
    match disconnect {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Resolves on the first termination signal or panic.
async fn wait_for_shutdown(panicked: Arc<Notify>) -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user2 = signal(SignalKind::user_defined2())?;

    let reason = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = user2.recv() => "SIGUSR2",
        () = panicked.notified() => "panic",
    };
    Ok(reason)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = PoolConfig::from_file(&args.config)?;
    info!(
        config = %args.config.display(),
        backend = ?args.backend,
        enabled = config.enabled,
        debug = config.debug,
        subscriptions = args.subscriptions.len(),
        "Starting tributary server"
    );

    let connector: Arc<dyn KafkaConnector> = match args.backend {
        Backend::Rdkafka => Arc::new(RdKafkaConnector::new()),
        Backend::Memory => Arc::new(MemoryConnector::new()),
    };
    let pool = Arc::new(KafkaPool::new(config, connector));
    let supervisor = build_supervisor(Arc::clone(&pool), args.subscriptions);

    // Wake the shutdown path if any thread panics.
    let panicked = Arc::new(Notify::new());
    let panic_notify = Arc::clone(&panicked);
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        panic_notify.notify_one();
    }));

    let mut events = pool.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PoolEvent::TopicsReady { clusters } = event {
                info!(clusters, "topics ready");
            }
        }
    });

    match supervisor.start().await {
        Ok(StartOutcome::Running {
            clusters,
            consumers,
        }) => info!(clusters, consumers, "Kafka pool running"),
        Ok(outcome) => warn!(?outcome, "Kafka pool not started"),
        Err(e) => {
            error!(error = %e, "Kafka pool failed to start");
            if let Err(e) = supervisor.stop().await {
                error!(error = %e, "Kafka pool failed to disconnect");
            }
            std::process::exit(1);
        }
    }

    let reason = wait_for_shutdown(Arc::clone(&panicked)).await?;
    info!(%reason, "Shutting down");

    let disconnect = supervisor.stop().await;
    match &disconnect {
        Ok(()) => info!(%reason, "Kafka pool disconnected"),
        Err(e) => error!(error = %e, "Kafka pool failed to disconnect"),
    }
    std::process::exit(exit_code(&disconnect));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription() {
        let subscription = parse_subscription("main:orders").unwrap();
        assert_eq!(subscription.cluster, "main");
        assert_eq!(subscription.topic, "orders");

        let nested = parse_subscription("main:orders:v2").unwrap();
        assert_eq!(nested.topic, "orders:v2");
    }

    #[test]
    fn test_parse_subscription_rejects_bad_input() {
        assert!(parse_subscription("orders").is_err());
        assert!(parse_subscription(":orders").is_err());
        assert!(parse_subscription("main:").is_err());
    }

    #[test]
    fn test_shipped_config_is_usable() {
        let config = PoolConfig::from_toml(include_str!("../config/tributary.toml")).unwrap();
        assert!(config.enabled);
        assert!(config.is_usable());

        let clusters = config.clusters().unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters["main"].consumer.is_some());
        assert!(clusters["audit"].consumer.is_none());
        assert!(clusters["audit"].connection.ssl.enabled());
    }

    #[test]
    fn test_exit_code_follows_disconnect_only() {
        assert_eq!(exit_code(&Ok(())), 0);

        let failed = Err(PoolError::Disconnect {
            cluster: "main".to_string(),
            message: "broker gone".to_string(),
        });
        assert_eq!(exit_code(&failed), 1);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "tributary-server",
            "--config",
            "pool.toml",
            "--backend",
            "memory",
            "--subscribe",
            "main:orders",
            "--subscribe",
            "audit:events",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("pool.toml"));
        assert!(matches!(args.backend, Backend::Memory));
        assert_eq!(args.log_level, Level::INFO);
        assert_eq!(args.subscriptions.len(), 2);
        assert_eq!(args.subscriptions[1].cluster, "audit");
    }
}
