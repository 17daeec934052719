//! Startup and shutdown through [`Supervisor`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tributary_kafka::{
    callback, CallbackError, ClusterConfig, ConnectionConfig, ConsumerConfig, KafkaPool,
    MemoryConnector, PoolConfig, PoolError, PoolEvent, ProducerConfig, StartOutcome, Supervisor,
};

const WAIT: Duration = Duration::from_secs(2);

fn config() -> PoolConfig {
    let cluster = |broker: &str| {
        ClusterConfig::new(ConnectionConfig::new([broker]))
            .with_consumer(ConsumerConfig::default())
            .with_producer(ProducerConfig::default())
    };
    PoolConfig::new("cms", "cms-group")
        .with_debug(false)
        .with_cluster("main", cluster("main:9092"))
        .with_cluster("audit", cluster("audit:9092"))
}

fn supervisor(config: PoolConfig) -> (Supervisor, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new());
    let pool = Arc::new(KafkaPool::new(config, Arc::clone(&connector) as _));
    (Supervisor::new(pool), connector)
}

#[tokio::test]
async fn test_disabled_pool_does_nothing() {
    let (supervisor, connector) = supervisor(config().with_enabled(false).with_debug(true));

    let outcome = supervisor.start().await.unwrap();

    assert_eq!(outcome, StartOutcome::Disabled);
    assert!(supervisor.pool().registry().is_empty().await);
    assert_eq!(connector.cluster("main").stats().clients, 0);
}

#[tokio::test]
async fn test_misconfigured_pool_does_nothing() {
    let mut config = config();
    config.group_id = None;
    let (supervisor, connector) = supervisor(config);

    let outcome = supervisor.start().await.unwrap();

    assert_eq!(outcome, StartOutcome::Misconfigured);
    assert!(supervisor.pool().registry().is_empty().await);
    assert_eq!(connector.cluster("main").stats().clients, 0);
}

#[tokio::test]
async fn test_start_connects_and_runs_consumers() {
    let (supervisor, connector) = supervisor(config());
    let mut events = supervisor.pool().subscribe_events();

    let outcome = supervisor.start().await.unwrap();

    assert_eq!(
        outcome,
        StartOutcome::Running {
            clusters: 2,
            consumers: 2
        }
    );
    assert_eq!(connector.cluster("main").stats().consumer_connects, 1);
    assert_eq!(connector.cluster("audit").stats().producer_connects, 1);

    match events.try_recv().unwrap() {
        PoolEvent::TopicsReady { clusters } => assert_eq!(clusters, 2),
        other => panic!("expected topics ready, got {other:?}"),
    }

    supervisor.stop().await.unwrap();
    assert_eq!(connector.cluster("main").stats().consumer_disconnects, 1);
    assert_eq!(connector.cluster("main").stats().producer_disconnects, 1);
}

#[tokio::test]
async fn test_ready_hook_subscriptions_receive_messages() {
    let counter = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&counter);
    let (supervisor, connector) = supervisor(config());
    let supervisor = supervisor.on_topics_ready(move |pool| {
        let counter = Arc::clone(&hook_counter);
        async move {
            let cb = callback(move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CallbackError>(())
                }
            });
            pool.subscribe_topic("main", cb, "orders".into()).await
        }
    });

    supervisor.start().await.unwrap();
    connector.cluster("main").publish("orders", None, Some("created"));

    let delivered = timeout(WAIT, async {
        while counter.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_ready_hook_failure_stops_startup() {
    let (supervisor, connector) = supervisor(config());
    let supervisor = supervisor.on_topics_ready(|_pool| async {
        Err::<(), _>(PoolError::InvalidConfig {
            message: "hook refused".to_string(),
        })
    });

    let err = supervisor.start().await.unwrap_err();

    assert!(matches!(err, PoolError::InvalidConfig { .. }));
    assert_eq!(supervisor.pool().registry().len().await, 2);
    assert_eq!(connector.cluster("main").stats().consumer_connects, 1);
}

#[tokio::test]
async fn test_connect_failure_fails_start() {
    let (supervisor, connector) = supervisor(config());
    connector.cluster("audit").fail_connections(true);

    let err = supervisor.start().await.unwrap_err();

    assert!(err.is_connect());
    assert_eq!(err.cluster(), Some("audit"));
}

#[tokio::test]
async fn test_stop_before_start() {
    let (supervisor, connector) = supervisor(config());
    supervisor.stop().await.unwrap();
    assert_eq!(connector.cluster("main").stats().consumer_disconnects, 0);
}
