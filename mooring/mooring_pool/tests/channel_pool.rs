mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use mooring_core::error::PoolError;
use mooring_core::traits::ConnectionPool;
use mooring_pool::{ChannelPool, ChannelPoolOptions, RetryPolicy};

use common::{init_tracing, FakeBroker, FakeChannel};

fn channel_pool(connections: usize, channels: usize) -> (ChannelPool<FakeBroker>, FakeBroker) {
    patient_pool(connections, channels, 50, RetryPolicy::default())
}

fn patient_pool(
    connections: usize,
    channels: usize,
    acquire_ms: u64,
    retry: RetryPolicy,
) -> (ChannelPool<FakeBroker>, FakeBroker) {
    init_tracing();
    let broker = FakeBroker::default();
    let options = ChannelPoolOptions {
        max_connections: connections,
        channels_per_connection: channels,
        acquire_timeout: Duration::from_millis(acquire_ms),
        drain_timeout: Duration::from_millis(200),
    };
    let pool = ChannelPool::new("broker", broker.clone(), options, retry).unwrap();
    (pool, broker)
}

#[tokio::test]
async fn test_connections_open_lazily() {
    let (pool, broker) = channel_pool(2, 2);
    assert_eq!(pool.connection_count(), 0);

    let lease = pool.acquire().await.unwrap();
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(lease.get().unwrap().connection, 1);
    drop(lease);

    // The returned channel is reused rather than opening another.
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.get().unwrap().number, 1);
    assert_eq!(broker.events(), vec!["connect 1"]);
}

#[tokio::test(start_paused = true)]
async fn test_channel_capacity_is_bounded() {
    let (pool, _) = channel_pool(2, 2);

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.connection_count(), 2);

    let per_connection = |serial| {
        held.iter()
            .filter(|l| l.get().unwrap().connection == serial)
            .count()
    };
    assert_eq!(per_connection(1), 2);
    assert_eq!(per_connection(2), 2);

    match pool.acquire().await.unwrap_err() {
        PoolError::Exhausted { capacity, .. } => assert_eq!(capacity, 4),
        other => panic!("expected Exhausted, got {other:?}"),
    }

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 4);
    assert_eq!(stats.capacity, 4);
}

#[tokio::test]
async fn test_waiter_gets_returned_channel() {
    let (pool, _) = channel_pool(1, 1);
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|l| *l.get().unwrap()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(held);

    let channel = waiter.await.unwrap().unwrap();
    assert_eq!((channel.connection, channel.number), (1, 1));
}

#[tokio::test]
async fn test_dead_connection_invalidates_its_channels() {
    let (pool, broker) = channel_pool(2, 1);
    let stale = pool.acquire().await.unwrap();
    assert!(stale.is_valid());

    broker.kill(1);
    assert_eq!(stale.get(), Err(PoolError::ConnectionLost));
    assert!(!stale.is_valid());

    // A fresh channel comes from a new connection.
    let fresh = pool.acquire().await.unwrap();
    assert_eq!(fresh.get().unwrap().connection, 2);

    drop(stale);
    assert!(broker
        .events()
        .iter()
        .any(|e| e == "close channel 1.1"));
}

#[tokio::test]
async fn test_failed_channel_open_retires_connection() {
    let (pool, broker) = channel_pool(1, 2);
    let first = pool.acquire().await.unwrap();
    broker.kill(1);

    // Connection 1 cannot open a second channel, so it is retired and
    // replaced.
    let second = pool.acquire().await.unwrap();
    assert_eq!(second.get().unwrap().connection, 2);
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(first.get(), Err(PoolError::ConnectionLost));
    assert!(broker.events().contains(&"close connection 1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_broker_outage_is_reported() {
    let (pool, broker) = patient_pool(2, 2, 1_000, RetryPolicy::default());
    broker.refuse_connections.store(true, Ordering::SeqCst);

    match pool.acquire().await.unwrap_err() {
        PoolError::BrokerUnavailable { pool, attempts, .. } => {
            assert_eq!(pool, "broker");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected BrokerUnavailable, got {other:?}"),
    }
    assert_eq!(pool.connection_count(), 0);

    broker.refuse_connections.store(false, Ordering::SeqCst);
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_transient_channel_failure_is_retried_in_place() {
    let (pool, broker) = patient_pool(1, 2, 1_000, RetryPolicy::default());
    let busy = pool.acquire().await.unwrap();

    broker.fail_channels(1);
    let second = pool.acquire().await.unwrap();

    assert_eq!(second.get().unwrap().connection, 1);
    assert!(busy.is_valid());
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(broker.events(), vec!["connect 1"]);
}

#[tokio::test]
async fn test_failed_open_on_healthy_connection_keeps_its_channels() {
    let (pool, broker) = patient_pool(1, 2, 1_000, RetryPolicy::none());
    let busy = pool.acquire().await.unwrap();

    // No retry inside the connection; the pool makes another pass instead.
    broker.fail_channels(1);
    let second = pool.acquire().await.unwrap();

    assert_eq!(*second.get().unwrap(), FakeChannel { connection: 1, number: 2 });
    assert!(busy.is_valid());
    assert_eq!(busy.get().unwrap().connection, 1);
    assert!(!broker
        .events()
        .iter()
        .any(|e| e.starts_with("close connection")));
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_waits_on_open_connection() {
    let (pool, broker) = patient_pool(2, 1, 500, RetryPolicy::default());
    let held = pool.acquire().await.unwrap();
    broker.refuse_connections.store(true, Ordering::SeqCst);

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
    });

    let lease = pool.acquire().await.unwrap();
    assert_eq!(*lease.get().unwrap(), FakeChannel { connection: 1, number: 1 });
    assert_eq!(pool.connection_count(), 1);
    releaser.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_with_busy_connection_ends_exhausted() {
    let (pool, broker) = patient_pool(2, 1, 200, RetryPolicy::none());
    let _held = pool.acquire().await.unwrap();
    broker.refuse_connections.store(true, Ordering::SeqCst);

    match pool.acquire().await.unwrap_err() {
        PoolError::Exhausted { waited, .. } => assert!(waited >= Duration::from_millis(200)),
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(pool.stats().waiters, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_channel_open_is_bounded_by_acquire_timeout() {
    let (pool, broker) = patient_pool(1, 1, 50, RetryPolicy::none());
    broker.delay_channels(Duration::from_secs(10));

    let started = tokio::time::Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = pool.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.outstanding, 0);
}

#[tokio::test]
async fn test_close_closes_channels_before_connections() {
    let (pool, broker) = channel_pool(2, 1);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    drop((a, b));

    let outcome = pool.close().await;
    assert_eq!(outcome.forced, 0);
    assert_eq!(pool.connection_count(), 0);

    let events = broker.events();
    let last_channel = events
        .iter()
        .rposition(|e| e.starts_with("close channel"))
        .unwrap();
    let first_connection = events
        .iter()
        .position(|e| e.starts_with("close connection"))
        .unwrap();
    assert!(last_channel < first_connection);

    assert_eq!(
        pool.acquire().await.unwrap_err(),
        PoolError::Closed("broker".into())
    );
    assert!(pool.close().await.already_closed);
}

#[tokio::test(start_paused = true)]
async fn test_close_revokes_leaked_channels() {
    let (pool, _) = channel_pool(1, 2);
    let leaked = pool.acquire().await.unwrap();

    let outcome = pool.close_within(Duration::from_millis(30)).await;
    assert_eq!(outcome.outstanding_at_start, 1);
    assert_eq!(outcome.forced, 1);
    assert_eq!(outcome.leaked, vec![leaked.id()]);
    assert!(!leaked.is_valid());
}
