use std::sync::Arc;
use std::time::Duration;

use mooring_core::error::PoolError;
use mooring_core::traits::{ConnectionPool, SharedPool};
use mooring_runtime::{
    fake_pool, DependencyResolver, FakeConnection, LifecycleController, RuntimeConfig,
    TestHarness,
};

async fn resolver() -> Arc<DependencyResolver> {
    let registry = LifecycleController::without_backends(RuntimeConfig::empty())
        .with_pool("database", || async {
            Ok::<_, PoolError>(Arc::new(fake_pool("database", 4)) as SharedPool<FakeConnection>)
        })
        .start()
        .await
        .unwrap();
    Arc::new(DependencyResolver::new(registry))
}

/// What a request handler looks like: it only knows the backend name.
async fn handler(resolver: &DependencyResolver) -> Result<u64, PoolError> {
    resolver
        .with_pool("database", |conn: &mut FakeConnection| {
            Box::pin(async move {
                conn.execute("SELECT 1");
                Ok(conn.serial)
            })
        })
        .await
}

#[tokio::test]
async fn test_harness_substitutes_and_restores() {
    let resolver = resolver().await;
    let real = resolver.resolve::<FakeConnection>("database").unwrap();

    {
        let mut harness = TestHarness::new(Arc::clone(&resolver));
        let fake = harness.fake("database", 1);

        assert_eq!(handler(&resolver).await, Ok(1));
        assert_eq!(fake.manager().created(), 1);
        assert_eq!(real.stats().created, 0);
    }

    assert!(!resolver.has_override("database"));
    assert_eq!(handler(&resolver).await, Ok(1));
    assert_eq!(real.stats().created, 1);
}

#[tokio::test]
async fn test_nested_harnesses_restore_in_reverse() {
    let resolver = resolver().await;
    let outer_pool = fake_pool("outer", 1);

    let mut outer = TestHarness::new(Arc::clone(&resolver));
    outer.register(
        "database",
        Arc::new(outer_pool.clone()) as SharedPool<FakeConnection>,
    );

    {
        let mut inner = TestHarness::new(Arc::clone(&resolver));
        let inner_pool = inner.fake("database", 1);
        inner.fake("database", 1);
        handler(&resolver).await.unwrap();
        assert_eq!(inner_pool.manager().created(), 0);
    }

    // The inner harness put the outer override back, not the registry entry.
    handler(&resolver).await.unwrap();
    assert_eq!(outer_pool.manager().created(), 1);

    drop(outer);
    assert!(!resolver.has_override("database"));
}

#[tokio::test(start_paused = true)]
async fn test_fake_pool_exhausts_like_a_real_one() {
    let resolver = resolver().await;
    let mut harness = TestHarness::new(Arc::clone(&resolver));
    harness.fake("database", 1);

    let held = resolver.lease::<FakeConnection>("database").await.unwrap();
    match handler(&resolver).await {
        Err(PoolError::Exhausted { capacity, waited, .. }) => {
            assert_eq!(capacity, 1);
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    drop(held);
    assert!(handler(&resolver).await.is_ok());
}

#[tokio::test]
async fn test_failed_handler_discards_its_connection() {
    let resolver = resolver().await;
    let mut harness = TestHarness::new(Arc::clone(&resolver));
    let fake = harness.fake("database", 1);

    let result: Result<(), PoolError> = resolver
        .with_pool("database", |_conn: &mut FakeConnection| {
            Box::pin(async move { Err(PoolError::ConnectionLost) })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(fake.manager().closed(), 1);

    assert_eq!(handler(&resolver).await, Ok(2));
    assert_eq!(fake.stats().outstanding, 0);
}

#[tokio::test]
async fn test_unknown_backend_is_not_registered() {
    let resolver = resolver().await;
    assert_eq!(
        resolver.lease::<FakeConnection>("queue").await.unwrap_err(),
        PoolError::NotRegistered("queue".into())
    );
}
