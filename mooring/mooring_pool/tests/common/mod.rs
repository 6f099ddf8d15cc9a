//! In-memory backends shared by the pool integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mooring_core::error::PoolError;
use mooring_core::traits::{BrokerManager, Manager};

static INIT: Once = Once::new();

/// Route tracing output to the test harness when RUST_LOG is set.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A counter-backed manager whose resources are plain serial numbers.
#[derive(Clone, Default)]
pub struct CountingManager {
    pub state: Arc<CountingState>,
}

#[derive(Default)]
pub struct CountingState {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    /// Number of upcoming create calls that fail.
    pub fail_next: AtomicU32,
    /// Resources with a serial at or below this are reported unhealthy.
    pub unhealthy_up_to: AtomicUsize,
}

impl CountingManager {
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Manager for CountingManager {
    type Resource = usize;

    async fn create(&self) -> Result<usize, PoolError> {
        let failing = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PoolError::Factory("connection refused".into()));
        }
        Ok(self.state.created.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn is_healthy(&self, resource: &usize) -> bool {
        *resource > self.state.unhealthy_up_to.load(Ordering::SeqCst)
    }

    fn close(&self, _resource: usize) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A fake broker connection that can be killed from the outside.
pub struct FakeConnection {
    pub serial: usize,
    pub alive: AtomicBool,
    pub next_channel: AtomicU32,
}

/// A channel number on a fake connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeChannel {
    pub connection: usize,
    pub number: u32,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    pub connections: Arc<Mutex<Vec<Arc<FakeConnection>>>>,
    pub refuse_connections: Arc<AtomicBool>,
    /// Number of upcoming channel opens that fail on a live connection.
    pub fail_channels: Arc<AtomicU32>,
    /// Channel opens hang for this long before completing.
    pub channel_delay: Arc<Mutex<Option<Duration>>>,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl FakeBroker {
    pub fn connection(&self, serial: usize) -> Arc<FakeConnection> {
        Arc::clone(&self.connections.lock()[serial - 1])
    }

    pub fn kill(&self, serial: usize) {
        self.connection(serial).alive.store(false, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn fail_channels(&self, n: u32) {
        self.fail_channels.store(n, Ordering::SeqCst);
    }

    pub fn delay_channels(&self, delay: Duration) {
        *self.channel_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl BrokerManager for FakeBroker {
    type Connection = Arc<FakeConnection>;
    type Channel = FakeChannel;

    async fn connect(&self) -> Result<Arc<FakeConnection>, PoolError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(PoolError::Factory("broker refused connection".into()));
        }
        let mut connections = self.connections.lock();
        let conn = Arc::new(FakeConnection {
            serial: connections.len() + 1,
            alive: AtomicBool::new(true),
            next_channel: AtomicU32::new(1),
        });
        connections.push(Arc::clone(&conn));
        self.events.lock().push(format!("connect {}", conn.serial));
        Ok(conn)
    }

    async fn open_channel(&self, connection: &Arc<FakeConnection>) -> Result<FakeChannel, PoolError> {
        if !connection.alive.load(Ordering::SeqCst) {
            return Err(PoolError::Factory("connection reset".into()));
        }
        let delay = *self.channel_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PoolError::Factory("channel open timed out".into()));
        }
        Ok(FakeChannel {
            connection: connection.serial,
            number: connection.next_channel.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn connection_healthy(&self, connection: &Arc<FakeConnection>) -> bool {
        connection.alive.load(Ordering::SeqCst)
    }

    fn close_channel(&self, channel: FakeChannel) {
        self.events
            .lock()
            .push(format!("close channel {}.{}", channel.connection, channel.number));
    }

    fn close_connection(&self, connection: &Arc<FakeConnection>) {
        self.events
            .lock()
            .push(format!("close connection {}", connection.serial));
    }
}
