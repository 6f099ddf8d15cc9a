//! Resource factories.
//!
//! A pool owns the bookkeeping; a manager owns the backend. Managers are
//! supplied by the runtime (real TCP backends) or by tests (in-memory fakes).

use async_trait::async_trait;

use crate::error::PoolError;

/// Creates, checks and closes one kind of pooled resource.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// The resource produced by this manager.
    type Resource: Send + 'static;

    /// Open a new resource. Failures are retried by the pool.
    async fn create(&self) -> Result<Self::Resource, PoolError>;

    /// Whether an idle resource may be handed out again.
    fn is_healthy(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Close a resource. Runs synchronously and must not block.
    fn close(&self, resource: Self::Resource) {
        drop(resource);
    }
}

/// Opens broker connections and multiplexes channels over them.
#[async_trait]
pub trait BrokerManager: Send + Sync + 'static {
    /// One physical connection to the broker.
    type Connection: Send + Sync + 'static;
    /// One logical channel opened on a connection.
    type Channel: Send + 'static;

    /// Open a physical connection.
    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Open a channel on `connection`.
    async fn open_channel(&self, connection: &Self::Connection) -> Result<Self::Channel, PoolError>;

    /// Whether the connection can still carry channels.
    fn connection_healthy(&self, _connection: &Self::Connection) -> bool {
        true
    }

    /// Whether an idle channel may be handed out again.
    fn channel_healthy(&self, _channel: &Self::Channel) -> bool {
        true
    }

    /// Close one channel.
    fn close_channel(&self, channel: Self::Channel) {
        drop(channel);
    }

    /// Close a connection. Called only after all its channels are closed or
    /// revoked.
    fn close_connection(&self, connection: &Self::Connection) {
        let _ = connection;
    }
}
