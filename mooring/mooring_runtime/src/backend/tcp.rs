//! Plain TCP connections for request/response backends.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use mooring_core::error::PoolError;
use mooring_core::traits::Manager;

use super::{connect, socket_healthy};

/// One open connection to a database or cache server.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    opened_at: Instant,
}

impl TcpConnection {
    /// The underlying socket.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// Opens [`TcpConnection`]s to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpManager {
    address: String,
    connect_timeout: Duration,
}

impl TcpManager {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Manager for TcpManager {
    type Resource = TcpConnection;

    async fn create(&self) -> Result<TcpConnection, PoolError> {
        let stream = connect(&self.address, self.connect_timeout).await?;
        let peer = stream
            .peer_addr()
            .map_err(|e| PoolError::Factory(format!("peer address of {}: {e}", self.address)))?;
        debug!(address = %self.address, %peer, "tcp connection opened");
        Ok(TcpConnection {
            stream,
            peer,
            opened_at: Instant::now(),
        })
    }

    fn is_healthy(&self, connection: &TcpConnection) -> bool {
        socket_healthy(&connection.stream)
    }

    fn close(&self, connection: TcpConnection) {
        trace!(peer = %connection.peer, "tcp connection closed");
        drop(connection);
    }
}
