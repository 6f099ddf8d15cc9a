//! Broker connections multiplexing numbered channels over one socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use mooring_core::error::PoolError;
use mooring_core::traits::BrokerManager;

use super::{connect, socket_healthy};

/// Channel numbers `1..=max`, lowest free number first.
#[derive(Debug)]
struct ChannelNumbers {
    max: u16,
    next: u16,
    released: Vec<u16>,
}

impl ChannelNumbers {
    fn new(max: u16) -> Self {
        Self {
            max,
            next: 1,
            released: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        if let Some(number) = self.released.pop() {
            return Some(number);
        }
        if self.next == 0 || self.next > self.max {
            return None;
        }
        let number = self.next;
        self.next = self.next.wrapping_add(1);
        Some(number)
    }

    fn release(&mut self, number: u16) {
        self.released.push(number);
        self.released.sort_unstable_by(|a, b| b.cmp(a));
    }
}

/// One physical connection to the broker.
#[derive(Debug)]
pub struct BrokerConnection {
    stream: TcpStream,
    peer: SocketAddr,
    numbers: Arc<Mutex<ChannelNumbers>>,
    closed: Arc<AtomicBool>,
}

impl BrokerConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A logical channel on a [`BrokerConnection`]. Its number is returned to
/// the connection when the channel drops.
#[derive(Debug)]
pub struct BrokerChannel {
    number: u16,
    numbers: Arc<Mutex<ChannelNumbers>>,
    connection_closed: Arc<AtomicBool>,
}

impl BrokerChannel {
    pub fn number(&self) -> u16 {
        self.number
    }

    /// Whether the owning connection is still open.
    pub fn is_open(&self) -> bool {
        !self.connection_closed.load(Ordering::Acquire)
    }
}

impl Drop for BrokerChannel {
    fn drop(&mut self) {
        self.numbers.lock().release(self.number);
    }
}

/// Opens broker connections over TCP.
#[derive(Debug, Clone)]
pub struct TcpBroker {
    address: String,
    connect_timeout: Duration,
    channel_max: u16,
}

impl TcpBroker {
    pub fn new(address: impl Into<String>, connect_timeout: Duration, channel_max: u16) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            channel_max,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl BrokerManager for TcpBroker {
    type Connection = BrokerConnection;
    type Channel = BrokerChannel;

    async fn connect(&self) -> Result<BrokerConnection, PoolError> {
        let stream = connect(&self.address, self.connect_timeout).await?;
        let peer = stream
            .peer_addr()
            .map_err(|e| PoolError::Factory(format!("peer address of {}: {e}", self.address)))?;
        debug!(address = %self.address, %peer, "broker connection opened");
        Ok(BrokerConnection {
            stream,
            peer,
            numbers: Arc::new(Mutex::new(ChannelNumbers::new(self.channel_max))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn open_channel(&self, connection: &BrokerConnection) -> Result<BrokerChannel, PoolError> {
        if connection.is_closed() {
            return Err(PoolError::Factory(format!(
                "broker connection to {} is closed",
                connection.peer
            )));
        }
        let number = connection.numbers.lock().allocate().ok_or_else(|| {
            PoolError::Factory(format!(
                "all {} channel numbers in use on {}",
                self.channel_max, connection.peer
            ))
        })?;
        trace!(peer = %connection.peer, channel = number, "channel opened");
        Ok(BrokerChannel {
            number,
            numbers: Arc::clone(&connection.numbers),
            connection_closed: Arc::clone(&connection.closed),
        })
    }

    fn connection_healthy(&self, connection: &BrokerConnection) -> bool {
        !connection.is_closed() && socket_healthy(&connection.stream)
    }

    fn channel_healthy(&self, channel: &BrokerChannel) -> bool {
        channel.is_open()
    }

    fn close_channel(&self, channel: BrokerChannel) {
        trace!(channel = channel.number, "channel closed");
        drop(channel);
    }

    fn close_connection(&self, connection: &BrokerConnection) {
        if !connection.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %connection.peer, "broker connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn broker(channel_max: u16) -> (TcpBroker, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (
            TcpBroker::new(address, Duration::from_secs(1), channel_max),
            listener,
        )
    }

    #[test]
    fn test_channel_numbers_are_recycled_lowest_first() {
        let mut numbers = ChannelNumbers::new(3);
        assert_eq!(numbers.allocate(), Some(1));
        assert_eq!(numbers.allocate(), Some(2));
        assert_eq!(numbers.allocate(), Some(3));
        assert_eq!(numbers.allocate(), None);

        numbers.release(3);
        numbers.release(1);
        assert_eq!(numbers.allocate(), Some(1));
        assert_eq!(numbers.allocate(), Some(3));
    }

    #[tokio::test]
    async fn test_channels_share_one_connection() {
        let (broker, _listener) = broker(2).await;
        let connection = broker.connect().await.unwrap();

        let a = broker.open_channel(&connection).await.unwrap();
        let b = broker.open_channel(&connection).await.unwrap();
        assert_eq!((a.number(), b.number()), (1, 2));
        assert!(broker.open_channel(&connection).await.is_err());

        broker.close_channel(a);
        let c = broker.open_channel(&connection).await.unwrap();
        assert_eq!(c.number(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_invalidates_channels() {
        let (broker, _listener) = broker(4).await;
        let connection = broker.connect().await.unwrap();
        let channel = broker.open_channel(&connection).await.unwrap();
        assert!(broker.connection_healthy(&connection));

        broker.close_connection(&connection);
        assert!(!broker.connection_healthy(&connection));
        assert!(!broker.channel_healthy(&channel));
        assert!(broker.open_channel(&connection).await.is_err());
    }
}
