//! TCP-level backends used by the default lifecycle controller.
//!
//! These open real sockets so a configured service can be reached, but stop
//! short of any wire protocol: authentication and query handshakes belong to
//! the client libraries layered on top.

pub mod broker;
pub mod tcp;

pub use broker::{BrokerChannel, BrokerConnection, TcpBroker};
pub use tcp::{TcpConnection, TcpManager};

use std::time::Duration;

use tokio::net::TcpStream;

use mooring_core::error::PoolError;

/// Connect to `address` within `timeout` with Nagle disabled.
pub(crate) async fn connect(address: &str, timeout: Duration) -> Result<TcpStream, PoolError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            PoolError::Factory(format!(
                "connect to {address} timed out after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| PoolError::Factory(format!("connect to {address}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| PoolError::Factory(format!("configure socket for {address}: {e}")))?;
    Ok(stream)
}

/// A socket with no pending error.
pub(crate) fn socket_healthy(stream: &TcpStream) -> bool {
    matches!(stream.take_error(), Ok(None))
}
