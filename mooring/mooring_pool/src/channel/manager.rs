//! Adapts a [`BrokerManager`] connection into a per-connection channel factory.

use std::sync::Arc;

use async_trait::async_trait;

use mooring_core::error::PoolError;
use mooring_core::traits::{BrokerManager, Manager};

/// Opens channels on one fixed connection.
pub(crate) struct ChannelManager<B: BrokerManager> {
    broker: Arc<B>,
    connection: Arc<B::Connection>,
}

impl<B: BrokerManager> ChannelManager<B> {
    pub(crate) fn new(broker: Arc<B>, connection: Arc<B::Connection>) -> Self {
        Self { broker, connection }
    }
}

#[async_trait]
impl<B: BrokerManager> Manager for ChannelManager<B> {
    type Resource = B::Channel;

    async fn create(&self) -> Result<B::Channel, PoolError> {
        if !self.broker.connection_healthy(&self.connection) {
            return Err(PoolError::Factory("broker connection is closed".to_string()));
        }
        self.broker.open_channel(&self.connection).await
    }

    fn is_healthy(&self, channel: &B::Channel) -> bool {
        self.broker.connection_healthy(&self.connection) && self.broker.channel_healthy(channel)
    }

    fn close(&self, channel: B::Channel) {
        self.broker.close_channel(channel);
    }
}
