//! Implements [`ChannelFactory`] for [`lapin::Channel`].
use lapin::{options::ConfirmSelectOptions, Channel};

use super::connection::ConnectionPool;
use crate::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
use crate::channel::{ChannelFactory, PersistentChannelOptions};

/// `AmqpChannelFactory` opens RabbitMq [`Channel`]s for persistent channels.
///
/// It keeps an internal [`ConnectionPool`] in order to multiplex channels over a limited
/// number of connections.
#[derive(Clone)]
pub struct AmqpChannelFactory {
    connection_pool: ConnectionPool,
}

impl AmqpChannelFactory {
    /// Construct `AmqpChannelFactory` on top of a [`ConnectionPool`].
    pub fn new(connection_pool: ConnectionPool) -> Self {
        Self { connection_pool }
    }

    /// Connect to the broker described by `settings`, pooling up to
    /// [`RabbitMqSettings::max_connections`] connections.
    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let connection_pool =
            ConnectionFactory::new_from_config(settings)?.into_pool(settings.max_connections())?;
        Ok(Self::new(connection_pool))
    }
}

/// Channels requested with publisher confirms are put in confirm mode before being handed over.
#[async_trait::async_trait]
impl ChannelFactory for AmqpChannelFactory {
    type Channel = Channel;

    #[tracing::instrument(name = "rabbitmq_open_channel", skip(self))]
    async fn open_channel(
        &self,
        options: &PersistentChannelOptions,
    ) -> Result<Channel, anyhow::Error> {
        let connection = self
            .connection_pool
            .get()
            .await
            .map_err(super::Error::from)?;
        let channel = connection.create_channel().await?;
        if options.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(channel)
    }
}
