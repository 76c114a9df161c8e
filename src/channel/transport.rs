//! The seam between the dispatching machinery and the transport implementation.
//!
//! The dispatcher never talks to `lapin` directly: it only needs to open channels, check whether
//! they are still usable and close them. [`AmqpChannelFactory`](crate::pool::AmqpChannelFactory)
//! provides the RabbitMq implementation.

/// A transport channel: a lightweight session over a broker connection that supports one
/// operation at a time.
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// `false` if the channel (or the connection underneath it) has been closed or broken.
    fn is_usable(&self) -> bool;

    /// Close the channel.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Opens new transport channels on behalf of [`PersistentChannel`](super::PersistentChannel)s.
///
/// Whether a new connection is established for each channel or an existing one is reused is
/// up to the specific implementation. Failures are expected to be transient: callers retry.
#[async_trait::async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: TransportChannel;

    async fn open_channel(
        &self,
        options: &PersistentChannelOptions,
    ) -> Result<Self::Channel, anyhow::Error>;
}

/// How the transport channel underneath a [`PersistentChannel`](super::PersistentChannel)
/// must be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentChannelOptions {
    /// Put the channel in confirm mode, so that the broker acknowledges every publish.
    pub publisher_confirms: bool,
}

#[async_trait::async_trait]
impl TransportChannel for lapin::Channel {
    fn is_usable(&self) -> bool {
        self.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        // 200 - REPLY_SUCCESS, see https://www.rabbitmq.com/amqp-0-9-1-reference.html
        lapin::Channel::close(self, 200, "Closing pooled channel")
            .await
            .map_err(Into::into)
    }
}
