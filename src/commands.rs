//! Ready-made [`ClientCommand`]s for the most common RabbitMq operations.
//!
//! Anything else can be dispatched by implementing [`ClientCommand`] for [`Channel`].
use crate::dispatcher::ClientCommand;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind, Queue,
};

/// Publish a payload on an exchange.
///
/// The command resolves once the broker has confirmed the publish, if the channel is in
/// confirm mode (see [`DispatchOptions`](crate::dispatcher::DispatchOptions)), or as soon as
/// the message has been sent otherwise ([`Confirmation::NotRequested`]).
#[derive(Debug, Clone)]
pub struct Publish {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
    pub options: BasicPublishOptions,
}

#[async_trait::async_trait]
impl ClientCommand<Channel> for Publish {
    type Output = Confirmation;

    #[tracing::instrument(
        name = "rabbitmq_publish",
        level = "debug",
        skip_all,
        fields(exchange = %self.exchange, routing_key = %self.routing_key)
    )]
    async fn invoke(self, channel: &Channel) -> Result<Confirmation, anyhow::Error> {
        // Delivery mode: Non-persistent (1) or persistent (2).
        let properties = self.properties.with_delivery_mode(2);
        let confirmation = channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                self.options,
                &self.payload,
                properties,
            )
            .await?
            .await?;
        Ok(confirmation)
    }
}

/// Declare a queue, creating it if it does not exist yet.
#[derive(Debug, Clone)]
pub struct DeclareQueue {
    pub name: String,
    pub options: QueueDeclareOptions,
    pub arguments: FieldTable,
}

impl DeclareQueue {
    /// A durable, non-exclusive queue that survives broker restarts.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments: FieldTable::default(),
        }
    }
}

#[async_trait::async_trait]
impl ClientCommand<Channel> for DeclareQueue {
    type Output = Queue;

    async fn invoke(self, channel: &Channel) -> Result<Queue, anyhow::Error> {
        Ok(channel
            .queue_declare(&self.name, self.options, self.arguments)
            .await?)
    }
}

/// Declare an exchange, creating it if it does not exist yet.
#[derive(Debug, Clone)]
pub struct DeclareExchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeDeclareOptions,
    pub arguments: FieldTable,
}

#[async_trait::async_trait]
impl ClientCommand<Channel> for DeclareExchange {
    type Output = ();

    async fn invoke(self, channel: &Channel) -> Result<(), anyhow::Error> {
        channel
            .exchange_declare(&self.name, self.kind, self.options, self.arguments)
            .await?;
        Ok(())
    }
}

/// Bind a queue to an exchange.
#[derive(Debug, Clone)]
pub struct BindQueue {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

#[async_trait::async_trait]
impl ClientCommand<Channel> for BindQueue {
    type Output = ();

    async fn invoke(self, channel: &Channel) -> Result<(), anyhow::Error> {
        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                self.arguments,
            )
            .await?;
        Ok(())
    }
}
