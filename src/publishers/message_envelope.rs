use crate::message::{Message, MessageSerializer};
use lapin::BasicProperties;

/// A message to be published via [`Publisher`](super::Publisher).
#[derive(Debug, Clone, Default)]
pub struct MessageEnvelope {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// The name of the exchange we are publishing the message to.
    pub exchange_name: String,
    /// The routing key used by exchange listeners to determine if they are interested or not
    /// to the message.
    pub routing_key: String,
    /// AMQP properties attached to the message.
    pub properties: BasicProperties,
}

impl MessageEnvelope {
    /// Serialize `message` into an envelope, tagging it with its type name so that consumers
    /// can route it to the right handler.
    pub fn typed<M: Message, S: MessageSerializer>(
        message: &M,
        serializer: &S,
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<Self, anyhow::Error> {
        Ok(Self {
            payload: serializer.serialize(message)?,
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            properties: BasicProperties::default()
                .with_kind(M::TYPE_NAME.into())
                .with_content_type(serializer.content_type().into()),
        })
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.properties = self.properties.with_correlation_id(correlation_id.into());
        self
    }
}
