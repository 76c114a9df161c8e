use lapin::acker::Acker;

/// One inbound message, ready to be routed to the handler registered for its type.
///
/// A `Delivery` is consumed by exactly one handler, or dropped if no handler is registered
/// for its type tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    /// The message type, taken from the AMQP `type` property.
    pub type_tag: Option<String>,
    /// The correlation id set by the publisher, if any.
    pub correlation_id: Option<String>,
    /// The payload of the message in binary format.
    pub payload: Vec<u8>,
    /// Where the message came from.
    pub routing: RoutingInfo,
}

/// Routing metadata attached to a [`Delivery`] by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutingInfo {
    /// The tag of the consumer the message was delivered to.
    pub consumer_tag: String,
    pub delivery_tag: u64,
    /// Whether this message was redelivered.
    pub redelivered: bool,
    /// The exchange of the message. May be an empty string if the default exchange is used.
    pub exchange: String,
    /// The routing key of the message. May be an empty string if no routing key is specified.
    pub routing_key: String,
}

impl Delivery {
    /// A delivery carrying `payload`, tagged with `type_tag`.
    pub fn new(type_tag: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_tag: Some(type_tag.into()),
            payload: payload.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_routing(mut self, routing: RoutingInfo) -> Self {
        self.routing = routing;
        self
    }

    /// Split a message received from RabbitMq into a `Delivery` and the [`Acker`] that must be
    /// used to settle it with the broker.
    // The acker is kept away from handlers: a message must not be acked/rejected multiple times,
    // see https://www.rabbitmq.com/amqp-0-9-1-reference.html#basic.ack.delivery-tag
    pub(crate) fn from_amqp(delivery: lapin::message::Delivery, consumer_tag: &str) -> (Self, Acker) {
        let lapin::message::Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        } = delivery;
        let delivery = Self {
            type_tag: properties.kind().as_ref().map(|kind| kind.as_str().to_owned()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_owned()),
            payload: data,
            routing: RoutingInfo {
                consumer_tag: consumer_tag.to_owned(),
                delivery_tag,
                redelivered,
                exchange: exchange.as_str().to_owned(),
                routing_key: routing_key.as_str().to_owned(),
            },
        };
        (delivery, acker)
    }
}
