use crate::commands::Publish;
use crate::dispatcher::{ClientCommandDispatcher, DispatchOptions};
use crate::error::DispatchError;
use crate::message::{JsonSerializer, Message};
use crate::pool::AmqpChannelFactory;
use crate::publishers::MessageEnvelope;
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// A high-level interface to publish messages.
///
/// # Fault tolerance
///
/// Publishing goes through a [`ClientCommandDispatcher`]: channels are pooled and shared with
/// every other user of the dispatcher, and broken channels are recreated transparently.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
pub struct Publisher {
    dispatcher: Arc<ClientCommandDispatcher<AmqpChannelFactory>>,
    /// Determines if `Publisher` waits for AMQP publishers confirms or not.
    options: DispatchOptions,
    /// Timeout on publishing, including the wait for a free channel.
    timeout: std::time::Duration,
}

impl Publisher {
    /// Start building a [`Publisher`] on top of a dispatcher.
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_courier::amqp::configuration::ClientSettings;
    /// use carrot_courier::dispatcher::ClientCommandDispatcher;
    /// use carrot_courier::pool::AmqpChannelFactory;
    /// use carrot_courier::publishers::Publisher;
    /// use std::sync::Arc;
    ///
    /// pub fn get_publisher() -> Result<Publisher, anyhow::Error> {
    ///     let settings = ClientSettings::default();
    ///     let dispatcher = ClientCommandDispatcher::new(
    ///         AmqpChannelFactory::from_settings(&settings.rabbitmq)?,
    ///         &settings.dispatcher,
    ///     )?;
    ///
    ///     Ok(Publisher::builder(Arc::new(dispatcher))
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build())
    /// }
    /// ```
    pub fn builder(dispatcher: Arc<ClientCommandDispatcher<AmqpChannelFactory>>) -> PublisherBuilder {
        PublisherBuilder::new(dispatcher)
    }

    /// Publish a message to RabbitMq.
    ///
    /// By default, this enables mandatory mode if publisher confirmations are on.
    /// Use `publish_with_options` to overwrite this behaviour.
    pub async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublisherError> {
        let options = BasicPublishOptions {
            mandatory: self.options.publisher_confirms,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        self.publish_with_options(envelope, options).await
    }

    /// Serialize `message` as JSON, tag it with its type name and publish it.
    pub async fn publish_message<M: Message>(
        &self,
        message: &M,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), PublisherError> {
        let envelope = MessageEnvelope::typed(message, &JsonSerializer, exchange_name, routing_key)
            .map_err(PublisherError::SerializationError)?;
        self.publish(envelope).await
    }

    /// Publish a message to RabbitMq.
    #[tracing::instrument(
        name = "publish",
        skip_all,
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish_with_options(
        &self,
        envelope: MessageEnvelope,
        options: BasicPublishOptions,
    ) -> Result<(), PublisherError> {
        // Inject the current timestamp and a message_id to the message envelope
        let envelope = inject_amqp_properties(envelope);
        let command = Publish {
            exchange: envelope.exchange_name,
            routing_key: envelope.routing_key,
            payload: envelope.payload,
            properties: envelope.properties,
            options,
        };

        // Waiting for a channel and publishing share the same timeout.
        let cancellation = CancellationToken::new();
        let invocation = self.dispatcher.invoke(command, self.options, &cancellation);
        tokio::pin!(invocation);
        let result = tokio::select! {
            result = &mut invocation => result,
            _ = tokio::time::sleep(self.timeout) => {
                cancellation.cancel();
                invocation.await
            }
        };

        publish_outcome(result, cancellation.is_cancelled())
    }
}

/// Map the outcome of a dispatched publish to what callers of the publisher see.
///
/// Once the publish timeout elapsed, any failure it provoked (e.g. giving up on recreating a
/// channel) is reported as a timeout.
fn publish_outcome(
    result: Result<Confirmation, DispatchError>,
    timed_out: bool,
) -> Result<(), PublisherError> {
    match result {
        Ok(confirmation) => confirmation_outcome(confirmation),
        Err(DispatchError::Cancelled) => Err(PublisherError::TimeoutError),
        Err(_) if timed_out => Err(PublisherError::TimeoutError),
        Err(e) => Err(PublisherError::Dispatch(e)),
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to dispatch the publish command to the RabbitMq broker")]
    Dispatch(#[source] DispatchError),
    #[error("Failed to serialize the message")]
    SerializationError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("The message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    dispatcher: Arc<ClientCommandDispatcher<AmqpChannelFactory>>,
    options: DispatchOptions,
    timeout: std::time::Duration,
}

impl PublisherBuilder {
    fn new(dispatcher: Arc<ClientCommandDispatcher<AmqpChannelFactory>>) -> Self {
        Self {
            dispatcher,
            options: DispatchOptions::with_publisher_confirms(),
            timeout: std::time::Duration::from_secs(3),
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disable publisher confirmations.
    ///
    /// By default, we wait for the broker to confirm every publish, but you can opt out using
    /// this flag.
    #[must_use]
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.options = DispatchOptions::without_publisher_confirms();
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher {
        Publisher {
            dispatcher: self.dispatcher,
            options: self.options,
            timeout: self.timeout,
        }
    }
}

fn confirmation_outcome(confirmation: Confirmation) -> Result<(), PublisherError> {
    match confirmation {
        Confirmation::Ack(ack) => {
            if let Some(return_message) = ack {
                // Reply Code 312 - NO_ROUTE
                // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                if return_message.reply_code == 312 {
                    return Err(PublisherError::UnroutableMessage(return_message));
                }
            }
            Ok(())
        }
        Confirmation::Nack(nack) => Err(PublisherError::NegativeAck(nack)),
        Confirmation::NotRequested => Ok(()),
    }
}

fn inject_amqp_properties(mut envelope: MessageEnvelope) -> MessageEnvelope {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = envelope.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    envelope.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    envelope
}
