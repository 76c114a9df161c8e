use crate::consumers::{Delivery, DeliveryOutcome, Subscription};
use futures_util::{stream::FuturesUnordered, Future, FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use uuid::Uuid;

/// Feeds a [`Subscription`] with the messages RabbitMq pushes from a queue, and settles each
/// message with the broker once the subscription has processed it.
///
/// - processed successfully or unroutable: the message is acked;
/// - failed: the message is nacked without requeueing (it is dead-lettered, if the queue has
///   a dead letter exchange).
pub struct AmqpConsumer {
    /// An open channel to communicate with RabbitMq.
    channel: Channel,
    subscription: Subscription,
}

impl AmqpConsumer {
    /// Configure a new RabbitMq consumer for `subscription.queue_name()`.
    ///
    /// At most `prefetch_count` messages are pushed by the broker without having been settled.
    /// The subscription is started if it was not already.
    #[tracing::instrument(skip(channel, subscription), name = "consumer_new")]
    pub async fn new(
        channel: Channel,
        mut subscription: Subscription,
        prefetch_count: u16,
    ) -> Result<Self, anyhow::Error> {
        channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        subscription.start()?;
        Ok(Self {
            channel,
            subscription,
        })
    }

    /// Run the consumer, which will notify RabbitMq to start pushing messages on the
    /// subscription's queue.
    ///
    /// `run_until_shutdown` exits if the consumer fails with an error (e.g. the channel is closed
    /// or the connection with RabbitMq is lost) or once `shutdown` resolves. Messages already
    /// received are processed and settled before returning.
    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.subscription.queue_name()))]
    pub async fn run_until_shutdown(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        let consumer_tag = Uuid::new_v4().to_string();
        let mut consumer = self
            .channel
            .basic_consume(
                self.subscription.queue_name(),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut settlements = FuturesUnordered::new();

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let result = 'event_loop: loop {
            tokio::select! {
                // Prefer handling shutdowns over processing more messages.
                biased;

                _ = &mut shutdown => {
                    tracing::info!("consumer received shutdown event");
                    // Cancelling the consumer ends the delivery stream below.
                    if let Err(e) = self.channel.basic_cancel(&consumer_tag, BasicCancelOptions::default()).await {
                        tracing::warn!(error = ?e, "Failed to cancel the consumer");
                        break 'event_loop Ok(());
                    }
                }

                _ = settlements.next(), if !settlements.is_empty() => {}

                event = consumer.next() => {
                    match event {
                        // consumer has shutdown
                        None => break 'event_loop Ok(()),
                        Some(Err(e)) => {
                            tracing::error!("Consumer error: {}", e);
                            break 'event_loop Err(e.into())
                        }
                        Some(Ok(delivery)) => {
                            let (delivery, acker) = Delivery::from_amqp(delivery, &consumer_tag);
                            let receipt = match self.subscription.deliver(delivery) {
                                Ok(receipt) => receipt,
                                Err(e) => break 'event_loop Err(e.into()),
                            };
                            settlements.push(async move {
                                match receipt.outcome().await {
                                    Ok(outcome) => settle(&acker, &outcome).await,
                                    Err(e) => tracing::warn!(error = ?e, "A delivery was dropped before being processed"),
                                }
                            });
                        }
                    }
                }
            }
        };

        // Make sure all messages in flight are settled before returning.
        while settlements.next().await.is_some() {}
        self.subscription.dispose().await;

        result
    }
}

/// Ack or nack a message with the broker according to its processing outcome.
async fn settle(acker: &Acker, outcome: &DeliveryOutcome) {
    let result = if outcome.is_settled() {
        acker.ack(BasicAckOptions::default()).await
    } else {
        acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
    };
    if let Err(e) = result {
        tracing::error!(error = ?e, "Failed to settle a message with RabbitMq");
    }
}
