use crate::consumers::{Delivery, DeliveryOutcome};

/// Observers are notified after each delivery of a [`Subscription`](super::Subscription)
/// has been fully processed.
///
/// # Use case
///
/// Observers get **read-only** access to the delivery and its outcome: they cannot change how
/// the message is settled with the broker. They are the best place to emit logs, collect
/// metrics or wait for a message to be processed in a test.
///
/// Observers run on the subscription's processing task: a slow observer delays the processing
/// of the next delivery.
#[async_trait::async_trait]
pub trait DeliveryObserver: Send + Sync + 'static {
    async fn on_delivery(&self, queue_name: &str, delivery: &Delivery, outcome: &DeliveryOutcome);
}
