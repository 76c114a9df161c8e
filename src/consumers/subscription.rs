use crate::consumers::{handler::HandlerRegistry, Delivery, DeliveryObserver};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// How the processing of a [`Delivery`] ended.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The registered handler processed the message successfully.
    Acknowledged,
    /// The payload could not be deserialized, or the handler failed (or panicked).
    Failed(anyhow::Error),
    /// No handler is registered for the delivery's type tag: the message was discarded.
    Unroutable,
}

impl DeliveryOutcome {
    /// `true` unless processing failed. Unroutable messages are settled as well: an unknown
    /// type must never stall the queue.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Error returned when interacting with a [`Subscription`].
#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("The subscription has been disposed")]
    Disposed,
}

/// The lifecycle of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Deliveries are accepted and buffered, but not processed yet.
    Created,
    /// Deliveries are processed, one at a time, in the order they were received.
    Active,
    /// No more deliveries are accepted.
    Disposed,
}

/// A completion signal for a single delivery, resolved once processing is over.
#[must_use = "dropping the receipt does not cancel the processing of the delivery"]
pub struct DeliveryReceipt(oneshot::Receiver<DeliveryOutcome>);

impl DeliveryReceipt {
    /// Wait for the delivery to be processed.
    ///
    /// It fails if the subscription was disposed before the delivery could be processed.
    pub async fn outcome(self) -> Result<DeliveryOutcome, RouterError> {
        self.0.await.map_err(|_| RouterError::Disposed)
    }
}

struct PendingDelivery {
    delivery: Delivery,
    completion: oneshot::Sender<DeliveryOutcome>,
}

/// Routes the deliveries received from a queue to the handlers registered for their type.
///
/// Deliveries of a subscription are processed sequentially, on a dedicated task, to preserve
/// the ordering of the queue. Different subscriptions run concurrently.
///
/// ```rust
/// use carrot_courier::consumers::{Delivery, DeliveryOutcome, HandlerRegistry, Subscription};
/// use carrot_courier::message::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     id: u64,
/// }
///
/// impl Message for OrderPlaced {
///     const TYPE_NAME: &'static str = "OrderPlaced";
/// }
///
/// async fn example() -> anyhow::Result<()> {
///     let registry = HandlerRegistry::builder()
///         .add(|order: OrderPlaced| async move {
///             println!("Order {} placed", order.id);
///             Ok(())
///         })
///         .build();
///     let mut subscription = Subscription::receive("orders", registry)?;
///
///     let receipt = subscription.deliver(Delivery::new("OrderPlaced", r#"{"id":1}"#))?;
///     assert!(matches!(receipt.outcome().await?, DeliveryOutcome::Acknowledged));
///
///     subscription.dispose().await;
///     Ok(())
/// }
/// ```
pub struct Subscription {
    queue_name: String,
    state: SubscriptionState,
    sender: Option<mpsc::UnboundedSender<PendingDelivery>>,
    router: Option<Router>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Create a subscription for `queue_name`, in the [`SubscriptionState::Created`] state.
    pub fn new(queue_name: impl Into<String>, handlers: HandlerRegistry) -> Self {
        let queue_name = queue_name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            router: Some(Router {
                queue_name: queue_name.clone(),
                handlers,
                observers: Vec::new(),
                receiver,
            }),
            queue_name,
            state: SubscriptionState::Created,
            sender: Some(sender),
            worker: None,
        }
    }

    /// Create a subscription for `queue_name` and start processing deliveries straight away.
    pub fn receive(queue_name: impl Into<String>, handlers: HandlerRegistry) -> Result<Self, RouterError> {
        let mut subscription = Self::new(queue_name, handlers);
        subscription.start()?;
        Ok(subscription)
    }

    /// Notify `observer` after each delivery has been processed.
    ///
    /// Observers can only be added before the subscription is started.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        match self.router.as_mut() {
            Some(router) => router.observers.push(observer),
            None => warn!(
                queue_name = %self.queue_name,
                "Ignoring an observer added to a subscription that is already running"
            ),
        }
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Start processing deliveries on a dedicated task. Starting an active subscription
    /// does nothing.
    ///
    /// It must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), RouterError> {
        match self.state {
            SubscriptionState::Disposed => Err(RouterError::Disposed),
            SubscriptionState::Active => Ok(()),
            SubscriptionState::Created => {
                let router = self.router.take().ok_or(RouterError::Disposed)?;
                self.worker = Some(tokio::spawn(router.run()));
                self.state = SubscriptionState::Active;
                Ok(())
            }
        }
    }

    /// Hand a delivery over to the subscription.
    ///
    /// The returned receipt resolves once the delivery has been processed.
    pub fn deliver(&self, delivery: Delivery) -> Result<DeliveryReceipt, RouterError> {
        let sender = self.sender.as_ref().ok_or(RouterError::Disposed)?;
        let (completion, receipt) = oneshot::channel();
        sender
            .send(PendingDelivery {
                delivery,
                completion,
            })
            .map_err(|_| RouterError::Disposed)?;
        Ok(DeliveryReceipt(receipt))
    }

    /// Stop accepting deliveries and wait for the ones already received to be processed.
    ///
    /// Deliveries buffered by a subscription that was never started are dropped: their
    /// receipts resolve with [`RouterError::Disposed`].
    #[tracing::instrument(name = "subscription_dispose", skip_all, fields(queue_name = %self.queue_name))]
    pub async fn dispose(&mut self) {
        self.state = SubscriptionState::Disposed;
        self.sender = None;
        self.router = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = ?e, "The delivery processing task of a subscription crashed");
            }
        }
    }
}

/// The sequential processing loop of a [`Subscription`].
struct Router {
    queue_name: String,
    handlers: HandlerRegistry,
    observers: Vec<Arc<dyn DeliveryObserver>>,
    receiver: mpsc::UnboundedReceiver<PendingDelivery>,
}

impl Router {
    async fn run(mut self) {
        while let Some(PendingDelivery {
            delivery,
            completion,
        }) = self.receiver.recv().await
        {
            let outcome = self.route(&delivery).await;
            for observer in &self.observers {
                let notification = observer.on_delivery(&self.queue_name, &delivery, &outcome);
                let notified = AssertUnwindSafe(notification).catch_unwind().await;
                if notified.is_err() {
                    error!(queue_name = %self.queue_name, "A delivery observer panicked");
                }
            }
            // The caller is not required to wait for the outcome.
            let _ = completion.send(outcome);
        }
    }

    #[tracing::instrument(
        name = "route_delivery",
        skip_all,
        fields(
            queue_name = %self.queue_name,
            type_tag = ?delivery.type_tag,
            correlation_id = ?delivery.correlation_id
        ),
        level = tracing::Level::DEBUG
    )]
    async fn route(&self, delivery: &Delivery) -> DeliveryOutcome {
        let Some(type_tag) = delivery.type_tag.as_deref() else {
            warn!("Discarding a delivery without a type tag");
            return DeliveryOutcome::Unroutable;
        };
        let Some(handler) = self.handlers.resolve(type_tag) else {
            warn!("No handler registered for this message type, discarding the delivery");
            return DeliveryOutcome::Unroutable;
        };

        // A panicking handler must not take the whole subscription down.
        match AssertUnwindSafe(handler.handle(delivery, type_tag))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => DeliveryOutcome::Acknowledged,
            Ok(Err(e)) => {
                error!(error = ?e, "Failed to process a delivery");
                DeliveryOutcome::Failed(e)
            }
            Err(_) => {
                error!("The message handler panicked");
                DeliveryOutcome::Failed(anyhow::anyhow!(
                    "The handler for `{type_tag}` panicked"
                ))
            }
        }
    }
}
