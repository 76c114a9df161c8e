//! Facilities to consume messages from a RabbitMq queue and route them to typed handlers.
//! Check out [`Subscription`] as a starting point.
pub use consumer::AmqpConsumer;
pub use delivery::{Delivery, RoutingInfo};
pub use handler::{ClosureHandler, HandlerRegistry, HandlerRegistryBuilder, MessageHandler};
pub use observer::DeliveryObserver;
pub use subscription::{
    DeliveryOutcome, DeliveryReceipt, RouterError, Subscription, SubscriptionState,
};

mod consumer;
mod delivery;
mod handler;
mod observer;
mod subscription;
