//! `carrot-courier` is a resilience and dispatch layer on top of [`lapin`], sitting between
//! application code and RabbitMq.
//!
//! Many concurrent producers can issue broker operations without owning a channel each:
//! [`ClientCommandDispatcher`](crate::dispatcher::ClientCommandDispatcher) keeps pools of
//! self-healing channels, checks one out for every command and always puts it back.
//!
//! On the consuming side, [`Subscription`](crate::consumers::Subscription) routes inbound
//! messages to typed handlers according to their type tag.
//!
//! [`ClientCommandDispatcher`](crate::dispatcher::ClientCommandDispatcher),
//! [`Publisher`](crate::publishers::Publisher) and
//! [`Subscription`](crate::consumers::Subscription) are the best starting points.

pub mod consumers;
pub mod dispatcher;
pub mod publishers;

pub mod amqp;
pub mod channel;
pub mod commands;
pub mod message;
pub mod pool;
pub mod queue;

mod error;
pub use error::DispatchError;
