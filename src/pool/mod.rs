//! Provides [`lapin`] transport primitives to the dispatcher: a [`deadpool`] pool of
//! [`lapin::Connection`]s and an [`AmqpChannelFactory`] opening channels on top of it.
//!
//! Broken connections are discarded by the pool and recreated on demand, while connections
//! are reused across channels to limit overhead.
//!
//! ```rust
//! use carrot_courier::pool::{AmqpChannelFactory, ConnectionPool};
//! use carrot_courier::amqp::ConnectionFactory;
//! use carrot_courier::amqp::configuration::RabbitMqSettings;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!
//!     // determine the maximum underlying connections.
//!     let max_connections = 4;
//!
//!     let connection_pool = ConnectionPool::builder(ConnectionFactory::new_from_config(&settings)?)
//!             .max_size(max_connections)
//!             .build()?;
//!
//!     let channel_factory = AmqpChannelFactory::new(connection_pool);
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::AmqpChannelFactory;
pub use connection::ConnectionPool;
pub use error::Error;
