//! Dispatch of client commands over pools of persistent channels.
//!
//! [`ClientCommandDispatcher`] keeps one pool of [`PersistentChannel`]s per distinct
//! [`DispatchOptions`]. Pools are created lazily, exactly once per key, and hold a fixed number
//! of channels. Every command checks a channel out of the right pool, runs against it and puts
//! it back, whatever the outcome.
//!
//! ```rust
//! use carrot_courier::amqp::configuration::RabbitMqSettings;
//! use carrot_courier::amqp::ConnectionFactory;
//! use carrot_courier::commands::DeclareQueue;
//! use carrot_courier::dispatcher::{ClientCommandDispatcher, DispatchOptions, DispatcherSettings};
//! use carrot_courier::pool::{AmqpChannelFactory, ConnectionPool};
//! use tokio_util::sync::CancellationToken;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let connection_pool = ConnectionPool::builder(ConnectionFactory::new_from_config(&settings)?)
//!         .max_size(2)
//!         .build()?;
//!
//!     let dispatcher = ClientCommandDispatcher::new(
//!         AmqpChannelFactory::new(connection_pool),
//!         &DispatcherSettings::default(),
//!     )?;
//!
//!     dispatcher
//!         .invoke(
//!             DeclareQueue::durable("orders"),
//!             DispatchOptions::without_publisher_confirms(),
//!             &CancellationToken::new(),
//!         )
//!         .await?;
//!
//!     dispatcher.dispose().await;
//!     Ok(())
//! }
//! ```
mod command;
mod settings;

pub use command::ClientCommand;
pub use settings::{DispatchOptions, DispatcherSettings};

use crate::channel::{ChannelFactory, PersistentChannel, RecreateBackoff};
use crate::error::DispatchError;
use crate::queue::AsyncQueue;
use command::CommandAction;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ChannelPool<F> = AsyncQueue<PersistentChannel<F>>;

/// Invokes client commands using multiple pooled channels.
///
/// # Concurrency
///
/// At most `channels_count` commands run at the same time for a given [`DispatchOptions`].
/// Callers in excess wait, without blocking a thread, for a channel to be returned: the one
/// that started waiting first is served first.
///
/// # Teardown
///
/// [`ClientCommandDispatcher::dispose`] closes every pooled channel. Channels checked out by
/// in-flight commands are closed by those commands when they complete.
/// Commands dispatched afterwards fail with [`DispatchError::Disposed`].
pub struct ClientCommandDispatcher<F: ChannelFactory> {
    factory: Arc<F>,
    channels_count: usize,
    backoff: RecreateBackoff,
    registry: Mutex<Registry<F>>,
}

struct Registry<F: ChannelFactory> {
    pools: HashMap<DispatchOptions, Arc<ChannelPool<F>>>,
    disposed: bool,
}

impl<F: ChannelFactory> ClientCommandDispatcher<F> {
    /// Create a dispatcher opening channels through `factory`.
    ///
    /// It fails if `settings.channels_count` is zero.
    pub fn new(factory: F, settings: &DispatcherSettings) -> Result<Self, anyhow::Error> {
        anyhow::ensure!(
            settings.channels_count > 0,
            "The number of channels per pool must be positive"
        );
        Ok(Self {
            factory: Arc::new(factory),
            channels_count: settings.channels_count,
            backoff: settings.recreate_backoff(),
            registry: Mutex::new(Registry {
                pools: HashMap::new(),
                disposed: false,
            }),
        })
    }

    /// Run `command` on a channel checked out of the pool matching `options`.
    ///
    /// The channel goes back to its pool once the command completes, fails or is cancelled.
    /// The command's outcome is returned unchanged: nothing is retried.
    #[tracing::instrument(
        name = "dispatch_command",
        skip(self, command, cancellation),
        fields(publisher_confirms = options.publisher_confirms)
    )]
    pub async fn invoke<C>(
        &self,
        command: C,
        options: DispatchOptions,
        cancellation: &CancellationToken,
    ) -> Result<C::Output, DispatchError>
    where
        C: ClientCommand<F::Channel>,
    {
        let pool = self.pool(options)?;
        let channel = pool.dequeue(cancellation).await?;
        let mut checkout = Checkout {
            pool,
            channel,
            released: false,
        };

        let outcome = checkout
            .channel
            .invoke(CommandAction(command), cancellation)
            .await;
        checkout.release().await;
        outcome
    }

    /// Get the pool for `options`, creating and populating it if this is the first time
    /// these options are used.
    fn pool(&self, options: DispatchOptions) -> Result<Arc<ChannelPool<F>>, DispatchError> {
        let mut registry = self.lock();
        if registry.disposed {
            return Err(DispatchError::Disposed);
        }
        let pool = registry.pools.entry(options).or_insert_with(|| {
            debug!(
                ?options,
                channels_count = self.channels_count,
                "Creating a new channel pool"
            );
            let channels = (0..self.channels_count).map(|_| {
                PersistentChannel::new(self.factory.clone(), options.into(), self.backoff)
            });
            // A channel can be handed to a caller that gives up after the pool is disposed.
            Arc::new(AsyncQueue::with_orphan_handler(
                channels,
                |channel: PersistentChannel<F>| {
                    debug!("A channel outlived its disposed pool, closing it");
                    channel.dispose_detached();
                },
            ))
        });
        Ok(Arc::clone(pool))
    }

    /// The number of channels currently available in the pool for `options`.
    ///
    /// It returns `None` if no pool has been created for `options` (yet).
    pub fn available_channels(&self, options: DispatchOptions) -> Option<usize> {
        self.lock().pools.get(&options).map(|pool| pool.len())
    }

    /// The number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.lock().pools.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Tear the dispatcher down: stop creating pools, then drain every pool and close each
    /// channel in it.
    #[tracing::instrument(name = "dispatcher_dispose", skip_all)]
    pub async fn dispose(&self) {
        let pools: Vec<_> = {
            let mut registry = self.lock();
            registry.disposed = true;
            registry.pools.drain().collect()
        };

        for (options, pool) in pools {
            pool.dispose();
            let mut disposed = 0usize;
            while let Some(channel) = pool.try_dequeue() {
                channel.dispose().await;
                disposed += 1;
            }
            debug!(?options, disposed, "Disposed channel pool");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<F>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A channel checked out of its pool.
///
/// The channel is handed back when the checkout is released or, if the invocation future is
/// dropped half-way, when the checkout is dropped.
struct Checkout<F: ChannelFactory> {
    pool: Arc<ChannelPool<F>>,
    channel: PersistentChannel<F>,
    released: bool,
}

impl<F: ChannelFactory> Checkout<F> {
    async fn release(mut self) {
        self.released = true;
        if let Err(channel) = self.pool.enqueue(self.channel.take()) {
            debug!("The pool was disposed while the channel was checked out, closing it");
            channel.dispose().await;
        }
    }
}

impl<F: ChannelFactory> Drop for Checkout<F> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(channel) = self.pool.enqueue(self.channel.take()) {
            channel.dispose_detached();
        }
    }
}
