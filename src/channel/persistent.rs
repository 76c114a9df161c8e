use super::transport::{ChannelFactory, PersistentChannelOptions, TransportChannel};
use crate::error::DispatchError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An action to be run against a transport channel.
///
/// [`PersistentChannel`] only knows about actions: the dispatcher adapts client commands into
/// actions, so the channel never needs to know which command it is running.
#[async_trait::async_trait]
pub trait PersistentChannelAction<H: Sync + ?Sized>: Send {
    type Output: Send;

    async fn invoke(self, channel: &H) -> Result<Self::Output, anyhow::Error>;
}

/// Where a [`PersistentChannel`] is in its recovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The underlying handle was usable the last time it was looked at.
    Healthy,
    /// There is no usable handle: it will be recreated on the next invocation.
    Broken,
    /// A new handle is being opened.
    Recreating,
}

/// Delays observed between two attempts at opening a transport channel.
///
/// The delay starts at `initial` and doubles after every failed attempt, up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct RecreateBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RecreateBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(5),
        }
    }
}

/// A long-lived wrapper around a single transport channel.
///
/// The underlying handle is opened lazily and replaced transparently if it breaks (e.g. the
/// connection with the broker dropped): the identity of the `PersistentChannel`, and therefore
/// its membership of a pool, never changes.
///
/// # Exclusive access
///
/// Invocations take `&mut self`. The pool hands a channel to a single borrower at a time,
/// so there is no locking inside the wrapper.
pub struct PersistentChannel<F: ChannelFactory> {
    factory: Arc<F>,
    options: PersistentChannelOptions,
    backoff: RecreateBackoff,
    handle: Option<F::Channel>,
    state: ChannelState,
}

impl<F: ChannelFactory> PersistentChannel<F> {
    /// Create a new persistent channel. No transport channel is opened until the first
    /// invocation.
    pub fn new(factory: Arc<F>, options: PersistentChannelOptions, backoff: RecreateBackoff) -> Self {
        Self {
            factory,
            options,
            backoff,
            handle: None,
            state: ChannelState::Broken,
        }
    }

    pub fn options(&self) -> PersistentChannelOptions {
        self.options
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Run `action` against the current transport channel and return its result.
    ///
    /// If the channel is missing or no longer usable a new one is opened first, retrying with
    /// exponential backoff until it succeeds or `cancellation` fires
    /// ([`DispatchError::ChannelUnavailable`]).
    /// A failure of the action is returned as [`DispatchError::CommandFailed`].
    #[tracing::instrument(
        name = "persistent_channel_invoke",
        skip_all,
        fields(publisher_confirms = self.options.publisher_confirms)
    )]
    pub async fn invoke<A>(
        &mut self,
        action: A,
        cancellation: &CancellationToken,
    ) -> Result<A::Output, DispatchError>
    where
        A: PersistentChannelAction<F::Channel>,
    {
        self.ensure_usable(cancellation).await?;
        let handle = match self.handle.as_ref() {
            Some(handle) => handle,
            None => {
                return Err(DispatchError::ChannelUnavailable(anyhow::anyhow!(
                    "The channel handle disappeared after being recreated"
                )))
            }
        };

        let outcome = tokio::select! {
            biased;

            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
            result = action.invoke(handle) => result.map_err(DispatchError::CommandFailed),
        };

        if !handle.is_usable() {
            debug!("The channel is no longer usable, it will be recreated on next use");
            self.state = ChannelState::Broken;
        }
        outcome
    }

    /// Make sure `self.handle` holds a usable transport channel.
    async fn ensure_usable(&mut self, cancellation: &CancellationToken) -> Result<(), DispatchError> {
        if let Some(handle) = &self.handle {
            if handle.is_usable() {
                self.state = ChannelState::Healthy;
                return Ok(());
            }
        }

        self.state = ChannelState::Broken;
        if let Some(stale) = self.handle.take() {
            close_quietly(stale).await;
        }

        self.state = ChannelState::Recreating;
        let mut delay = self.backoff.initial;
        let mut attempt: u32 = 0;
        let last_error = loop {
            attempt += 1;
            let opened = tokio::select! {
                biased;

                _ = cancellation.cancelled() => None,
                result = self.factory.open_channel(&self.options) => Some(result),
            };
            let error = match opened {
                None => break None,
                Some(Ok(handle)) => {
                    self.handle = Some(handle);
                    self.state = ChannelState::Healthy;
                    return Ok(());
                }
                Some(Err(e)) => e,
            };
            warn!(
                attempt,
                error = ?error,
                "Failed to open a RabbitMq channel, retrying in {:?}",
                delay
            );

            tokio::select! {
                biased;

                _ = cancellation.cancelled() => break Some(error),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.backoff.max);
        };

        self.state = ChannelState::Broken;
        let error = last_error
            .unwrap_or_else(|| anyhow::anyhow!("No attempt to open a channel completed"))
            .context(format!(
                "Cancelled while (re)creating a RabbitMq channel, after {attempt} attempt(s)"
            ));
        Err(DispatchError::ChannelUnavailable(error))
    }

    /// Move the transport handle, and the recovery state, into a new `PersistentChannel`.
    ///
    /// `self` is left without a handle: it would open a new one if it were invoked again.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            options: self.options,
            backoff: self.backoff,
            handle: self.handle.take(),
            state: std::mem::replace(&mut self.state, ChannelState::Broken),
        }
    }

    /// Release the underlying transport channel.
    ///
    /// Errors raised while closing an already broken channel are logged and suppressed.
    pub async fn dispose(mut self) {
        if let Some(handle) = self.handle.take() {
            close_quietly(handle).await;
        }
    }

    /// Release the underlying transport channel in the background, if a runtime is available.
    pub(crate) fn dispose_detached(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(self.dispose());
            }
            Err(_) => warn!("No tokio runtime available, dropping a channel without closing it"),
        }
    }
}

async fn close_quietly<C: TransportChannel>(handle: C) {
    if !handle.is_usable() {
        return;
    }
    if let Err(e) = handle.close().await {
        warn!(error = ?e, "Failed to close a RabbitMq channel");
    }
}
