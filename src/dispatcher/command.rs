use crate::channel::PersistentChannelAction;

/// A unit of work to be executed against a transport channel checked out of a pool.
///
/// The dispatcher is agnostic to what a command does: anything that can run itself against a
/// channel and produce an output can be dispatched. Commands are consumed by value and invoked
/// at most once.
///
/// # Example
///
/// ```rust
/// use carrot_courier::dispatcher::ClientCommand;
///
/// struct IsOpen;
///
/// #[async_trait::async_trait]
/// impl ClientCommand<lapin::Channel> for IsOpen {
///     type Output = bool;
///
///     async fn invoke(self, channel: &lapin::Channel) -> Result<bool, anyhow::Error> {
///         Ok(channel.status().connected())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ClientCommand<H: Sync + ?Sized>: Send {
    type Output: Send;

    async fn invoke(self, channel: &H) -> Result<Self::Output, anyhow::Error>;
}

/// Adapts a [`ClientCommand`] into a [`PersistentChannelAction`], so that persistent channels
/// do not need to know about command types.
pub(super) struct CommandAction<C>(pub(super) C);

#[async_trait::async_trait]
impl<H, C> PersistentChannelAction<H> for CommandAction<C>
where
    H: Sync + ?Sized,
    C: ClientCommand<H>,
{
    type Output = C::Output;

    async fn invoke(self, channel: &H) -> Result<C::Output, anyhow::Error> {
        self.0.invoke(channel).await
    }
}
