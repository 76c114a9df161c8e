/// Error returned when dispatching a command through a
/// [`ClientCommandDispatcher`](crate::dispatcher::ClientCommandDispatcher).
///
/// Resource-management failures are handled internally wherever possible (broken channels are
/// recreated, checked-out channels always return to their pool): what reaches the caller is
/// either a cancellation, a channel that could not be brought back in time, a teardown or the
/// failure of the command itself.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("The operation was cancelled by the caller")]
    Cancelled,
    #[error("Failed to (re)establish a usable channel before the operation was cancelled")]
    ChannelUnavailable(#[source] anyhow::Error),
    #[error("The command failed while executing against the RabbitMq broker")]
    CommandFailed(#[source] anyhow::Error),
    #[error("The dispatcher has already been disposed")]
    Disposed,
}

impl DispatchError {
    /// `true` if the command itself ran and failed, as opposed to the dispatching machinery.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailed(_))
    }
}
