//! Persistent channels: long-lived wrappers around transport channels that heal themselves
//! when the underlying channel breaks.
mod persistent;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use persistent::{ChannelState, PersistentChannel, PersistentChannelAction, RecreateBackoff};
pub use transport::{ChannelFactory, PersistentChannelOptions, TransportChannel};
