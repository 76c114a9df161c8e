use crate::channel::{PersistentChannelOptions, RecreateBackoff};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

/// The subset of execution parameters that determines which pool of channels a command
/// must be dispatched to.
///
/// Equality is value-based: two commands dispatched with equal options always share the same
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub struct DispatchOptions {
    /// Whether the command requires the broker to confirm publishes.
    pub publisher_confirms: bool,
}

impl DispatchOptions {
    /// Options for commands that need publisher confirmations.
    pub fn with_publisher_confirms() -> Self {
        Self {
            publisher_confirms: true,
        }
    }

    /// Options for commands that do not need publisher confirmations.
    pub fn without_publisher_confirms() -> Self {
        Self {
            publisher_confirms: false,
        }
    }
}

impl From<DispatchOptions> for PersistentChannelOptions {
    fn from(options: DispatchOptions) -> Self {
        Self {
            publisher_confirms: options.publisher_confirms,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Configuration for a [`ClientCommandDispatcher`](super::ClientCommandDispatcher).
pub struct DispatcherSettings {
    /// How many channels each pool holds. There is one pool per distinct [`DispatchOptions`].
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub channels_count: usize,
    /// Delay before the second attempt at (re)opening a broken channel, in milliseconds.
    /// It doubles after each failed attempt.
    pub recreate_initial_backoff_ms: Option<u64>,
    /// Upper bound for the delay between two attempts at (re)opening a broken channel,
    /// in milliseconds.
    pub recreate_max_backoff_ms: Option<u64>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            channels_count: 10,
            recreate_initial_backoff_ms: None,
            recreate_max_backoff_ms: None,
        }
    }
}

impl DispatcherSettings {
    /// Backoff between channel recreation attempts, falling back to
    /// [`RecreateBackoff::default`] for unspecified values.
    pub fn recreate_backoff(&self) -> RecreateBackoff {
        let default = RecreateBackoff::default();
        RecreateBackoff {
            initial: self
                .recreate_initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(default.initial),
            max: self
                .recreate_max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(default.max),
        }
    }
}
