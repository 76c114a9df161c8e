//! An asynchronous multi-producer/multi-consumer queue of ready-to-use resources.
//!
//! [`AsyncQueue`] is the only synchronisation primitive guarding channel ownership: an item that
//! has been dequeued belongs exclusively to whoever dequeued it until it is enqueued again.
use crate::error::DispatchError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A queue of resources supporting non-blocking enqueue and suspend-until-available dequeue.
///
/// # Fairness
///
/// Consumers that have to wait are served in the order they started waiting: the earliest
/// waiter receives the next enqueued item. No ordering is guaranteed among enqueues.
///
/// # Teardown
///
/// After [`AsyncQueue::dispose`] every suspended consumer is woken up with
/// [`DispatchError::Disposed`] and [`AsyncQueue::enqueue`] hands items back to the caller.
/// Items still sitting in the queue can be drained with [`AsyncQueue::try_dequeue`].
/// An item that was handed to a waiter which then gave up after disposal can no longer go
/// back into the queue: it is passed to the orphan handler set with
/// [`AsyncQueue::with_orphan_handler`], if any, so that its owner can release it.
pub struct AsyncQueue<T> {
    state: Mutex<State<T>>,
    orphan_handler: Option<Box<dyn Fn(T) + Send + Sync>>,
}

struct State<T> {
    items: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    disposed: bool,
}

impl<T> AsyncQueue<T> {
    /// Create a queue pre-populated with `items`.
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            state: Mutex::new(State {
                items: items.into_iter().collect(),
                waiters: VecDeque::new(),
                disposed: false,
            }),
            orphan_handler: None,
        }
    }

    /// Create a queue pre-populated with `items`, handing items orphaned after disposal to
    /// `handler`.
    pub fn with_orphan_handler(
        items: impl IntoIterator<Item = T>,
        handler: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            orphan_handler: Some(Box::new(handler)),
            ..Self::new(items)
        }
    }

    /// Make `item` available to the earliest waiting consumer or, if nobody is waiting, to the
    /// next consumer calling [`AsyncQueue::dequeue`].
    ///
    /// It returns the item back as `Err` if the queue has already been disposed: the caller
    /// is then responsible for getting rid of it.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.disposed {
            return Err(item);
        }
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            // A waiter whose receiver is gone (cancelled or dropped) hands the item back.
            match waiter.send(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Take an item out of the queue, suspending until one is available.
    ///
    /// Fails with [`DispatchError::Cancelled`] if `cancellation` fires first and with
    /// [`DispatchError::Disposed`] if the queue is torn down while waiting.
    /// In both cases the caller holds nothing and no item is lost.
    pub async fn dequeue(&self, cancellation: &CancellationToken) -> Result<T, DispatchError> {
        let receiver = {
            let mut state = self.lock();
            if state.disposed {
                return Err(DispatchError::Disposed);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut waiter = Waiter {
            queue: self,
            receiver,
        };
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
            item = &mut waiter.receiver => item.map_err(|_| DispatchError::Disposed),
        }
    }

    /// Take an item out of the queue if one is immediately available.
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// The number of items currently available.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of consumers currently suspended in [`AsyncQueue::dequeue`].
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Wake every waiting consumer with [`DispatchError::Disposed`] and stop accepting items.
    ///
    /// Items already in the queue stay there: drain them with [`AsyncQueue::try_dequeue`].
    pub fn dispose(&self) {
        let mut state = self.lock();
        state.disposed = true;
        state.waiters.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A consumer suspended in [`AsyncQueue::dequeue`].
///
/// If the wait is abandoned (cancellation or the future being dropped) right after an item
/// was handed over, the item goes back into the queue.
struct Waiter<'a, T> {
    queue: &'a AsyncQueue<T>,
    receiver: oneshot::Receiver<T>,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Ok(item) = self.receiver.try_recv() {
            if let Err(item) = self.queue.enqueue(item) {
                match &self.queue.orphan_handler {
                    Some(handler) => handler(item),
                    None => tracing::warn!(
                        "Dropping an item handed to an abandoned waiter of a disposed queue"
                    ),
                }
            }
        }
    }
}
