//! In-memory transport used by unit tests.
use super::{ChannelFactory, PersistentChannelOptions, TransportChannel};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct FakeChannel {
    pub(crate) id: usize,
    pub(crate) publisher_confirms: bool,
    usable: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl TransportChannel for FakeChannel {
    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.usable.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub(crate) attempts: AtomicUsize,
    pub(crate) opened: AtomicUsize,
    pub(crate) closed: Arc<AtomicUsize>,
    pub(crate) failures_before_success: AtomicUsize,
    handles: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeFactory {
    /// Simulate a dropped connection: every channel opened so far becomes unusable.
    pub(crate) fn break_all(&self) {
        for usable in self.handles.lock().unwrap().iter() {
            usable.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl ChannelFactory for FakeFactory {
    type Channel = FakeChannel;

    async fn open_channel(
        &self,
        options: &PersistentChannelOptions,
    ) -> Result<FakeChannel, anyhow::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success
                .store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection refused");
        }
        let usable = Arc::new(AtomicBool::new(true));
        self.handles.lock().unwrap().push(usable.clone());
        Ok(FakeChannel {
            id: self.opened.fetch_add(1, Ordering::SeqCst),
            publisher_confirms: options.publisher_confirms,
            usable,
            closed: self.closed.clone(),
        })
    }
}
