use crate::event::WatchNotification;
use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Opaque identity of a logical watcher (a client session, a CLI run).
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("subscriber-{_0}")]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A delivery target for watch notifications.
///
/// Cloning shares the underlying channel.
#[derive(Clone, Debug)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<WatchNotification>,
}

impl Subscriber {
    pub fn channel(id: SubscriberId) -> (Self, mpsc::UnboundedReceiver<WatchNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns `false` if the receiving end is gone.
    pub(crate) fn notify(&self, notification: WatchNotification) -> bool {
        self.tx.send(notification).is_ok()
    }
}
