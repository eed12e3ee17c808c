//! Watch registrations.
//!
//! The manager keeps at most one OS-level watch per URI, however many
//! subscribers ask for it, and fans every notification out to whoever is
//! subscribed when it arrives.
//!
//! # Locking
//! Each URI has its own slot guarded by an async mutex; the table of slots is
//! only locked for lookups, so unrelated URIs never wait on each other. A slot
//! whose registration has been torn down is marked retired and removed from
//! the table before its lock is released: anyone still holding a reference to
//! it looks the URI up again instead of reviving it.
//!
//! Every registration gets a fresh generation number. Delivery happens under
//! the slot lock and only while the slot's active generation matches the
//! dispatcher's, so once teardown has released the lock nothing from the old
//! watch can reach a subscriber.
//!
//! # Coalescing
//! Bursts are collapsed with a trailing-edge debounce: signals of the same
//! kind arriving within [`WatchOptions::debounce`] of each other produce one
//! event, stamped with the time of the last one. A burst that never pauses is
//! still flushed every [`MAX_HOLD_WINDOWS`] windows. A signal of a different kind
//! flushes whatever is pending first, so a `change` followed by a `delete`
//! always arrives as both, in that order. A zero window delivers every signal.

use crate::event::{WatchEvent, WatchNotification};
use crate::subscriber::{Subscriber, SubscriberId};
use parking_lot::Mutex;
use srcwatch_source::error::{ErrorKind, Result};
use srcwatch_source::{Capability, Registry, Resolved, SourceUri, WatchEventKind, WatchHandle, WatchSignal, WatchSink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// A source that never goes quiet still gets an event at least this many
/// debounce windows after the first signal of a burst.
pub const MAX_HOLD_WINDOWS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// Coalescing window; [`Duration::ZERO`] disables coalescing.
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE }
    }
}

/// Snapshot of a registration right after a successful start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchRegistration {
    pub uri: String,
    pub subscriber_count: usize,
    /// Whether this call established the OS watch (`false` when it joined an
    /// existing one).
    pub created: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to stop: the URI is not watched, or not by this subscriber.
    NotWatching,
    /// Other subscriptions keep the watch alive.
    Released { remaining: usize },
    /// That was the last subscription; the OS watch is closed.
    TornDown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failed: usize,
}

/// Owner of every live watch in the process.
///
/// Cheap to clone; clones share the same table. Call
/// [`shutdown()`](Self::shutdown) before exiting so OS handles are closed
/// deliberately rather than by drop order.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    options: WatchOptions,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    generations: AtomicU64,
}

struct Slot {
    uri: SourceUri,
    state: AsyncMutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    retired: bool,
    active: Option<Active>,
    subscribers: HashMap<SubscriberId, Subscription>,
}

struct Active {
    generation: u64,
    guard: WatchHandle,
    dispatcher: JoinHandle<()>,
}

struct Subscription {
    subscriber: Subscriber,
    /// A subscriber may start the same URI more than once; each start needs
    /// its own stop.
    count: usize,
}

impl SlotState {
    fn subscriber_count(&self) -> usize {
        self.subscribers.values().map(|subscription| subscription.count).sum()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active.as_ref().is_some_and(|active| active.generation == generation)
    }

    fn broadcast(&self, notification: &WatchNotification) {
        for subscription in self.subscribers.values() {
            if !subscription.subscriber.notify(notification.clone()) {
                tracing::trace!(subscriber = %subscription.subscriber.id(), "Subscriber hung up, notification dropped");
            }
        }
    }

    fn retire(&mut self) -> Option<Active> {
        self.retired = true;
        self.subscribers.clear();
        self.active.take()
    }
}

impl Active {
    /// Stop dispatching and close the OS watch. Returns `false` if closing
    /// failed; the handle is gone either way.
    fn release(self, uri: &SourceUri) -> bool {
        self.dispatcher.abort();
        match self.guard.close() {
            Ok(()) => {
                tracing::debug!(%uri, generation = self.generation, "Closed watch");
                true
            },
            Err(err) => {
                let kind: &ErrorKind = &err;
                tracing::warn!(%uri, error = %kind, "Failed to close watch");
                false
            },
        }
    }
}

impl Inner {
    fn slot(&self, uri: &SourceUri) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(uri.as_str().to_string())
            .or_insert_with(|| Arc::new(Slot { uri: uri.clone(), state: AsyncMutex::default() }));
        Arc::clone(slot)
    }

    fn lookup(&self, uri: &SourceUri) -> Option<Arc<Slot>> {
        self.slots.lock().get(uri.as_str()).cloned()
    }

    /// Drop `slot` from the table, unless it has already been replaced.
    fn forget(&self, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if slots.get(slot.uri.as_str()).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(slot.uri.as_str());
        }
    }

    fn snapshot(&self) -> Vec<Arc<Slot>> {
        self.slots.lock().values().cloned().collect()
    }
}

impl WatchManager {
    pub fn new(registry: Arc<Registry>, options: WatchOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                options,
                slots: Mutex::default(),
                generations: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn options(&self) -> WatchOptions {
        self.inner.options
    }

    /// Subscribe to `uri`, establishing the OS watch if nobody holds one yet.
    ///
    /// # Errors
    /// - [`UnsupportedCapability`](ErrorKind::UnsupportedCapability) when the
    ///   scheme's handler cannot watch. No OS watch is attempted.
    /// - [`Io`](ErrorKind::Io) when the OS refuses the watch. The subscriber
    ///   also receives a one-off [`WatchNotification::Error`], and the URI
    ///   stays unwatched.
    /// - [`InvalidUri`](ErrorKind::InvalidUri) /
    ///   [`UnknownScheme`](ErrorKind::UnknownScheme) from resolution.
    #[instrument(skip(self, subscriber), fields(subscriber = %subscriber.id()))]
    pub async fn start_watch(&self, uri: &str, subscriber: &Subscriber) -> Result<WatchRegistration> {
        let Resolved { uri, handler } = self.inner.registry.resolve(uri)?;
        if !handler.capabilities().can_watch {
            exn::bail!(ErrorKind::unsupported(handler.scheme(), Capability::Watch));
        }
        loop {
            let slot = self.inner.slot(&uri);
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }
            let created = state.active.is_none();
            if created {
                let (sink, signals) = WatchSink::channel();
                let guard = match handler.watch(&uri, sink).await {
                    Ok(guard) => guard,
                    Err(err) => {
                        state.retired = true;
                        self.inner.forget(&slot);
                        drop(state);
                        let kind: &ErrorKind = &err;
                        tracing::warn!(error = %kind, "Failed to establish watch");
                        subscriber.notify(WatchNotification::Error { uri: uri.to_string(), error: kind.to_string() });
                        return Err(err);
                    },
                };
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                let dispatcher = tokio::spawn(dispatch(
                    Arc::downgrade(&self.inner),
                    Arc::downgrade(&slot),
                    generation,
                    signals,
                    self.inner.options.debounce,
                ));
                state.active = Some(Active { generation, guard, dispatcher });
                tracing::debug!(generation, "Established watch");
            }
            state
                .subscribers
                .entry(subscriber.id())
                .or_insert_with(|| Subscription { subscriber: subscriber.clone(), count: 0 })
                .count += 1;
            return Ok(WatchRegistration { uri: uri.to_string(), subscriber_count: state.subscriber_count(), created });
        }
    }

    /// Drop one subscription of `subscriber` to `uri`, closing the OS watch
    /// when it was the last. Never fails; stopping something that is not
    /// watched is a no-op.
    #[instrument(skip(self, subscriber), fields(subscriber = %subscriber))]
    pub async fn stop_watch(&self, uri: &str, subscriber: SubscriberId) -> StopOutcome {
        let Ok(uri) = SourceUri::parse(uri) else {
            return StopOutcome::NotWatching;
        };
        let Some(slot) = self.inner.lookup(&uri) else {
            return StopOutcome::NotWatching;
        };
        let mut state = slot.state.lock().await;
        if state.retired {
            return StopOutcome::NotWatching;
        }
        let Some(subscription) = state.subscribers.get_mut(&subscriber) else {
            return StopOutcome::NotWatching;
        };
        subscription.count -= 1;
        if subscription.count == 0 {
            state.subscribers.remove(&subscriber);
        }
        let remaining = state.subscriber_count();
        if remaining > 0 {
            return StopOutcome::Released { remaining };
        }
        if let Some(active) = state.retire() {
            active.release(&slot.uri);
        }
        self.inner.forget(&slot);
        StopOutcome::TornDown
    }

    /// Drop every subscription held by `subscriber`, e.g. when its session
    /// ends. Returns how many URIs it was watching.
    #[instrument(skip(self, subscriber), fields(subscriber = %subscriber))]
    pub async fn unsubscribe_all(&self, subscriber: SubscriberId) -> usize {
        let mut released = 0;
        for slot in self.inner.snapshot() {
            let mut state = slot.state.lock().await;
            if state.retired || state.subscribers.remove(&subscriber).is_none() {
                continue;
            }
            released += 1;
            if state.subscribers.is_empty() {
                if let Some(active) = state.retire() {
                    active.release(&slot.uri);
                }
                self.inner.forget(&slot);
            }
        }
        released
    }

    /// URIs with a live OS watch, sorted.
    pub async fn active_watches(&self) -> Vec<String> {
        let mut uris = Vec::new();
        for slot in self.inner.snapshot() {
            if slot.state.lock().await.active.is_some() {
                uris.push(slot.uri.to_string());
            }
        }
        uris.sort();
        uris
    }

    /// Total outstanding subscriptions to `uri`; zero when unwatched.
    pub async fn subscriber_count(&self, uri: &str) -> usize {
        let Ok(uri) = SourceUri::parse(uri) else {
            return 0;
        };
        match self.inner.lookup(&uri) {
            Some(slot) => slot.state.lock().await.subscriber_count(),
            None => 0,
        }
    }

    /// Close every OS watch regardless of subscribers.
    ///
    /// Best effort: a watch that fails to close is counted and the sweep
    /// carries on. Calling it again (or with nothing watched) is harmless.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        let slots: Vec<Arc<Slot>> = self.inner.slots.lock().drain().map(|(_, slot)| slot).collect();
        let mut report = ShutdownReport::default();
        for slot in slots {
            let mut state = slot.state.lock().await;
            if let Some(active) = state.retire() {
                match active.release(&slot.uri) {
                    true => report.closed += 1,
                    false => report.failed += 1,
                }
            }
        }
        tracing::info!(closed = report.closed, failed = report.failed, "Watch manager shut down");
        report
    }
}

/// Same-kind signal held back by the debounce.
struct Pending {
    kind: WatchEventKind,
    at: OffsetDateTime,
    /// End of the quiet window; pushed back by every same-kind signal.
    quiet_until: Instant,
    /// Hard deadline, fixed when the burst started.
    flush_by: Instant,
}

/// Per-registration task: reads the handler's signals, coalesces them and
/// hands them to the slot's subscribers.
async fn dispatch(
    manager: Weak<Inner>,
    slot: Weak<Slot>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<WatchSignal>,
    debounce: Duration,
) {
    let mut pending: Option<Pending> = None;
    loop {
        let signal = match &pending {
            // Checked up front: a receiver that is always ready would never
            // let the timeout fire.
            Some(held) if Instant::now() >= held.flush_by => None,
            Some(held) => tokio::time::timeout_at(held.quiet_until.min(held.flush_by), signals.recv()).await.ok(),
            None => Some(signals.recv().await),
        };
        let Some(signal) = signal else {
            if let Some(held) = pending.take()
                && !deliver(&slot, generation, held.kind, held.at).await
            {
                return;
            }
            continue;
        };
        match signal {
            Some(WatchSignal::Event { kind, at }) => {
                if debounce.is_zero() {
                    if !deliver(&slot, generation, kind, at).await {
                        return;
                    }
                    continue;
                }
                let now = Instant::now();
                match pending.as_mut() {
                    Some(held) if held.kind == kind => {
                        held.at = at;
                        held.quiet_until = now + debounce;
                    },
                    _ => {
                        if let Some(held) = pending.take()
                            && !deliver(&slot, generation, held.kind, held.at).await
                        {
                            return;
                        }
                        pending = Some(Pending {
                            kind,
                            at,
                            quiet_until: now + debounce,
                            flush_by: now + debounce * MAX_HOLD_WINDOWS,
                        });
                    },
                }
            },
            Some(WatchSignal::Error(error)) => {
                if let Some(held) = pending.take() {
                    deliver(&slot, generation, held.kind, held.at).await;
                }
                fail(&manager, &slot, generation, error).await;
                return;
            },
            None => {
                if let Some(held) = pending.take() {
                    deliver(&slot, generation, held.kind, held.at).await;
                }
                return;
            },
        }
    }
}

/// Returns `false` once the registration is gone.
async fn deliver(slot: &Weak<Slot>, generation: u64, kind: WatchEventKind, timestamp: OffsetDateTime) -> bool {
    let Some(slot) = slot.upgrade() else {
        return false;
    };
    let state = slot.state.lock().await;
    if !state.is_current(generation) {
        return false;
    }
    tracing::trace!(uri = %slot.uri, %kind, subscribers = state.subscribers.len(), "Delivering watch event");
    state.broadcast(&WatchNotification::Event(WatchEvent { uri: slot.uri.to_string(), kind, timestamp }));
    true
}

/// The OS watch died: tell every subscriber once, then tear it down.
async fn fail(manager: &Weak<Inner>, slot: &Weak<Slot>, generation: u64, error: String) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut state = slot.state.lock().await;
    if !state.is_current(generation) {
        return;
    }
    tracing::warn!(uri = %slot.uri, %error, "Watch failed, tearing down");
    state.broadcast(&WatchNotification::Error { uri: slot.uri.to_string(), error });
    if let Some(active) = state.retire() {
        active.release(&slot.uri);
    }
    if let Some(manager) = manager.upgrade() {
        manager.forget(&slot);
    }
}
