//! In-memory scheme handler for testing.

use crate::capability::{Capabilities, Capability};
use crate::error::{ErrorKind, Result};
use crate::handler::{OpenedSource, SchemeHandler, WatchEventKind, WatchGuard, WatchHandle, WatchSink};
use crate::hash::{ContentHash, hash_bytes};
use crate::metadata::{Metadata, extension_of, mime_for};
use crate::uri::SourceUri;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

/// In-memory scheme handler for testing.
///
/// Sources live in a map keyed by their normalized URI. Watches are not
/// backed by anything: tests inject notifications with
/// [`trigger()`](Self::trigger) and can count how many watches were opened
/// and closed, which is what makes "exactly one underlying watch" assertions
/// possible without a real filesystem.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct MockHandler {
    scheme: String,
    capabilities: Capabilities,
    latency: Duration,
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    files: RwLock<HashMap<String, (OffsetDateTime, Vec<u8>)>>,
    sinks: Mutex<HashMap<String, Vec<(u64, WatchSink)>>>,
    next_watch: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_next_watch: AtomicBool,
    fail_next_close: AtomicBool,
}

impl MockHandler {
    /// Create an empty handler for `scheme` supporting everything.
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into().to_lowercase(),
            capabilities: Capabilities::ALL,
            latency: Duration::ZERO,
            state: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Delay every metadata, open and hash call, like a slow disk or network.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Pre-populate sources.
    ///
    /// Panics if any URI fails to parse. If test setup is wrong, then test
    /// should not pass.
    #[must_use]
    pub fn with_files(self, files: impl IntoIterator<Item = (impl AsRef<str>, impl Into<Vec<u8>>)>) -> Self {
        for (uri, data) in files {
            self.insert(uri.as_ref(), data);
        }
        self
    }

    /// Add or replace a source.
    pub fn insert(&self, uri: &str, data: impl Into<Vec<u8>>) {
        let Ok(parsed) = SourceUri::parse(uri) else {
            // The panic here is DELIBERATE. MockHandler is intended to be
            // used in tests; panics are expected. There is no error result.
            panic!("MockHandler::insert: invalid uri {uri}");
        };
        let now = OffsetDateTime::now_utc();
        self.state.files.write().insert(parsed.as_str().to_string(), (now, data.into()));
    }

    /// Remove a source. Does not notify watchers; use [`trigger()`](Self::trigger).
    pub fn remove(&self, uri: &SourceUri) -> bool {
        self.state.files.write().remove(uri.as_str()).is_some()
    }

    /// Push a notification to every live watch on `uri`. Returns how many
    /// watches received it.
    pub fn trigger(&self, uri: &SourceUri, kind: WatchEventKind) -> usize {
        let sinks = self.state.sinks.lock();
        sinks.get(uri.as_str()).map(|list| list.iter().filter(|(_, sink)| sink.emit(kind)).count()).unwrap_or(0)
    }

    /// Report a failure from every live watch on `uri`.
    pub fn fail(&self, uri: &SourceUri, message: &str) -> usize {
        let sinks = self.state.sinks.lock();
        sinks.get(uri.as_str()).map(|list| list.iter().filter(|(_, sink)| sink.fail(message)).count()).unwrap_or(0)
    }

    /// Make the next [`watch()`](SchemeHandler::watch) call fail as if the OS
    /// refused it.
    pub fn fail_next_watch(&self) {
        self.state.fail_next_watch.store(true, Ordering::SeqCst);
    }

    /// Make the next watch close report an error. The watch is released
    /// anyway, like a native handle whose teardown failed.
    pub fn fail_next_close(&self) {
        self.state.fail_next_close.store(true, Ordering::SeqCst);
    }

    /// Number of watches ever established.
    pub fn watches_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Number of watches released (closed or dropped).
    pub fn watches_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Number of watches currently alive.
    pub fn live_watches(&self) -> usize {
        self.state.sinks.lock().values().map(Vec::len).sum()
    }

    async fn stall(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn get(&self, uri: &SourceUri) -> Result<(OffsetDateTime, Vec<u8>)> {
        match self.state.files.read().get(uri.as_str()) {
            Some(entry) => Ok(entry.clone()),
            None => exn::bail!(ErrorKind::io(uri.address(), IoError::new(IoErrorKind::NotFound, "no such source"))),
        }
    }
}

#[async_trait]
impl SchemeHandler for MockHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn extract_metadata(&self, uri: &SourceUri) -> Result<Metadata> {
        self.stall().await;
        let (inserted, data) = self.get(uri)?;
        let address = Path::new(uri.address());
        let extension = extension_of(address);
        Ok(Metadata {
            name: address.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            size: data.len() as u64,
            mime_type: mime_for(&extension),
            extension,
            is_directory: false,
            is_file: true,
            is_symlink: false,
            permissions: 0o644,
            created_at: inserted,
            modified_at: inserted,
            uid: None,
            gid: None,
            extra: BTreeMap::new(),
        })
    }

    async fn open(&self, uri: &SourceUri) -> Result<OpenedSource> {
        if !self.capabilities.can_open {
            exn::bail!(ErrorKind::unsupported(&self.scheme, Capability::Open));
        }
        self.stall().await;
        let (_, data) = self.get(uri)?;
        let size = Some(data.len() as u64);
        Ok(OpenedSource { reader: Box::new(Cursor::new(data)), size })
    }

    async fn hash(&self, uri: &SourceUri) -> Result<ContentHash> {
        self.stall().await;
        let (_, data) = self.get(uri)?;
        Ok(hash_bytes(&data))
    }

    async fn watch(&self, uri: &SourceUri, sink: WatchSink) -> Result<WatchHandle> {
        if !self.capabilities.can_watch {
            exn::bail!(ErrorKind::unsupported(&self.scheme, Capability::Watch));
        }
        self.get(uri)?;
        if self.state.fail_next_watch.swap(false, Ordering::SeqCst) {
            exn::bail!(ErrorKind::io(uri.address(), IoError::new(IoErrorKind::PermissionDenied, "watch refused")));
        }
        let id = self.state.next_watch.fetch_add(1, Ordering::SeqCst);
        let key = uri.as_str().to_string();
        self.state.sinks.lock().entry(key.clone()).or_default().push((id, sink));
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockGuard { state: Arc::clone(&self.state), key, id, released: false }))
    }
}

struct MockGuard {
    state: Arc<MockState>,
    key: String,
    id: u64,
    released: bool,
}

impl MockGuard {
    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let mut sinks = self.state.sinks.lock();
        if let Some(list) = sinks.get_mut(&self.key) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                sinks.remove(&self.key);
            }
        }
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl WatchGuard for MockGuard {
    fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        if self.state.fail_next_close.swap(false, Ordering::SeqCst) {
            exn::bail!(ErrorKind::io(&self.key, IoError::other("watch teardown failed")));
        }
        Ok(())
    }
}

impl Drop for MockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
