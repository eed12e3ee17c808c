//! Scheme handler trait and implementations.
//!
//! This module defines the `SchemeHandler` trait, which provides a unified
//! interface for the operations a source supports (metadata extraction,
//! opening, hashing, watching), whatever scheme addresses it. Handlers are
//! never addressed directly by callers: they are reached through the
//! [`Registry`](crate::Registry).

mod file;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::file::FileHandler;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockHandler;
use crate::capability::{Capabilities, Capability};
use crate::error::{ErrorKind, Result};
use crate::hash::ContentHash;
use crate::metadata::Metadata;
use crate::uri::SourceUri;
use async_trait::async_trait;
use derive_more::Display;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Shared handle to a registered handler.
pub type HandlerRef = Arc<dyn SchemeHandler>;
/// Boxed async reader over a source's bytes.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed guard keeping an OS-level watch alive.
pub type WatchHandle = Box<dyn WatchGuard>;

/// A source opened for streaming reads.
pub struct OpenedSource {
    pub reader: SourceReader,
    /// Total size, when the scheme knows it up front.
    pub size: Option<u64>,
}

impl std::fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSource").field("size", &self.size).finish_non_exhaustive()
    }
}

/// The two things a watcher ever reports.
///
/// Whatever the OS calls it (rename, attribute change, truncate, unlink),
/// handlers fold it into one of these before it leaves the handler.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    #[display("change")]
    Change,
    #[display("delete")]
    Delete,
}

/// Raw output of a handler's watch, before fan-out.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchSignal {
    Event { kind: WatchEventKind, at: OffsetDateTime },
    /// The OS watch failed after it was established.
    Error(String),
}

/// Where a handler's watch pushes its signals.
///
/// Sending never blocks, so it is safe to call from the OS notification
/// thread. Signals keep the order in which they were sent.
#[derive(Clone, Debug)]
pub struct WatchSink {
    tx: mpsc::UnboundedSender<WatchSignal>,
}

impl WatchSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatchSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a normalized event. Returns `false` once nobody is listening.
    pub fn emit(&self, kind: WatchEventKind) -> bool {
        let at = OffsetDateTime::now_utc();
        self.tx.send(WatchSignal::Event { kind, at }).is_ok()
    }

    /// Report a failure of the underlying watch.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx.send(WatchSignal::Error(message.into())).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An established OS-level watch.
///
/// Dropping the guard releases the watch; [`close()`](Self::close) does the
/// same but reports failures.
pub trait WatchGuard: Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// Unified interface for scheme handlers.
///
/// Every operation has a default implementation failing with
/// [`UnsupportedCapability`](ErrorKind::UnsupportedCapability), so a handler
/// for a scheme that can only, say, extract metadata implements that one
/// method and declares matching [`Capabilities`].
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use srcwatch_source::{Capabilities, SchemeHandler, SourceUri};
///
/// struct Https;
///
/// #[async_trait]
/// impl SchemeHandler for Https {
///     fn scheme(&self) -> &str {
///         "https"
///     }
///     fn capabilities(&self) -> Capabilities {
///         Capabilities::NONE.with_preview(true)
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let uri = SourceUri::parse("https://example.com/a.png").unwrap();
/// assert!(Https.hash(&uri).await.is_err());
/// # }
/// ```
#[async_trait]
pub trait SchemeHandler: Send + Sync {
    /// Lowercase scheme this handler serves, without the trailing `:`.
    fn scheme(&self) -> &str;

    /// Declared once; never changes over the handler's lifetime.
    fn capabilities(&self) -> Capabilities;

    /// Produce a fresh metadata record for the source.
    async fn extract_metadata(&self, _uri: &SourceUri) -> Result<Metadata> {
        exn::bail!(ErrorKind::unsupported(self.scheme(), Capability::ExtractMetadata))
    }

    /// Open the source for streaming reads.
    async fn open(&self, _uri: &SourceUri) -> Result<OpenedSource> {
        exn::bail!(ErrorKind::unsupported(self.scheme(), Capability::Open))
    }

    /// Content hash of the source's bytes.
    async fn hash(&self, _uri: &SourceUri) -> Result<ContentHash> {
        exn::bail!(ErrorKind::unsupported(self.scheme(), Capability::Hash))
    }

    /// Establish an OS-level watch, pushing normalized signals into `sink`
    /// until the returned guard is closed or dropped.
    async fn watch(&self, _uri: &SourceUri, _sink: WatchSink) -> Result<WatchHandle> {
        exn::bail!(ErrorKind::unsupported(self.scheme(), Capability::Watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl SchemeHandler for Bare {
        fn scheme(&self) -> &str {
            "bare"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::NONE
        }
    }

    #[tokio::test]
    async fn test_defaults_are_unsupported() {
        let uri = SourceUri::parse("bare:thing").unwrap();
        let (sink, _rx) = WatchSink::channel();
        let expect = |capability: Capability, kind: &ErrorKind| {
            assert!(
                matches!(kind, ErrorKind::UnsupportedCapability { scheme, capability: c } if scheme == "bare" && *c == capability),
                "{kind:?}"
            );
        };
        expect(Capability::ExtractMetadata, &*Bare.extract_metadata(&uri).await.unwrap_err());
        expect(Capability::Open, &*Bare.open(&uri).await.unwrap_err());
        expect(Capability::Hash, &*Bare.hash(&uri).await.unwrap_err());
        expect(Capability::Watch, &*Bare.watch(&uri, sink).await.err().unwrap());
    }

    #[test]
    fn test_sink_order_and_close() {
        let (sink, mut rx) = WatchSink::channel();
        assert!(sink.emit(WatchEventKind::Change));
        assert!(sink.fail("gone"));
        assert!(sink.emit(WatchEventKind::Delete));
        assert!(matches!(rx.try_recv().unwrap(), WatchSignal::Event { kind: WatchEventKind::Change, .. }));
        assert_eq!(rx.try_recv().unwrap(), WatchSignal::Error("gone".to_string()));
        assert!(matches!(rx.try_recv().unwrap(), WatchSignal::Event { kind: WatchEventKind::Delete, .. }));
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(WatchEventKind::Change));
    }

    #[test]
    fn test_event_kind_serialization() {
        assert_eq!(serde_json::to_string(&WatchEventKind::Change).unwrap(), r#""change""#);
        assert_eq!(WatchEventKind::Delete.to_string(), "delete");
    }
}
