//! Scheme → handler table.
//!
//! The registry is the only way callers reach a handler. It is populated at
//! startup and read concurrently afterwards; the internal lock is never
//! exposed.

use crate::capability::{Capabilities, Capability};
use crate::error::{ErrorKind, Result};
use crate::handler::{FileHandler, HandlerRef, OpenedSource, SchemeHandler};
use crate::hash::{ContentHash, Hasher};
use crate::metadata::Metadata;
use crate::uri::SourceUri;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

/// A URI routed to the handler responsible for it.
#[derive(Clone)]
pub struct Resolved {
    pub uri: SourceUri,
    pub handler: HandlerRef,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved").field("uri", &self.uri).field("scheme", &self.handler.scheme()).finish()
    }
}

/// Introspection snapshot, see [`Registry::info()`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegistryInfo {
    pub schemes: Vec<String>,
    pub handlers: Vec<HandlerInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HandlerInfo {
    pub scheme: String,
    pub capabilities: Capabilities,
}

#[derive(Default)]
pub struct Registry {
    handlers: RwLock<BTreeMap<String, HandlerRef>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry serving `file:` URIs, hashing with `hasher`.
    pub fn with_defaults(hasher: Hasher) -> Self {
        let registry = Self::new();
        registry.handlers.write().insert(FileHandler::SCHEME.to_string(), Arc::new(FileHandler::new(hasher)));
        registry
    }

    /// Register a handler under its own scheme.
    ///
    /// First registration wins: a second handler for the same scheme fails
    /// with [`DuplicateScheme`](ErrorKind::DuplicateScheme) and the existing
    /// one stays in place.
    pub fn register(&self, handler: impl SchemeHandler + 'static) -> Result<()> {
        self.register_shared(Arc::new(handler))
    }

    pub fn register_shared(&self, handler: HandlerRef) -> Result<()> {
        let scheme = handler.scheme().to_ascii_lowercase();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&scheme) {
            exn::bail!(ErrorKind::DuplicateScheme(scheme));
        }
        tracing::debug!(%scheme, capabilities = ?handler.capabilities(), "Registered scheme handler");
        handlers.insert(scheme, handler);
        Ok(())
    }

    /// Handler registered for `scheme`, if any.
    pub fn handler(&self, scheme: &str) -> Option<HandlerRef> {
        self.handlers.read().get(&scheme.to_ascii_lowercase()).cloned()
    }

    /// Parse `uri` and find its handler.
    ///
    /// # Errors
    /// [`InvalidUri`](ErrorKind::InvalidUri) when the URI has no parseable
    /// scheme, [`UnknownScheme`](ErrorKind::UnknownScheme) when nothing is
    /// registered for it.
    pub fn resolve(&self, uri: &str) -> Result<Resolved> {
        let uri = SourceUri::parse(uri)?;
        match self.handler(uri.scheme()) {
            Some(handler) => Ok(Resolved { uri, handler }),
            None => exn::bail!(ErrorKind::UnknownScheme(uri.scheme().to_string())),
        }
    }

    /// Whether [`resolve()`](Self::resolve) would succeed. Never fails.
    pub fn can_handle(&self, uri: &str) -> bool {
        self.resolve(uri).is_ok()
    }

    pub fn info(&self) -> RegistryInfo {
        let handlers = self.handlers.read();
        RegistryInfo {
            schemes: handlers.keys().cloned().collect(),
            handlers: handlers
                .iter()
                .map(|(scheme, handler)| HandlerInfo { scheme: scheme.clone(), capabilities: handler.capabilities() })
                .collect(),
        }
    }

    #[instrument(skip(self))]
    pub async fn extract_metadata(&self, uri: &str) -> Result<Metadata> {
        let Resolved { uri, handler } = self.resolve(uri)?;
        handler.extract_metadata(&uri).await
    }

    #[instrument(skip(self))]
    pub async fn hash(&self, uri: &str) -> Result<ContentHash> {
        let Resolved { uri, handler } = self.resolve(uri)?;
        handler.hash(&uri).await
    }

    #[instrument(skip(self))]
    pub async fn open(&self, uri: &str) -> Result<OpenedSource> {
        let Resolved { uri, handler } = self.resolve(uri)?;
        if !handler.capabilities().can_open {
            exn::bail!(ErrorKind::unsupported(handler.scheme(), Capability::Open));
        }
        handler.open(&uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockHandler;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_unknown_scheme() {
        let registry = Registry::with_defaults(Hasher::default());
        let err = registry.resolve("https://example.com").unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownScheme(scheme) if scheme == "https"));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("/tmp/a.txt")]
    #[case("no scheme here")]
    fn test_invalid_uri(#[case] uri: &str) {
        let registry = Registry::with_defaults(Hasher::default());
        let err = registry.resolve(uri).unwrap_err();
        assert_eq!(err.code(), "InvalidUri");
        assert!(!registry.can_handle(uri));
    }

    #[rstest]
    #[case("file:///tmp/a.txt", true)]
    #[case("FILE:///tmp/a.txt", true)]
    #[case("https://example.com", false)]
    #[case("", false)]
    fn test_can_handle(#[case] uri: &str, #[case] expected: bool) {
        assert_eq!(Registry::with_defaults(Hasher::default()).can_handle(uri), expected);
    }

    #[test]
    fn test_duplicate_scheme_keeps_first() {
        let registry = Registry::new();
        registry.register(MockHandler::new("mem")).unwrap();
        let err = registry.register(MockHandler::new("MEM").with_capabilities(Capabilities::NONE)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::DuplicateScheme(scheme) if scheme == "mem"));
        assert_eq!(registry.handler("mem").unwrap().capabilities(), Capabilities::ALL);
    }

    #[test]
    fn test_info() {
        let registry = Registry::with_defaults(Hasher::default());
        registry.register(MockHandler::new("https").with_capabilities(Capabilities::NONE.with_preview(true))).unwrap();
        let info = registry.info();
        assert_eq!(info.schemes, ["file", "https"]);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["handlers"][0]["capabilities"]["canWatch"], true);
        assert_eq!(json["handlers"][1]["scheme"], "https");
        assert_eq!(json["handlers"][1]["capabilities"]["canPreview"], true);
        assert_eq!(json["handlers"][1]["capabilities"]["canOpen"], false);
    }

    #[tokio::test]
    async fn test_routed_operations() {
        let registry = Registry::new();
        registry.register(MockHandler::new("mem").with_files([("mem:/a.txt", "abc")])).unwrap();
        assert_eq!(registry.extract_metadata("mem:/a.txt").await.unwrap().size, 3);
        assert_eq!(registry.hash("mem:/a.txt").await.unwrap(), crate::hash::hash_bytes(b"abc"));
        let mut buf = String::new();
        registry.open("mem:/a.txt").await.unwrap().reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "abc");
    }

    #[tokio::test]
    async fn test_open_checks_capability() {
        let registry = Registry::new();
        let handler = MockHandler::new("mem").with_capabilities(Capabilities::NONE).with_files([("mem:/a", "x")]);
        registry.register(handler).unwrap();
        let err = registry.open("mem:/a").await.unwrap_err();
        assert_eq!(err.code(), "UnsupportedCapability");
    }

    #[tokio::test]
    async fn test_missing_file_hash_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        let registry = Registry::with_defaults(Hasher::default());
        let err = registry.hash(&format!("file://{}", path.display())).await.unwrap_err();
        assert_eq!(err.code(), "IOError");
        assert!((*err).to_string().contains(&path.display().to_string()));
    }

    #[tokio::test]
    async fn test_empty_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"").unwrap();
        let registry = Registry::with_defaults(Hasher::default());
        let meta = registry.extract_metadata(&format!("file://{}", path.display())).await.unwrap();
        assert_eq!(meta.size, 0);
        assert!(meta.is_file);
        assert!(!meta.is_directory);
    }
}
