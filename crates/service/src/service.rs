use crate::request::Request;
use crate::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use srcwatch_source::error::{ErrorKind, Result};
use srcwatch_source::{OpenedSource, Registry};
use srcwatch_watch::{ShutdownReport, StopOutcome, Subscriber, SubscriberId, WatchManager, WatchNotification};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::instrument;

pub const DEFAULT_OPEN_LIMIT: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Most bytes an `open` response carries inline.
    pub open_limit: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self { open_limit: DEFAULT_OPEN_LIMIT }
    }
}

/// One logical caller. Watch notifications for every URI it watches arrive
/// on the receiver returned alongside it.
#[derive(Debug)]
pub struct Session {
    subscriber: Subscriber,
}

impl Session {
    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenedContent<'a> {
    uri: &'a str,
    size: u64,
    truncated: bool,
    encoding: &'static str,
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchStarted {
    uri: String,
    subscriber_count: usize,
    created: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchStopped<'a> {
    uri: &'a str,
    stopped: bool,
    remaining: usize,
}

/// The request/response surface over a [`Registry`] and a [`WatchManager`].
#[derive(Clone)]
pub struct Service {
    registry: Arc<Registry>,
    watches: WatchManager,
    options: ServiceOptions,
}

impl Service {
    pub fn new(registry: Arc<Registry>, watches: WatchManager, options: ServiceOptions) -> Self {
        Self { registry, watches, options }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn open_session(&self) -> (Session, UnboundedReceiver<WatchNotification>) {
        let (subscriber, rx) = Subscriber::channel(SubscriberId::next());
        tracing::debug!(subscriber = %subscriber.id(), "Session opened");
        (Session { subscriber }, rx)
    }

    /// Release everything the session was watching.
    pub async fn close_session(&self, session: &Session) -> usize {
        let released = self.watches.unsubscribe_all(session.id()).await;
        tracing::debug!(subscriber = %session.id(), released, "Session closed");
        released
    }

    /// Answer one request. Never fails: errors become `success: false`.
    #[instrument(skip_all, fields(subscriber = %session.id(), op = request.op()))]
    pub async fn handle(&self, session: &Session, request: Request) -> Response {
        match self.dispatch(session, request).await {
            Ok(response) => response,
            Err(err) => {
                let kind: &ErrorKind = &err;
                tracing::debug!(code = kind.code(), error = %kind, "Request failed");
                Response::failure(kind)
            },
        }
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.watches.shutdown().await
    }

    async fn dispatch(&self, session: &Session, request: Request) -> Result<Response> {
        Ok(match request {
            Request::ExtractMetadata { uri } => Response::ok(self.registry.extract_metadata(&uri).await?),
            Request::Open { uri } => self.open(&uri).await?,
            Request::GetHash { uri } => Response::ok(self.registry.hash(&uri).await?),
            Request::WatchStart { uri } => {
                let registration = self.watches.start_watch(&uri, &session.subscriber).await?;
                Response::ok(WatchStarted {
                    uri: registration.uri,
                    subscriber_count: registration.subscriber_count,
                    created: registration.created,
                })
            },
            Request::WatchStop { uri } => {
                let outcome = self.watches.stop_watch(&uri, session.id()).await;
                let (stopped, remaining) = match outcome {
                    StopOutcome::NotWatching => (false, 0),
                    StopOutcome::Released { remaining } => (true, remaining),
                    StopOutcome::TornDown => (true, 0),
                };
                Response::ok(WatchStopped { uri: &uri, stopped, remaining })
            },
            Request::CanHandle { uri } => Response::ok(self.registry.can_handle(&uri)),
            Request::GetRegistryInfo => Response::ok(self.registry.info()),
        })
    }

    async fn open(&self, uri: &str) -> Result<Response> {
        let OpenedSource { reader, size } = self.registry.open(uri).await?;
        let limit = self.options.open_limit;
        let mut content = Vec::new();
        // One byte past the limit tells a file of exactly `limit` bytes apart
        // from a longer one.
        reader.take(limit as u64 + 1).read_to_end(&mut content).await.map_err(|e| ErrorKind::io(uri, e))?;
        let truncated = content.len() > limit;
        content.truncate(limit);
        Ok(Response::ok(OpenedContent {
            uri,
            size: size.unwrap_or(content.len() as u64),
            truncated,
            encoding: "base64",
            content: STANDARD.encode(&content),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use srcwatch_source::{Capabilities, Hasher, MockHandler, SourceUri, WatchEventKind};
    use srcwatch_watch::WatchOptions;
    use std::time::Duration;
    use tokio::time::timeout;

    fn service(open_limit: usize) -> (MockHandler, Service) {
        let handler = MockHandler::new("mem").with_files([("mem:/hello.txt", "hello world")]);
        let registry = Arc::new(Registry::with_defaults(Hasher::default()));
        registry.register(handler.clone()).unwrap();
        registry.register(MockHandler::new("https").with_capabilities(Capabilities::NONE.with_preview(true))).unwrap();
        let watches = WatchManager::new(Arc::clone(&registry), WatchOptions { debounce: Duration::ZERO });
        (handler, Service::new(registry, watches, ServiceOptions { open_limit }))
    }

    async fn next(rx: &mut UnboundedReceiver<WatchNotification>) -> Option<WatchNotification> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_registry_info() {
        let (_, service) = service(DEFAULT_OPEN_LIMIT);
        let (session, _rx) = service.open_session();
        let response = service.handle(&session, Request::GetRegistryInfo).await;
        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data["schemes"], serde_json::json!(["file", "https", "mem"]));
        assert_eq!(data["handlers"][1]["capabilities"]["canWatch"], false);
    }

    #[rstest]
    #[case("file:///anything", true)]
    #[case("mem:/hello.txt", true)]
    #[case("ftp://example.com/", false)]
    #[case("", false)]
    #[tokio::test]
    async fn test_can_handle(#[case] uri: &str, #[case] expected: bool) {
        let (_, service) = service(DEFAULT_OPEN_LIMIT);
        let (session, _rx) = service.open_session();
        let response = service.handle(&session, Request::CanHandle { uri: uri.to_string() }).await;
        assert!(response.success);
        assert_eq!(response.data, Some(serde_json::Value::Bool(expected)));
    }

    #[rstest]
    #[case(Request::GetHash { uri: String::new() }, "InvalidUri")]
    #[case(Request::ExtractMetadata { uri: "ftp://example.com/a".into() }, "UnknownScheme")]
    #[case(Request::Open { uri: "https://example.com/a".into() }, "UnsupportedCapability")]
    #[case(Request::WatchStart { uri: "https://example.com/a".into() }, "UnsupportedCapability")]
    #[case(Request::GetHash { uri: "mem:/missing".into() }, "IOError")]
    #[tokio::test]
    async fn test_failures_are_tagged(#[case] request: Request, #[case] code: &str) {
        let (_, service) = service(DEFAULT_OPEN_LIMIT);
        let (session, _rx) = service.open_session();
        let response = service.handle(&session, request).await;
        assert!(!response.success);
        assert_eq!(response.code, Some(code));
        assert!(response.error.is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn test_missing_file_hash_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here.bin");
        let (_, service) = service(DEFAULT_OPEN_LIMIT);
        let (session, _rx) = service.open_session();
        let uri = format!("file://{}", path.display());
        let response = service.handle(&session, Request::GetHash { uri }).await;
        assert_eq!(response.code, Some("IOError"));
        assert!(response.error.unwrap().contains("nothing-here.bin"));
    }

    #[tokio::test]
    async fn test_metadata_and_hash() {
        let (_, service) = service(DEFAULT_OPEN_LIMIT);
        let (session, _rx) = service.open_session();
        let meta = service.handle(&session, Request::ExtractMetadata { uri: "mem:/hello.txt".into() }).await;
        assert_eq!(meta.data.unwrap()["size"], 11);
        let hash = service.handle(&session, Request::GetHash { uri: "mem:/hello.txt".into() }).await;
        let hash = hash.data.unwrap();
        assert!(hash.as_str().unwrap().starts_with("sha256:"));
    }

    #[rstest]
    #[case(DEFAULT_OPEN_LIMIT, false, "aGVsbG8gd29ybGQ=")]
    #[case(11, false, "aGVsbG8gd29ybGQ=")]
    #[case(4, true, "aGVsbA==")]
    #[tokio::test]
    async fn test_open(#[case] limit: usize, #[case] truncated: bool, #[case] content: &str) {
        let (_, service) = service(limit);
        let (session, _rx) = service.open_session();
        let response = service.handle(&session, Request::Open { uri: "mem:/hello.txt".into() }).await;
        let data = response.data.unwrap();
        assert_eq!(data["size"], 11);
        assert_eq!(data["truncated"], truncated);
        assert_eq!(data["encoding"], "base64");
        assert_eq!(data["content"], content);
    }

    #[tokio::test]
    async fn test_watch_fan_out_across_sessions() {
        let (handler, service) = service(DEFAULT_OPEN_LIMIT);
        let (first, mut first_rx) = service.open_session();
        let (second, mut second_rx) = service.open_session();
        let start = |uri: &str| Request::WatchStart { uri: uri.to_string() };

        let a = service.handle(&first, start("mem:/hello.txt")).await;
        let b = service.handle(&second, start("mem:/hello.txt")).await;
        assert_eq!(a.data.unwrap()["created"], true);
        assert_eq!(b.data.unwrap()["subscriberCount"], 2);
        assert_eq!(handler.watches_opened(), 1);

        handler.trigger(&SourceUri::parse("mem:/hello.txt").unwrap(), WatchEventKind::Delete);
        for rx in [&mut first_rx, &mut second_rx] {
            let notification = next(rx).await.unwrap();
            assert!(matches!(notification, WatchNotification::Event(event) if event.kind == WatchEventKind::Delete));
        }

        let stop = service.handle(&first, Request::WatchStop { uri: "mem:/hello.txt".into() }).await;
        assert_eq!(stop.data.unwrap()["remaining"], 1);
        let again = service.handle(&first, Request::WatchStop { uri: "mem:/hello.txt".into() }).await;
        assert!(again.success);
        assert_eq!(again.data.unwrap()["stopped"], false);

        assert_eq!(service.close_session(&second).await, 1);
        assert_eq!(handler.live_watches(), 0);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (handler, service) = service(DEFAULT_OPEN_LIMIT);
        let (session, _rx) = service.open_session();
        service.handle(&session, Request::WatchStart { uri: "mem:/hello.txt".into() }).await;
        assert_eq!(service.shutdown().await, ShutdownReport { closed: 1, failed: 0 });
        assert_eq!(handler.live_watches(), 0);
        assert_eq!(service.shutdown().await, ShutdownReport::default());
    }
}
