use serde::Serialize;
use srcwatch_source::WatchEventKind;
use time::OffsetDateTime;

/// A change to a watched source, as delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub uri: String,
    #[serde(rename = "event")]
    pub kind: WatchEventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything a subscriber can receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchNotification {
    Event(WatchEvent),
    /// The watch could not be established, or failed after it was. Sent
    /// once; the URI is no longer watched afterwards.
    Error { uri: String, error: String },
}

impl WatchNotification {
    pub fn uri(&self) -> &str {
        match self {
            Self::Event(event) => &event.uri,
            Self::Error { uri, .. } => uri,
        }
    }
}
