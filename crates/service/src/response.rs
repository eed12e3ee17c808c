use serde::Serialize;
use serde_json::Value;
use srcwatch_source::error::ErrorKind;
use srcwatch_watch::{WatchEvent, WatchNotification};

/// Reply to a [`Request`](crate::Request).
///
/// Failures are never raised across the boundary: they come back with
/// `success: false`, a readable `error` and the category in `code`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self { id: None, success: true, data: Some(data), error: None, code: None },
            Err(err) => Self { id: None, success: false, data: None, error: Some(err.to_string()), code: None },
        }
    }

    pub fn failure(kind: &ErrorKind) -> Self {
        Self { id: None, success: false, data: None, error: Some(kind.to_string()), code: Some(kind.code()) }
    }

    /// A request that could not be decoded at all.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self { id: None, success: false, data: None, error: Some(message.into()), code: None }
    }

    #[must_use]
    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }
}

/// Out-of-band message pushed to a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    WatchEvent(WatchEvent),
    WatchError { uri: String, error: String },
}

impl From<WatchNotification> for Outbound {
    fn from(notification: WatchNotification) -> Self {
        match notification {
            WatchNotification::Event(event) => Self::WatchEvent(event),
            WatchNotification::Error { uri, error } => Self::WatchError { uri, error },
        }
    }
}
