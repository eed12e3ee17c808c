use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One operation against the registry or watch manager.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    ExtractMetadata { uri: String },
    Open { uri: String },
    GetHash { uri: String },
    WatchStart { uri: String },
    WatchStop { uri: String },
    CanHandle { uri: String },
    GetRegistryInfo,
}

impl Request {
    /// Wire name of the operation.
    pub fn op(&self) -> &'static str {
        match self {
            Self::ExtractMetadata { .. } => "extractMetadata",
            Self::Open { .. } => "open",
            Self::GetHash { .. } => "getHash",
            Self::WatchStart { .. } => "watchStart",
            Self::WatchStop { .. } => "watchStop",
            Self::CanHandle { .. } => "canHandle",
            Self::GetRegistryInfo => "getRegistryInfo",
        }
    }
}

/// A request as it arrives over a stream transport, with an optional
/// caller-chosen correlation id echoed back on the response.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: Request,
}
