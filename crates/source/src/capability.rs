//! Capability flags declared by scheme handlers.

use derive_more::Display;
use serde::Serialize;

/// What a scheme handler can do, fixed when the handler is constructed.
///
/// Callers are expected to consult these flags (usually through
/// [`Registry::info()`](crate::Registry::info)) before invoking an operation;
/// anything unsupported fails with
/// [`UnsupportedCapability`](crate::error::ErrorKind::UnsupportedCapability).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_watch: bool,
    pub can_open: bool,
    pub can_preview: bool,
    pub can_cache: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        can_watch: false,
        can_open: false,
        can_preview: false,
        can_cache: false,
    };
    pub const ALL: Self = Self {
        can_watch: true,
        can_open: true,
        can_preview: true,
        can_cache: true,
    };

    #[must_use]
    pub const fn with_watch(mut self, enabled: bool) -> Self {
        self.can_watch = enabled;
        self
    }

    #[must_use]
    pub const fn with_open(mut self, enabled: bool) -> Self {
        self.can_open = enabled;
        self
    }

    #[must_use]
    pub const fn with_preview(mut self, enabled: bool) -> Self {
        self.can_preview = enabled;
        self
    }

    #[must_use]
    pub const fn with_cache(mut self, enabled: bool) -> Self {
        self.can_cache = enabled;
        self
    }

    /// Whether the flag gating `capability` is set.
    ///
    /// Metadata extraction and hashing have no flag of their own; they are
    /// reported as supported here and gated by the handler itself.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Watch => self.can_watch,
            Capability::Open => self.can_open,
            Capability::Preview => self.can_preview,
            Capability::Cache => self.can_cache,
            Capability::ExtractMetadata | Capability::Hash => true,
        }
    }
}

/// An operation or feature a handler may be asked for.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    #[display("extractMetadata")]
    ExtractMetadata,
    #[display("open")]
    Open,
    #[display("hash")]
    Hash,
    #[display("watch")]
    Watch,
    #[display("preview")]
    Preview,
    #[display("cache")]
    Cache,
}
