//! Sources: URIs, scheme handlers, hashing and metadata.
//!
//! Callers go through the [`Registry`], which routes a URI to the
//! [`SchemeHandler`] registered for its scheme. Handlers declare what they
//! can do up front via [`Capabilities`].

pub mod capability;
pub mod error;
pub mod handler;
pub mod hash;
pub mod metadata;
mod registry;
mod uri;

pub use crate::capability::{Capabilities, Capability};
#[cfg(feature = "mock")]
pub use crate::handler::MockHandler;
pub use crate::handler::{
    FileHandler, HandlerRef, OpenedSource, SchemeHandler, SourceReader, WatchEventKind, WatchGuard, WatchHandle,
    WatchSignal, WatchSink,
};
pub use crate::hash::{ContentHash, Hasher, hash_bytes};
pub use crate::metadata::Metadata;
pub use crate::registry::{HandlerInfo, Registry, RegistryInfo, Resolved};
pub use crate::uri::SourceUri;
