//! The process-boundary contract.
//!
//! Transports decode [`Request`]s, pass them to [`Service::handle()`] with the
//! caller's [`Session`], and encode the [`Response`]. Watch notifications
//! arrive out of band on the session's receiver and go back over the wire as
//! [`Outbound`] messages.

mod request;
mod response;
mod service;

pub use crate::request::{Incoming, Request};
pub use crate::response::{Outbound, Response};
pub use crate::service::{DEFAULT_OPEN_LIMIT, Service, ServiceOptions, Session};
