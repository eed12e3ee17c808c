//! Watching sources for changes.
//!
//! [`WatchManager`] owns every live OS watch in the process and routes the
//! notifications to [`Subscriber`]s by URI.

mod event;
mod manager;
mod subscriber;

pub use crate::event::{WatchEvent, WatchNotification};
pub use crate::manager::{DEFAULT_DEBOUNCE, MAX_HOLD_WINDOWS, ShutdownReport, StopOutcome, WatchManager, WatchOptions, WatchRegistration};
pub use crate::subscriber::{Subscriber, SubscriberId};
pub use srcwatch_source::WatchEventKind;
