//! kiln Watch - Stat Tracking and Change Notification
//!
//! The stat tracker memoizes source file metadata for freshness checks.
//! Notifiers publish filesystem changes, and the listener task keeps the
//! tracker consistent with them.

pub mod listener;
pub mod notifier;
pub mod poll;
pub mod stat;

pub use listener::spawn_listener;
pub use notifier::{ChangeEvent, ChangeNotifier, ManualNotifier, EVENT_CHANNEL_CAPACITY};
pub use poll::PollingNotifier;
pub use stat::StatTracker;
