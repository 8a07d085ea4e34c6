//! Status timeline.
//!
//! Turns worker reports from any number of nodes into one replicated status
//! history per monitor, prunes it past the retention horizon and notifies
//! providers once per genuine status transition.

mod notify;
mod service;

pub use notify::{
    pending_changes, NotificationDispatcher, Notifier, NotifyError, NotifyFuture, StatusChange,
    WebhookNotifier,
};
pub use service::{classify, StatusBuffer, TimelineService};
