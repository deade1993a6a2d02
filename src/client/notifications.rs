// ! Server notification fan-out
// !
// ! Handlers run synchronously on the connection core, in registration
// ! order, one notification at a time. A panicking handler is logged and
// ! isolated so it cannot take the connection down. Handlers must be fast
// ! (well under 5 ms) and non-blocking; a slow handler stalls frame
// ! processing for the whole connection.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::protocol::types::JsonRpcNotification;

/// Handler for server-initiated notifications
pub trait NotificationHandler: Send {
    /// Handle one decoded notification
    fn handle_notification(&self, notification: &JsonRpcNotification);
}

impl<F> NotificationHandler for F
where
    F: Fn(&JsonRpcNotification) + Send,
{
    fn handle_notification(&self, notification: &JsonRpcNotification) {
        self(notification)
    }
}

/// Notification handler that logs every notification it sees
pub struct LoggingNotificationHandler;

impl NotificationHandler for LoggingNotificationHandler {
    fn handle_notification(&self, notification: &JsonRpcNotification) {
        tracing::info!(
            method = %notification.method,
            params = ?notification.params,
            "received notification"
        );
    }
}

/// Ordered list of registered handlers, owned by the core
pub(crate) struct NotificationSink {
    handlers: Vec<Box<dyn NotificationHandler>>,
}

impl NotificationSink {
    pub fn new(handlers: Vec<Box<dyn NotificationHandler>>) -> Self {
        Self { handlers }
    }

    /// Invoke every handler on the notification, in registration order
    pub fn dispatch(&self, notification: &JsonRpcNotification) {
        for handler in &self.handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.handle_notification(notification)
            }));
            if outcome.is_err() {
                tracing::warn!(
                    method = %notification.method,
                    "notification handler panicked, continuing"
                );
            }
        }
    }
}
