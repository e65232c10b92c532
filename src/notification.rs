//! Notifications emitted by listener context operations (spec.md §3
//! "Notification", §4.5 `context.notify`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub listener_id: String,
    pub listener_name: String,
    pub priority: Priority,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub email_message_id: Option<String>,
}

/// Destination for listener notifications
///
/// `notify` never blocks on I/O (spec.md §4.5): the sink is a bounded
/// channel sender, never an HTTP/websocket call made inline.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Broadcasts notifications to every connected websocket client
///
/// Backed by a `tokio::sync::broadcast` channel so the HTTP layer's
/// websocket handlers can each hold their own receiver.
pub struct BroadcastNotificationSink {
    sender: tokio::sync::broadcast::Sender<Notification>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastNotificationSink {
    fn notify(&self, notification: Notification) {
        // No receivers is the common case between UI connections; dropping
        // the notification is correct, not an error.
        let _ = self.sender.send(notification);
    }
}
