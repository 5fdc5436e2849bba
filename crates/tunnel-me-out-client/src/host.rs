//! Host utilities the controller relies on: notifications and clipboard.

use thiserror::Error;

use crate::api::TunnelApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Positive,
    Negative,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn positive(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Positive,
            message: message.into(),
        }
    }

    pub fn negative(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Negative,
            message: message.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
}

pub trait Clipboard: Send + Sync {
    fn copy_text(&self, text: &str) -> Result<(), ClipboardError>;
}

/// Reports a failed API call to the user.
pub fn notify_api_error(notifier: &dyn Notifier, error: &TunnelApiError) {
    notifier.notify(Notification::negative(error.user_message()));
}
