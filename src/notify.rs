//! Operator notifications (disk change, space warning, replication failure).
//!
//! Delivery is fire-and-forget: a failing notifier is logged and never affects the request
//! that raised the event.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A disk reached its disk-change threshold and was marked completed.
    DiskChange,
    /// A disk's free space dropped below the space-warning threshold.
    SpaceWarning,
    /// An asynchronous replica commit failed.
    ReplicationFailure,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DiskChange => "disk_change",
            Self::SpaceWarning => "space_warning",
            Self::ReplicationFailure => "replication_failure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Notification {
    #[must_use]
    pub fn new(kind: NotificationKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            details: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Emits notifications as `tracing` events only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::warn!(
            target = "archivist::notify",
            kind = %notification.kind,
            subject = %notification.subject,
            details = ?notification.details,
            "operator notification"
        );
        Ok(())
    }
}

/// Deliver a notification, logging instead of propagating failure.
pub(crate) fn dispatch(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(err) = notifier.notify(notification) {
        tracing::warn!(
            target = "archivist::notify",
            kind = %notification.kind,
            subject = %notification.subject,
            error = %err,
            "notifier unavailable; event dropped"
        );
    }
}
