use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PlatformError;
use crate::record::AlarmId;

pub const DEFAULT_CHANNEL_ID: &str = "exact_alarms";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Default,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub importance: Importance,
    pub vibration_pattern_ms: Vec<u64>,
}

impl ChannelSpec {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            id: DEFAULT_CHANNEL_ID.to_string(),
            name: "Alarms".to_string(),
            description: "Time-critical reminders delivered at an exact time".to_string(),
            importance: Importance::High,
            vibration_pattern_ms: vec![0, 500, 250, 500],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Alarm,
    /// Shown when a timer fired but its record could not be resolved.
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: AlarmId,
    pub channel_id: String,
    pub title: String,
    pub body: String,
    pub payload: Option<String>,
    pub kind: NotificationKind,
}

/// User interaction with a shown notification, routed back to the app layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationTap {
    pub id: AlarmId,
    pub payload: Option<String>,
}

/// Platform-specific notification adapters will implement this trait.
pub trait NotificationSink: Send + Sync {
    fn ensure_channel(&self, channel: &ChannelSpec) -> Result<(), PlatformError>;
    fn show(&self, notification: &Notification) -> Result<(), PlatformError>;
    /// Dismissing an id that is not shown is not an error.
    fn cancel(&self, id: AlarmId) -> Result<(), PlatformError>;
}

/// Builds user-visible notifications and makes sure their channel exists.
pub struct NotificationPresenter {
    sink: Arc<dyn NotificationSink>,
    channel: ChannelSpec,
    channel_ready: Mutex<bool>,
}

impl NotificationPresenter {
    pub fn new(sink: Arc<dyn NotificationSink>, channel: ChannelSpec) -> Self {
        Self {
            sink,
            channel,
            channel_ready: Mutex::new(false),
        }
    }

    pub fn channel(&self) -> &ChannelSpec {
        &self.channel
    }

    pub fn show(
        &self,
        id: AlarmId,
        title: &str,
        body: &str,
        payload: Option<&str>,
    ) -> Result<(), PlatformError> {
        self.present(id, title, body, payload, NotificationKind::Alarm)
    }

    pub fn show_fallback(&self, id: AlarmId, title: &str, body: &str) -> Result<(), PlatformError> {
        self.present(id, title, body, None, NotificationKind::Fallback)
    }

    pub fn cancel(&self, id: AlarmId) -> Result<(), PlatformError> {
        self.sink.cancel(id)
    }

    fn present(
        &self,
        id: AlarmId,
        title: &str,
        body: &str,
        payload: Option<&str>,
        kind: NotificationKind,
    ) -> Result<(), PlatformError> {
        self.ensure_channel();
        let notification = Notification {
            id,
            channel_id: self.channel.id.clone(),
            title: title.to_string(),
            body: body.to_string(),
            payload: payload.map(str::to_string),
            kind,
        };
        debug!(alarm_id = id, ?kind, "showing notification");
        self.sink.show(&notification)
    }

    // A failed channel setup is retried on the next notification; the show
    // itself is still attempted so the sink can fall back to its default channel.
    fn ensure_channel(&self) {
        let mut ready = self.channel_ready.lock();
        if *ready {
            return;
        }
        match self.sink.ensure_channel(&self.channel) {
            Ok(()) => *ready = true,
            Err(err) => warn!(channel = %self.channel.id, %err, "notification channel setup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn channel_is_created_once() {
        let sink = Arc::new(RecordingSink::new());
        let presenter = NotificationPresenter::new(sink.clone(), ChannelSpec::default());
        presenter.show(1, "a", "b", Some("payload")).unwrap();
        presenter.show(2, "c", "d", None).unwrap();

        assert_eq!(sink.channels().len(), 1);
        let shown = sink.shown();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].channel_id, DEFAULT_CHANNEL_ID);
        assert_eq!(shown[0].payload.as_deref(), Some("payload"));
        assert_eq!(shown[0].kind, NotificationKind::Alarm);
    }

    #[test]
    fn failed_channel_setup_is_retried() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail_channel_setup(true);
        let presenter = NotificationPresenter::new(sink.clone(), ChannelSpec::with_id("custom"));
        presenter.show_fallback(1, "a", "b").unwrap();
        assert!(sink.channels().is_empty());

        sink.fail_channel_setup(false);
        presenter.show(2, "c", "d", None).unwrap();
        assert_eq!(sink.channels(), vec!["custom".to_string()]);
        assert_eq!(sink.shown()[0].kind, NotificationKind::Fallback);
    }
}
