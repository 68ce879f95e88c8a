use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::notifications::ChannelSpec;

pub const DEFAULT_PAST_DUE_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_WAKE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STORE_FILE: &str = "scheduled_alarms.json";

#[derive(Clone, Debug)]
pub struct AlarmConfig {
    pub store_path: PathBuf,
    /// How far ahead a past-due alarm is pushed when scheduled late.
    pub past_due_grace: Duration,
    pub wake_lock_timeout: Duration,
    pub channel: ChannelSpec,
    pub fallback_title: String,
    pub fallback_body: String,
}

impl AlarmConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ALARM_STORE_PATH") {
            if !path.trim().is_empty() {
                config.store_path = PathBuf::from(path.trim());
            }
        }
        if let Some(secs) = read_secs("ALARM_PAST_DUE_GRACE_SECS") {
            config.past_due_grace = secs;
        }
        if let Some(secs) = read_secs("ALARM_WAKE_LOCK_TIMEOUT_SECS") {
            config.wake_lock_timeout = secs;
        }
        if let Ok(channel) = std::env::var("ALARM_CHANNEL_ID") {
            let channel = channel.trim();
            if !channel.is_empty() {
                config.channel.id = channel.to_string();
            }
        }
        info!(store = %config.store_path.display(), "alarm configuration loaded");
        Ok(config)
    }

    /// Points the store at `<data_dir>/scheduled_alarms.json`, the way a
    /// mobile host roots app state in its private data directory.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        let mut path = data_dir.into();
        path.push(DEFAULT_STORE_FILE);
        self.store_path = path;
        self
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_FILE),
            past_due_grace: DEFAULT_PAST_DUE_GRACE,
            wake_lock_timeout: DEFAULT_WAKE_LOCK_TIMEOUT,
            channel: ChannelSpec::default(),
            fallback_title: "Reminder".to_string(),
            fallback_body: "You have a scheduled reminder.".to_string(),
        }
    }
}

// Zero and unparsable values keep the default.
fn read_secs(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(Duration::from_secs(value)),
        _ => None,
    }
}
