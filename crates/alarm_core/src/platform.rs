//! Seams to the host OS: wake timers, permission state, wake locks and time.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::record::AlarmId;

/// First OS API level that gates exact timers behind a user permission.
pub const EXACT_PERMISSION_API_LEVEL: u32 = 31;
/// First OS API level with timers that fire while the device idles.
pub const ALLOW_WHILE_IDLE_API_LEVEL: u32 = 23;
/// First OS API level where the plain timer became inexact.
pub const EXACT_API_LEVEL: u32 = 19;

/// Which wake-timer flavour the OS is asked for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerTier {
    /// Exact, and allowed to fire during idle/doze.
    ExactAllowWhileIdle,
    /// Exact, but may be deferred while the device idles.
    Exact,
    /// Plain wake-up timer of old OS versions, which was exact by default.
    Legacy,
}

impl TimerTier {
    pub fn for_api_level(api_level: u32) -> Self {
        if api_level >= ALLOW_WHILE_IDLE_API_LEVEL {
            TimerTier::ExactAllowWhileIdle
        } else if api_level >= EXACT_API_LEVEL {
            TimerTier::Exact
        } else {
            TimerTier::Legacy
        }
    }
}

impl fmt::Display for TimerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimerTier::ExactAllowWhileIdle => "exact-allow-while-idle",
            TimerTier::Exact => "exact",
            TimerTier::Legacy => "legacy",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRegistration {
    pub id: AlarmId,
    pub fire_at_millis: i64,
    pub tier: TimerTier,
}

/// OS one-shot wake timers. On elapse the host routes a
/// [`crate::fired::TimerElapsed`] for the id to the fired handler.
pub trait WakeTimer: Send + Sync {
    /// Arming an id that is already armed replaces the earlier registration.
    fn arm(&self, registration: &TimerRegistration) -> Result<(), PlatformError>;
    /// Disarming an id that is not armed is not an error.
    fn disarm(&self, id: AlarmId) -> Result<(), PlatformError>;
}

pub trait AlarmPlatform: Send + Sync {
    fn api_level(&self) -> u32;
    /// Live permission state. Only consulted on versions that gate exact timers.
    fn exact_alarm_permission_granted(&self) -> bool;
    fn open_exact_alarm_settings(&self) -> Result<(), PlatformError>;

    fn requires_exact_alarm_permission(&self) -> bool {
        self.api_level() >= EXACT_PERMISSION_API_LEVEL
    }

    fn can_schedule_exact_alarms(&self) -> bool {
        !self.requires_exact_alarm_permission() || self.exact_alarm_permission_granted()
    }
}

/// Keeps the device awake until dropped.
#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub struct WakeGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard for platforms without a suspend state.
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for WakeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

pub trait WakeLock: Send + Sync {
    /// The OS force-releases the lock after `timeout` even if the guard is alive.
    fn acquire(&self, tag: &str, timeout: Duration) -> Result<WakeGuard, PlatformError>;
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tier_follows_api_level() {
        assert_eq!(TimerTier::for_api_level(34), TimerTier::ExactAllowWhileIdle);
        assert_eq!(TimerTier::for_api_level(23), TimerTier::ExactAllowWhileIdle);
        assert_eq!(TimerTier::for_api_level(22), TimerTier::Exact);
        assert_eq!(TimerTier::for_api_level(19), TimerTier::Exact);
        assert_eq!(TimerTier::for_api_level(18), TimerTier::Legacy);
    }

    #[test]
    fn wake_guard_releases_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let guard = WakeGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    struct Platform {
        api_level: u32,
        granted: bool,
    }

    impl AlarmPlatform for Platform {
        fn api_level(&self) -> u32 {
            self.api_level
        }
        fn exact_alarm_permission_granted(&self) -> bool {
            self.granted
        }
        fn open_exact_alarm_settings(&self) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[test]
    fn permission_only_matters_on_gated_versions() {
        let old = Platform { api_level: 30, granted: false };
        assert!(old.can_schedule_exact_alarms());
        let denied = Platform { api_level: 31, granted: false };
        assert!(!denied.can_schedule_exact_alarms());
        let granted = Platform { api_level: 34, granted: true };
        assert!(granted.can_schedule_exact_alarms());
    }
}
