//! In-memory doubles for the platform seams.
//!
//! They record every call so tests (and simulated hosts) can assert on the
//! side effects the core produced.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::PlatformError;
use crate::notifications::{ChannelSpec, Notification, NotificationSink};
use crate::platform::{AlarmPlatform, Clock, TimerRegistration, WakeGuard, WakeLock, WakeTimer};
use crate::record::AlarmId;

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wake timer table that never fires on its own.
#[derive(Debug, Default)]
pub struct RecordingTimer {
    armed: Mutex<BTreeMap<AlarmId, TimerRegistration>>,
    failing: Mutex<BTreeSet<AlarmId>>,
    arm_calls: AtomicUsize,
}

impl RecordingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make both `arm` and `disarm` fail for `id`.
    pub fn fail_for(&self, id: AlarmId) {
        self.failing.lock().insert(id);
    }

    pub fn armed(&self) -> Vec<TimerRegistration> {
        self.armed.lock().values().cloned().collect()
    }

    pub fn registration(&self, id: AlarmId) -> Option<TimerRegistration> {
        self.armed.lock().get(&id).cloned()
    }

    pub fn arm_calls(&self) -> usize {
        self.arm_calls.load(Ordering::SeqCst)
    }

    /// Forget every registration, as the OS does on reboot.
    pub fn wipe(&self) {
        self.armed.lock().clear();
    }

    fn check(&self, id: AlarmId, action: &str) -> Result<(), PlatformError> {
        if self.failing.lock().contains(&id) {
            return Err(PlatformError::Timer {
                id,
                reason: format!("{action} refused by test timer"),
            });
        }
        Ok(())
    }
}

impl WakeTimer for RecordingTimer {
    fn arm(&self, registration: &TimerRegistration) -> Result<(), PlatformError> {
        self.arm_calls.fetch_add(1, Ordering::SeqCst);
        self.check(registration.id, "arm")?;
        self.armed
            .lock()
            .insert(registration.id, registration.clone());
        Ok(())
    }

    fn disarm(&self, id: AlarmId) -> Result<(), PlatformError> {
        self.check(id, "disarm")?;
        self.armed.lock().remove(&id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    channels: Mutex<Vec<String>>,
    shown: Mutex<Vec<Notification>>,
    cancelled: Mutex<Vec<AlarmId>>,
    fail_channel: AtomicBool,
    fail_show: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_channel_setup(&self, fail: bool) {
        self.fail_channel.store(fail, Ordering::SeqCst);
    }

    pub fn fail_show(&self, fail: bool) {
        self.fail_show.store(fail, Ordering::SeqCst);
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }

    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<AlarmId> {
        self.cancelled.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn ensure_channel(&self, channel: &ChannelSpec) -> Result<(), PlatformError> {
        if self.fail_channel.load(Ordering::SeqCst) {
            return Err(PlatformError::Notification("channel refused".into()));
        }
        self.channels.lock().push(channel.id.clone());
        Ok(())
    }

    fn show(&self, notification: &Notification) -> Result<(), PlatformError> {
        if self.fail_show.load(Ordering::SeqCst) {
            return Err(PlatformError::Notification("show refused".into()));
        }
        self.shown.lock().push(notification.clone());
        Ok(())
    }

    fn cancel(&self, id: AlarmId) -> Result<(), PlatformError> {
        self.cancelled.lock().push(id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakePlatform {
    api_level: AtomicU32,
    permission: AtomicBool,
    settings_opened: AtomicUsize,
}

impl FakePlatform {
    pub fn new(api_level: u32, permission_granted: bool) -> Self {
        Self {
            api_level: AtomicU32::new(api_level),
            permission: AtomicBool::new(permission_granted),
            settings_opened: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    pub fn settings_opened(&self) -> usize {
        self.settings_opened.load(Ordering::SeqCst)
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new(34, true)
    }
}

impl AlarmPlatform for FakePlatform {
    fn api_level(&self) -> u32 {
        self.api_level.load(Ordering::SeqCst)
    }

    fn exact_alarm_permission_granted(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn open_exact_alarm_settings(&self) -> Result<(), PlatformError> {
        self.settings_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts acquisitions and releases; `held()` is what is still outstanding.
#[derive(Debug, Default)]
pub struct CountingWakeLock {
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
    unavailable: AtomicBool,
}

impl CountingWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.acquired() - self.released.load(Ordering::SeqCst)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, _tag: &str, _timeout: Duration) -> Result<WakeGuard, PlatformError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlatformError::WakeLock("wake lock disabled".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = Arc::clone(&self.released);
        Ok(WakeGuard::new(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}
