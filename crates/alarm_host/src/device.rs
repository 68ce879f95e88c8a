//! Stand-in for a phone: a wake-timer table driven by a delivery thread, a
//! notification tray that logs, and a switchable exact-alarm permission.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use alarm_core::fired::{AlarmFiredHandler, TimerElapsed};
use alarm_core::notifications::{ChannelSpec, Notification, NotificationSink};
use alarm_core::platform::{
    AlarmPlatform, Clock, TimerRegistration, WakeGuard, WakeLock, WakeTimer,
};
use alarm_core::{AlarmId, PlatformError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

const IDLE_WAIT: Duration = Duration::from_secs(3600);

pub struct SimulatedDevice {
    api_level: u32,
    exact_permission: AtomicBool,
    timers: Mutex<BTreeMap<AlarmId, TimerRegistration>>,
    timers_changed: Condvar,
    tray: Mutex<Vec<Notification>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedDevice {
    pub fn new(api_level: u32, exact_permission: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            api_level,
            exact_permission: AtomicBool::new(exact_permission),
            timers: Mutex::new(BTreeMap::new()),
            timers_changed: Condvar::new(),
            tray: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn set_exact_permission(&self, granted: bool) {
        info!(granted, "exact alarm permission changed");
        self.exact_permission.store(granted, Ordering::SeqCst);
    }

    pub fn armed(&self) -> Vec<TimerRegistration> {
        self.timers.lock().values().cloned().collect()
    }

    pub fn tray(&self) -> Vec<Notification> {
        self.tray.lock().clone()
    }

    /// Drops every armed timer, which is what a power cycle does.
    pub fn reboot(&self) {
        let mut timers = self.timers.lock();
        info!(lost = timers.len(), "device rebooting");
        timers.clear();
        self.timers_changed.notify_all();
    }

    /// Removes and returns the ids whose timers are due at `now_millis`.
    pub fn take_due(&self, now_millis: i64) -> Vec<AlarmId> {
        let mut timers = self.timers.lock();
        take_due_locked(&mut timers, now_millis)
    }

    /// Starts delivering elapsed timers to `handler` on a background thread.
    pub fn start_delivery(self: &Arc<Self>, handler: Arc<AlarmFiredHandler>) -> DeliveryLoop {
        let stop = Arc::new(AtomicBool::new(false));
        let device = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || device.deliver_until(&stop_flag, &handler));
        DeliveryLoop {
            device: Arc::clone(self),
            stop,
            thread: Some(thread),
        }
    }

    fn deliver_until(&self, stop: &AtomicBool, handler: &AlarmFiredHandler) {
        loop {
            let due = {
                let mut timers = self.timers.lock();
                loop {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let now = self.clock.now_millis();
                    let due = take_due_locked(&mut timers, now);
                    if !due.is_empty() {
                        break due;
                    }
                    let wait = timers
                        .values()
                        .map(|registration| registration.fire_at_millis)
                        .min()
                        .map(|next| Duration::from_millis(next.saturating_sub(now).max(1) as u64))
                        .unwrap_or(IDLE_WAIT);
                    self.timers_changed.wait_for(&mut timers, wait);
                }
            };
            for id in due {
                let outcome = handler.on_timer_elapsed(&TimerElapsed::for_alarm(id));
                debug!(alarm_id = id, ?outcome, "timer delivered");
            }
        }
    }
}

fn take_due_locked(timers: &mut BTreeMap<AlarmId, TimerRegistration>, now_millis: i64) -> Vec<AlarmId> {
    let due: Vec<AlarmId> = timers
        .values()
        .filter(|registration| registration.fire_at_millis <= now_millis)
        .map(|registration| registration.id)
        .collect();
    for id in &due {
        timers.remove(id);
    }
    due
}

impl WakeTimer for SimulatedDevice {
    fn arm(&self, registration: &TimerRegistration) -> Result<(), PlatformError> {
        debug!(alarm_id = registration.id, tier = %registration.tier, "arming timer");
        self.timers
            .lock()
            .insert(registration.id, registration.clone());
        self.timers_changed.notify_all();
        Ok(())
    }

    fn disarm(&self, id: AlarmId) -> Result<(), PlatformError> {
        self.timers.lock().remove(&id);
        self.timers_changed.notify_all();
        Ok(())
    }
}

impl AlarmPlatform for SimulatedDevice {
    fn api_level(&self) -> u32 {
        self.api_level
    }

    fn exact_alarm_permission_granted(&self) -> bool {
        self.exact_permission.load(Ordering::SeqCst)
    }

    fn open_exact_alarm_settings(&self) -> Result<(), PlatformError> {
        info!("opening exact alarm settings");
        Ok(())
    }
}

impl WakeLock for SimulatedDevice {
    fn acquire(&self, tag: &str, timeout: Duration) -> Result<WakeGuard, PlatformError> {
        debug!(tag, ?timeout, "wake lock acquired");
        let tag = tag.to_string();
        Ok(WakeGuard::new(move || debug!(tag = %tag, "wake lock released")))
    }
}

impl NotificationSink for SimulatedDevice {
    fn ensure_channel(&self, channel: &ChannelSpec) -> Result<(), PlatformError> {
        info!(channel = %channel.id, importance = ?channel.importance, "notification channel ready");
        Ok(())
    }

    fn show(&self, notification: &Notification) -> Result<(), PlatformError> {
        info!(
            alarm_id = notification.id,
            title = %notification.title,
            body = %notification.body,
            "notification posted"
        );
        let mut tray = self.tray.lock();
        tray.retain(|shown| shown.id != notification.id);
        tray.push(notification.clone());
        Ok(())
    }

    fn cancel(&self, id: AlarmId) -> Result<(), PlatformError> {
        self.tray.lock().retain(|shown| shown.id != id);
        Ok(())
    }
}

/// Stops and joins the delivery thread when dropped.
pub struct DeliveryLoop {
    device: Arc<SimulatedDevice>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for DeliveryLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        {
            let _timers = self.device.timers.lock();
            self.device.timers_changed.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
