use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::record::AlarmId;
use crate::scheduler::AlarmScheduler;
use crate::store::AlarmStore;

/// OS broadcasts after which armed timers are gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSignal {
    BootCompleted,
    LockedBootCompleted,
    QuickBootPowerOn,
    PackageReplaced,
    Other(String),
}

impl BootSignal {
    pub fn from_action(action: &str) -> Self {
        match action {
            "android.intent.action.BOOT_COMPLETED" => BootSignal::BootCompleted,
            "android.intent.action.LOCKED_BOOT_COMPLETED" => BootSignal::LockedBootCompleted,
            "android.intent.action.QUICKBOOT_POWERON" | "com.htc.intent.action.QUICKBOOT_POWERON" => {
                BootSignal::QuickBootPowerOn
            }
            "android.intent.action.MY_PACKAGE_REPLACED" => BootSignal::PackageReplaced,
            other => BootSignal::Other(other.to_string()),
        }
    }

    pub fn triggers_recovery(&self) -> bool {
        !matches!(self, BootSignal::Other(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub attempted: usize,
    pub rearmed: usize,
    pub failed: Vec<(AlarmId, String)>,
}

/// Re-arms persisted alarms after the OS dropped its timer table.
///
/// Records that fail to re-arm stay in the store for the next boot or a
/// manual reconcile; there are no retries within one pass.
pub struct BootRecovery {
    store: Arc<dyn AlarmStore>,
    scheduler: Arc<AlarmScheduler>,
}

impl BootRecovery {
    pub fn new(store: Arc<dyn AlarmStore>, scheduler: Arc<AlarmScheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Returns `None` for broadcasts that do not call for recovery.
    pub fn on_signal(&self, signal: &BootSignal) -> Option<RecoveryReport> {
        if !signal.triggers_recovery() {
            return None;
        }
        Some(self.recover())
    }

    pub fn recover(&self) -> RecoveryReport {
        let now = self.scheduler.now_millis();
        let active = match self.store.get_active(now) {
            Ok(active) => active,
            Err(err) => {
                error!(%err, "cannot read alarms for boot recovery");
                return RecoveryReport::default();
            }
        };

        let report = self.scheduler.rearm(active);
        for (id, reason) in &report.failed {
            warn!(alarm_id = *id, %reason, "alarm not re-armed after boot");
        }
        info!(
            attempted = report.attempted,
            rearmed = report.rearmed,
            failed = report.failed.len(),
            "boot recovery finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AlarmRecord, AlarmRequest};
    use crate::store::MemoryAlarmStore;
    use crate::testing::{FakePlatform, ManualClock, RecordingTimer};

    const NOW: i64 = 1_700_000_000_000;

    fn setup(
        records: Vec<AlarmRecord>,
    ) -> (Arc<MemoryAlarmStore>, Arc<RecordingTimer>, BootRecovery) {
        let store = Arc::new(MemoryAlarmStore::with_records(records));
        let timer = Arc::new(RecordingTimer::new());
        let scheduler = AlarmScheduler::builder()
            .with_store(store.clone())
            .with_timer(timer.clone())
            .with_platform(Arc::new(FakePlatform::default()))
            .with_clock(Arc::new(ManualClock::new(NOW)))
            .build()
            .unwrap();
        let recovery = BootRecovery::new(store.clone(), Arc::new(scheduler));
        (store, timer, recovery)
    }

    fn record(id: AlarmId, fire_at: i64) -> AlarmRecord {
        AlarmRecord::from(AlarmRequest::new(id, "t", "b", fire_at))
    }

    #[test]
    fn rearms_only_future_records_and_keeps_past_ones() {
        let (store, timer, recovery) = setup(vec![record(1, NOW - 1_000), record(2, NOW + 1_000)]);
        let report = recovery
            .on_signal(&BootSignal::BootCompleted)
            .expect("boot triggers recovery");

        assert_eq!(report.attempted, 1);
        assert_eq!(report.rearmed, 1);
        let armed: Vec<AlarmId> = timer.armed().into_iter().map(|r| r.id).collect();
        assert_eq!(armed, vec![2]);
        assert_eq!(store.get(1).unwrap(), Some(record(1, NOW - 1_000)));
        assert_eq!(store.get(2).unwrap(), Some(record(2, NOW + 1_000)));
    }

    #[test]
    fn one_failure_does_not_block_the_rest() {
        let (store, timer, recovery) = setup(vec![
            record(1, NOW + 1_000),
            record(2, NOW + 2_000),
            record(3, NOW + 3_000),
        ]);
        timer.fail_for(2);

        let report = recovery.recover();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.rearmed, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 2);
        assert!(store.get(2).unwrap().is_some(), "failed record stays for next boot");
    }

    #[test]
    fn unrelated_broadcasts_are_ignored() {
        let (_, timer, recovery) = setup(vec![record(1, NOW + 1_000)]);
        let signal = BootSignal::from_action("android.intent.action.TIME_SET");
        assert!(recovery.on_signal(&signal).is_none());
        assert!(timer.armed().is_empty());

        assert_eq!(
            BootSignal::from_action("android.intent.action.MY_PACKAGE_REPLACED"),
            BootSignal::PackageReplaced
        );
    }
}
