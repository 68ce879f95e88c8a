use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{AlarmConfig, DEFAULT_PAST_DUE_GRACE};
use crate::error::AlarmError;
use crate::platform::{AlarmPlatform, Clock, SystemClock, TimerRegistration, TimerTier, WakeTimer};
use crate::record::{AlarmId, AlarmRecord, AlarmRequest};
use crate::recovery::RecoveryReport;
use crate::store::AlarmStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelAllReport {
    pub cancelled: usize,
    /// Ids whose OS timer could not be disarmed. Their records are gone anyway.
    pub failed: Vec<AlarmId>,
}

/// Arms and disarms OS wake timers and keeps the store in step with them.
///
/// The store is the record of intent; the OS timer table is a best-effort
/// mirror of it that the scheduler cannot enumerate.
pub struct AlarmScheduler {
    store: Arc<dyn AlarmStore>,
    timer: Arc<dyn WakeTimer>,
    platform: Arc<dyn AlarmPlatform>,
    clock: Arc<dyn Clock>,
    past_due_grace: Duration,
}

pub struct AlarmSchedulerBuilder {
    store: Option<Arc<dyn AlarmStore>>,
    timer: Option<Arc<dyn WakeTimer>>,
    platform: Option<Arc<dyn AlarmPlatform>>,
    clock: Arc<dyn Clock>,
    past_due_grace: Duration,
}

impl AlarmSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            timer: None,
            platform: None,
            clock: Arc::new(SystemClock),
            past_due_grace: DEFAULT_PAST_DUE_GRACE,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AlarmStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn WakeTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn AlarmPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_past_due_grace(mut self, grace: Duration) -> Self {
        self.past_due_grace = grace;
        self
    }

    pub fn with_config(self, config: &AlarmConfig) -> Self {
        self.with_past_due_grace(config.past_due_grace)
    }

    pub fn build(self) -> Result<AlarmScheduler> {
        Ok(AlarmScheduler {
            store: self.store.ok_or_else(|| anyhow!("alarm scheduler needs a store"))?,
            timer: self
                .timer
                .ok_or_else(|| anyhow!("alarm scheduler needs a wake timer"))?,
            platform: self
                .platform
                .ok_or_else(|| anyhow!("alarm scheduler needs a platform"))?,
            clock: self.clock,
            past_due_grace: self.past_due_grace,
        })
    }
}

impl Default for AlarmSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmScheduler {
    pub fn builder() -> AlarmSchedulerBuilder {
        AlarmSchedulerBuilder::new()
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Persists the alarm and arms its OS timer.
    ///
    /// A fire time that already passed is moved to `now + past_due_grace`
    /// instead of being rejected. The returned record carries the effective
    /// fire time.
    pub fn schedule(&self, request: AlarmRequest) -> Result<AlarmRecord, AlarmError> {
        if let Err(err) = validate(&request) {
            warn!(alarm_id = request.id, %err, "rejecting alarm");
            return Err(err);
        }
        if !self.platform.can_schedule_exact_alarms() {
            warn!(alarm_id = request.id, "exact alarm permission missing, not scheduling");
            return Err(AlarmError::PermissionDenied);
        }

        let now = self.clock.now_millis();
        let mut record = AlarmRecord::from(request);
        if record.fire_at_millis <= now {
            let corrected = now.saturating_add(self.grace_millis());
            info!(
                alarm_id = record.id,
                requested = record.fire_at_millis,
                corrected,
                "fire time already passed, deferring"
            );
            record.fire_at_millis = corrected;
        }

        // Persist first: a crash before arming leaves a record to re-arm,
        // a crash before persisting leaves nothing armed either.
        if let Err(err) = self.store.save(&record) {
            error!(alarm_id = record.id, %err, "failed to persist alarm");
            return Err(err.into());
        }

        let tier = TimerTier::for_api_level(self.platform.api_level());
        let registration = TimerRegistration {
            id: record.id,
            fire_at_millis: record.fire_at_millis,
            tier,
        };
        if let Err(err) = self.timer.arm(&registration) {
            error!(alarm_id = record.id, %err, "failed to arm wake timer");
            return Err(err.into());
        }

        info!(
            alarm_id = record.id,
            fire_at = %display_millis(record.fire_at_millis),
            %tier,
            "alarm scheduled"
        );
        Ok(record)
    }

    /// Disarms the timer and drops the record. Both steps are attempted even
    /// if the first fails; the first failure is returned.
    pub fn cancel(&self, id: AlarmId) -> Result<(), AlarmError> {
        let disarmed = self.timer.disarm(id);
        if let Err(err) = &disarmed {
            error!(alarm_id = id, %err, "failed to disarm wake timer");
        }
        let deleted = self.store.delete(id);
        if let Err(err) = &deleted {
            error!(alarm_id = id, %err, "failed to delete alarm record");
        }
        disarmed?;
        deleted?;
        info!(alarm_id = id, "alarm cancelled");
        Ok(())
    }

    /// Disarms every stored alarm, carrying on past individual failures, then
    /// clears the store.
    pub fn cancel_all(&self) -> Result<CancelAllReport, AlarmError> {
        let records = self.store.get_all().map_err(|err| {
            error!(%err, "failed to enumerate alarms for cancellation");
            err
        })?;

        let mut report = CancelAllReport::default();
        for record in &records {
            match self.timer.disarm(record.id) {
                Ok(()) => report.cancelled += 1,
                Err(err) => {
                    warn!(alarm_id = record.id, %err, "failed to disarm wake timer, continuing");
                    report.failed.push(record.id);
                }
            }
        }

        self.store.clear().map_err(|err| {
            error!(%err, "failed to clear alarm store");
            err
        })?;
        info!(
            cancelled = report.cancelled,
            failed = report.failed.len(),
            "all alarms cancelled"
        );
        Ok(report)
    }

    /// What the store says should be armed. The OS cannot be asked, so this
    /// may differ from the live timer table.
    pub fn scheduled_alarms(&self) -> Result<Vec<AlarmRecord>, AlarmError> {
        Ok(self.store.get_all()?)
    }

    pub fn can_schedule_exact_alarms(&self) -> bool {
        self.platform.can_schedule_exact_alarms()
    }

    /// Re-arms every record that has not fired yet.
    pub fn reconcile(&self) -> Result<RecoveryReport, AlarmError> {
        let active = self.store.get_active(self.clock.now_millis())?;
        Ok(self.rearm(active))
    }

    /// Schedules each record again, one failure never stopping the rest.
    pub fn rearm(&self, records: Vec<AlarmRecord>) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for record in records {
            report.attempted += 1;
            match self.schedule(record.to_request()) {
                Ok(_) => report.rearmed += 1,
                Err(err) => report.failed.push((record.id, err.to_string())),
            }
        }
        report
    }

    /// Deletes records that are older than the grace window and were never
    /// consumed by a firing.
    pub fn purge_expired(&self) -> Result<usize, AlarmError> {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.grace_millis());
        let mut purged = 0;
        for record in self.store.get_all()? {
            if record.fire_at_millis < cutoff {
                self.store.delete(record.id)?;
                debug!(alarm_id = record.id, "purged stale alarm record");
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn grace_millis(&self) -> i64 {
        i64::try_from(self.past_due_grace.as_millis()).unwrap_or(i64::MAX)
    }
}

fn validate(request: &AlarmRequest) -> Result<(), AlarmError> {
    if request.id <= 0 {
        return Err(AlarmError::InvalidRequest(format!(
            "id must be positive, got {}",
            request.id
        )));
    }
    if request.title.trim().is_empty() {
        return Err(AlarmError::InvalidRequest("title is empty".into()));
    }
    if request.body.trim().is_empty() {
        return Err(AlarmError::InvalidRequest("body is empty".into()));
    }
    Ok(())
}

fn display_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAlarmStore;
    use crate::testing::{FakePlatform, ManualClock, RecordingTimer};

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        store: Arc<MemoryAlarmStore>,
        timer: Arc<RecordingTimer>,
        platform: Arc<FakePlatform>,
        clock: Arc<ManualClock>,
        scheduler: AlarmScheduler,
    }

    fn fixture(api_level: u32, permission: bool) -> Fixture {
        let store = Arc::new(MemoryAlarmStore::new());
        let timer = Arc::new(RecordingTimer::new());
        let platform = Arc::new(FakePlatform::new(api_level, permission));
        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = AlarmScheduler::builder()
            .with_store(store.clone())
            .with_timer(timer.clone())
            .with_platform(platform.clone())
            .with_clock(clock.clone())
            .build()
            .expect("build scheduler");
        Fixture {
            store,
            timer,
            platform,
            clock,
            scheduler,
        }
    }

    fn ids(records: &[AlarmRecord]) -> Vec<AlarmId> {
        records.iter().map(|record| record.id).collect()
    }

    #[test]
    fn schedule_then_cancel_round_trip() {
        let fx = fixture(34, true);
        let request = AlarmRequest::new(42, "Pill", "Take now", NOW + 5_000).with_payload("med:42");
        let record = fx.scheduler.schedule(request).expect("schedule");
        assert_eq!(record.fire_at_millis, NOW + 5_000);

        assert_eq!(ids(&fx.scheduler.scheduled_alarms().unwrap()), vec![42]);
        let armed = fx.timer.registration(42).expect("timer armed");
        assert_eq!(armed.fire_at_millis, NOW + 5_000);
        assert_eq!(armed.tier, TimerTier::ExactAllowWhileIdle);

        fx.scheduler.cancel(42).expect("cancel");
        assert!(fx.scheduler.scheduled_alarms().unwrap().is_empty());
        assert!(fx.timer.armed().is_empty());
    }

    #[test]
    fn cancel_unknown_id_is_neutral() {
        let fx = fixture(34, true);
        assert!(fx.scheduler.cancel(7).is_ok());
        assert!(fx.scheduler.cancel(-1).is_ok());
    }

    #[test]
    fn past_fire_time_is_deferred_by_grace() {
        let fx = fixture(34, true);
        let record = fx
            .scheduler
            .schedule(AlarmRequest::new(1, "Late", "body", NOW - 60_000))
            .unwrap();
        assert_eq!(record.fire_at_millis, NOW + 30_000);
        assert_eq!(fx.store.get(1).unwrap().unwrap().fire_at_millis, NOW + 30_000);

        let at_now = fx
            .scheduler
            .schedule(AlarmRequest::new(2, "Now", "body", NOW))
            .unwrap();
        assert_eq!(at_now.fire_at_millis, NOW + 30_000);
    }

    #[test]
    fn invalid_requests_persist_nothing() {
        let fx = fixture(34, true);
        for request in [
            AlarmRequest::new(0, "t", "b", NOW + 1),
            AlarmRequest::new(-5, "t", "b", NOW + 1),
            AlarmRequest::new(3, "  ", "b", NOW + 1),
            AlarmRequest::new(4, "t", "", NOW + 1),
        ] {
            let err = fx.scheduler.schedule(request).unwrap_err();
            assert!(matches!(err, AlarmError::InvalidRequest(_)));
        }
        assert!(fx.store.is_empty());
        assert_eq!(fx.timer.arm_calls(), 0);
    }

    #[test]
    fn missing_permission_is_rejected_on_gated_versions() {
        let fx = fixture(33, false);
        let err = fx
            .scheduler
            .schedule(AlarmRequest::new(1, "t", "b", NOW + 1_000))
            .unwrap_err();
        assert!(matches!(err, AlarmError::PermissionDenied));
        assert!(fx.store.is_empty());

        fx.platform.set_permission(true);
        assert!(fx.scheduler.can_schedule_exact_alarms());
        assert!(fx
            .scheduler
            .schedule(AlarmRequest::new(1, "t", "b", NOW + 1_000))
            .is_ok());
    }

    #[test]
    fn old_versions_skip_permission_and_degrade_tier() {
        let fx = fixture(18, false);
        assert!(fx.scheduler.can_schedule_exact_alarms());
        fx.scheduler
            .schedule(AlarmRequest::new(9, "t", "b", NOW + 1_000))
            .unwrap();
        assert_eq!(fx.timer.registration(9).unwrap().tier, TimerTier::Legacy);
    }

    #[test]
    fn rescheduling_replaces_record() {
        let fx = fixture(34, true);
        fx.scheduler
            .schedule(AlarmRequest::new(5, "first", "b", NOW + 1_000))
            .unwrap();
        fx.scheduler
            .schedule(AlarmRequest::new(5, "second", "b", NOW + 2_000))
            .unwrap();
        let all = fx.scheduler.scheduled_alarms().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "second");
        assert_eq!(fx.timer.registration(5).unwrap().fire_at_millis, NOW + 2_000);
    }

    #[test]
    fn arm_failure_keeps_record_for_recovery() {
        let fx = fixture(34, true);
        fx.timer.fail_for(8);
        let err = fx
            .scheduler
            .schedule(AlarmRequest::new(8, "t", "b", NOW + 1_000))
            .unwrap_err();
        assert!(matches!(err, AlarmError::Platform(_)));
        assert!(fx.store.get(8).unwrap().is_some());
    }

    #[test]
    fn cancel_all_continues_past_failures() {
        let fx = fixture(34, true);
        for id in 1..=5 {
            fx.scheduler
                .schedule(AlarmRequest::new(id, "t", "b", NOW + 1_000 * id as i64))
                .unwrap();
        }
        fx.timer.fail_for(3);

        let report = fx.scheduler.cancel_all().expect("cancel all");
        assert_eq!(report.cancelled, 4);
        assert_eq!(report.failed, vec![3]);
        assert!(fx.scheduler.scheduled_alarms().unwrap().is_empty());
        assert_eq!(ids_of_armed(&fx.timer), vec![3]);
    }

    fn ids_of_armed(timer: &RecordingTimer) -> Vec<AlarmId> {
        timer.armed().into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn reconcile_rearms_only_active_records() {
        let fx = fixture(34, true);
        fx.scheduler
            .schedule(AlarmRequest::new(1, "soon", "b", NOW + 1_000))
            .unwrap();
        fx.scheduler
            .schedule(AlarmRequest::new(2, "later", "b", NOW + 60_000))
            .unwrap();
        fx.timer.wipe();
        fx.clock.advance(Duration::from_secs(10));

        let report = fx.scheduler.reconcile().unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.rearmed, 1);
        assert_eq!(ids_of_armed(&fx.timer), vec![2]);
    }

    #[test]
    fn purge_drops_only_records_past_the_grace_window() {
        let fx = fixture(34, true);
        fx.store
            .save(&AlarmRecord::from(AlarmRequest::new(1, "t", "b", NOW - 120_000)))
            .unwrap();
        fx.store
            .save(&AlarmRecord::from(AlarmRequest::new(2, "t", "b", NOW - 10_000)))
            .unwrap();
        fx.store
            .save(&AlarmRecord::from(AlarmRequest::new(3, "t", "b", NOW + 10_000)))
            .unwrap();

        assert_eq!(fx.scheduler.purge_expired().unwrap(), 1);
        assert_eq!(ids(&fx.scheduler.scheduled_alarms().unwrap()), vec![2, 3]);
    }

    #[test]
    fn oversized_grace_saturates_instead_of_wrapping() {
        let store = Arc::new(MemoryAlarmStore::new());
        let scheduler = AlarmScheduler::builder()
            .with_store(store.clone())
            .with_timer(Arc::new(RecordingTimer::new()))
            .with_platform(Arc::new(FakePlatform::default()))
            .with_clock(Arc::new(ManualClock::new(NOW)))
            .with_past_due_grace(Duration::from_secs(10_000_000_000_000_000))
            .build()
            .unwrap();

        let late = scheduler
            .schedule(AlarmRequest::new(1, "t", "b", NOW - 1))
            .unwrap();
        assert_eq!(late.fire_at_millis, i64::MAX);

        store
            .save(&AlarmRecord::from(AlarmRequest::new(2, "t", "b", NOW + 3_600_000)))
            .unwrap();
        assert_eq!(scheduler.purge_expired().unwrap(), 0);
        assert_eq!(ids(&scheduler.scheduled_alarms().unwrap()), vec![1, 2]);
    }

    #[test]
    fn cancel_drops_record_even_when_disarm_fails() {
        let fx = fixture(34, true);
        fx.scheduler
            .schedule(AlarmRequest::new(6, "t", "b", NOW + 1_000))
            .unwrap();
        fx.timer.fail_for(6);

        let err = fx.scheduler.cancel(6).unwrap_err();
        assert!(matches!(err, AlarmError::Platform(_)));
        assert_eq!(fx.store.get(6).unwrap(), None);
    }

    #[test]
    fn builder_requires_collaborators() {
        assert!(AlarmScheduler::builder().build().is_err());
    }
}
