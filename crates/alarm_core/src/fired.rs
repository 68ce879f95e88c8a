use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{AlarmConfig, DEFAULT_WAKE_LOCK_TIMEOUT};
use crate::notifications::NotificationPresenter;
use crate::platform::WakeLock;
use crate::record::AlarmId;
use crate::store::AlarmStore;

/// Extra under which an armed timer carries its alarm id.
pub const EXTRA_ALARM_ID: &str = "alarm_id";
const WAKE_LOCK_TAG: &str = "alarm_core:fired";

/// What the OS hands back when a wake timer elapses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerElapsed {
    pub extras: BTreeMap<String, String>,
}

impl TimerElapsed {
    pub fn for_alarm(id: AlarmId) -> Self {
        let mut extras = BTreeMap::new();
        extras.insert(EXTRA_ALARM_ID.to_string(), id.to_string());
        Self { extras }
    }

    pub fn alarm_id(&self) -> Option<AlarmId> {
        self.extras
            .get(EXTRA_ALARM_ID)?
            .trim()
            .parse::<AlarmId>()
            .ok()
            .filter(|id| *id > 0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FiredOutcome {
    /// The stored alarm was shown and its record consumed.
    Delivered(AlarmId),
    /// No record could be resolved; a generic notification was shown.
    Fallback(AlarmId),
    /// The event carried no usable id; nothing was shown.
    Malformed,
    /// The notification could not be shown.
    PresentFailed(AlarmId),
}

/// Receiver for elapsed wake timers.
///
/// The OS gives the receiver a bounded window before it may suspend the
/// process again; the handler holds a wake lock for the whole run, but work
/// beyond the OS-enforced ceiling is cut off by the platform.
pub struct AlarmFiredHandler {
    store: Arc<dyn AlarmStore>,
    presenter: Arc<NotificationPresenter>,
    wake_lock: Arc<dyn WakeLock>,
    wake_lock_timeout: Duration,
    fallback_title: String,
    fallback_body: String,
}

impl AlarmFiredHandler {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        presenter: Arc<NotificationPresenter>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        let defaults = AlarmConfig::default();
        Self {
            store,
            presenter,
            wake_lock,
            wake_lock_timeout: DEFAULT_WAKE_LOCK_TIMEOUT,
            fallback_title: defaults.fallback_title,
            fallback_body: defaults.fallback_body,
        }
    }

    pub fn with_config(mut self, config: &AlarmConfig) -> Self {
        self.wake_lock_timeout = config.wake_lock_timeout;
        self.fallback_title = config.fallback_title.clone();
        self.fallback_body = config.fallback_body.clone();
        self
    }

    /// Handles one timer elapse. Never fails towards the OS: every error is
    /// logged and folded into the returned outcome.
    pub fn on_timer_elapsed(&self, event: &TimerElapsed) -> FiredOutcome {
        let _guard = match self.wake_lock.acquire(WAKE_LOCK_TAG, self.wake_lock_timeout) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(%err, "running alarm receiver without a wake lock");
                None
            }
        };

        let Some(id) = event.alarm_id() else {
            warn!(extras = ?event.extras, "timer elapsed without a valid alarm id");
            return FiredOutcome::Malformed;
        };

        let record = match self.store.get(id) {
            Ok(record) => record,
            Err(err) => {
                error!(alarm_id = id, %err, "could not read alarm record");
                None
            }
        };

        let Some(record) = record else {
            info!(alarm_id = id, "no record for fired alarm, showing fallback");
            return match self
                .presenter
                .show_fallback(id, &self.fallback_title, &self.fallback_body)
            {
                Ok(()) => FiredOutcome::Fallback(id),
                Err(err) => {
                    error!(alarm_id = id, %err, "fallback notification failed");
                    FiredOutcome::PresentFailed(id)
                }
            };
        };

        if let Err(err) = self.presenter.show(
            record.id,
            &record.title,
            &record.body,
            record.payload.as_deref(),
        ) {
            error!(alarm_id = id, %err, "alarm notification failed, keeping record");
            return FiredOutcome::PresentFailed(id);
        }

        if let Err(err) = self.store.delete(id) {
            error!(alarm_id = id, %err, "could not consume fired alarm record");
        } else {
            debug!(alarm_id = id, "fired alarm consumed");
        }
        FiredOutcome::Delivered(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{ChannelSpec, NotificationKind};
    use crate::record::{AlarmRecord, AlarmRequest};
    use crate::store::MemoryAlarmStore;
    use crate::testing::{CountingWakeLock, RecordingSink};

    struct Fixture {
        store: Arc<MemoryAlarmStore>,
        sink: Arc<RecordingSink>,
        wake_lock: Arc<CountingWakeLock>,
        handler: AlarmFiredHandler,
    }

    fn fixture(records: Vec<AlarmRecord>) -> Fixture {
        let store = Arc::new(MemoryAlarmStore::with_records(records));
        let sink = Arc::new(RecordingSink::new());
        let presenter = Arc::new(NotificationPresenter::new(
            sink.clone(),
            ChannelSpec::default(),
        ));
        let wake_lock = Arc::new(CountingWakeLock::new());
        let handler = AlarmFiredHandler::new(store.clone(), presenter, wake_lock.clone());
        Fixture {
            store,
            sink,
            wake_lock,
            handler,
        }
    }

    fn pill() -> AlarmRecord {
        AlarmRecord::from(AlarmRequest::new(42, "Pill", "Take now", 5_000).with_payload("med"))
    }

    #[test]
    fn stored_alarm_is_shown_and_consumed() {
        let fx = fixture(vec![pill()]);
        let outcome = fx.handler.on_timer_elapsed(&TimerElapsed::for_alarm(42));
        assert_eq!(outcome, FiredOutcome::Delivered(42));

        let shown = fx.sink.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].id, 42);
        assert_eq!((shown[0].title.as_str(), shown[0].body.as_str()), ("Pill", "Take now"));
        assert_eq!(shown[0].payload.as_deref(), Some("med"));
        assert!(fx.store.is_empty());
        assert_eq!(fx.wake_lock.acquired(), 1);
        assert_eq!(fx.wake_lock.held(), 0);
    }

    #[test]
    fn missing_record_shows_exactly_one_fallback() {
        let fx = fixture(vec![]);
        let outcome = fx.handler.on_timer_elapsed(&TimerElapsed::for_alarm(7));
        assert_eq!(outcome, FiredOutcome::Fallback(7));
        let shown = fx.sink.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].kind, NotificationKind::Fallback);
        assert_eq!(shown[0].title, "Reminder");
    }

    #[test]
    fn malformed_events_show_nothing() {
        let fx = fixture(vec![pill()]);
        let mut bad = TimerElapsed::default();
        assert_eq!(fx.handler.on_timer_elapsed(&bad), FiredOutcome::Malformed);
        bad.extras.insert(EXTRA_ALARM_ID.into(), "not-a-number".into());
        assert_eq!(fx.handler.on_timer_elapsed(&bad), FiredOutcome::Malformed);
        bad.extras.insert(EXTRA_ALARM_ID.into(), "-3".into());
        assert_eq!(fx.handler.on_timer_elapsed(&bad), FiredOutcome::Malformed);

        assert!(fx.sink.shown().is_empty());
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.wake_lock.held(), 0);
    }

    #[test]
    fn failed_show_keeps_record() {
        let fx = fixture(vec![pill()]);
        fx.sink.fail_show(true);
        let outcome = fx.handler.on_timer_elapsed(&TimerElapsed::for_alarm(42));
        assert_eq!(outcome, FiredOutcome::PresentFailed(42));
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.wake_lock.held(), 0);
    }

    #[test]
    fn runs_without_wake_lock_when_unavailable() {
        let fx = fixture(vec![pill()]);
        fx.wake_lock.make_unavailable();
        let outcome = fx.handler.on_timer_elapsed(&TimerElapsed::for_alarm(42));
        assert_eq!(outcome, FiredOutcome::Delivered(42));
        assert_eq!(fx.wake_lock.acquired(), 0);
    }
}
