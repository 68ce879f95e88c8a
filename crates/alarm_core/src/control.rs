//! Boundary used by the application layer.
//!
//! Calls arrive either as typed method calls or as `(method, json args)`
//! pairs from a method channel. Every result is a [`ControlResponse`]; no
//! error crosses this boundary as a panic or an `Err`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{AlarmError, FailureReason};
use crate::notifications::{NotificationPresenter, NotificationTap};
use crate::platform::AlarmPlatform;
use crate::record::{AlarmId, AlarmRecord, AlarmRequest};
use crate::scheduler::{AlarmScheduler, CancelAllReport};

pub type TapListener = Box<dyn Fn(&NotificationTap) + Send + Sync>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse<T> {
    Ok {
        value: T,
    },
    Failed {
        reason: FailureReason,
        message: String,
    },
}

impl<T> ControlResponse<T> {
    pub fn ok(value: T) -> Self {
        ControlResponse::Ok { value }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        ControlResponse::Failed {
            reason,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ControlResponse::Ok { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ControlResponse::Ok { value } => Some(value),
            ControlResponse::Failed { .. } => None,
        }
    }
}

impl<T> From<Result<T, AlarmError>> for ControlResponse<T> {
    fn from(result: Result<T, AlarmError>) -> Self {
        match result {
            Ok(value) => ControlResponse::ok(value),
            Err(err) => ControlResponse::failed(err.reason(), err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleAlarmArgs {
    pub id: i64,
    pub title: String,
    pub body: String,
    #[serde(alias = "timestamp")]
    pub fire_at_epoch_millis: i64,
    #[serde(default)]
    pub payload: Option<String>,
}

impl TryFrom<ScheduleAlarmArgs> for AlarmRequest {
    type Error = AlarmError;

    fn try_from(args: ScheduleAlarmArgs) -> Result<Self, Self::Error> {
        let id = AlarmId::try_from(args.id)
            .map_err(|_| AlarmError::InvalidRequest(format!("id {} out of range", args.id)))?;
        Ok(AlarmRequest {
            id,
            title: args.title,
            body: args.body,
            fire_at_millis: args.fire_at_epoch_millis,
            payload: args.payload.filter(|payload| !payload.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CancelArgs {
    id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSummary {
    pub id: AlarmId,
    pub title: String,
    pub body: String,
    pub fire_at_epoch_millis: i64,
    pub payload: Option<String>,
}

impl From<AlarmRecord> for AlarmSummary {
    fn from(record: AlarmRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            body: record.body,
            fire_at_epoch_millis: record.fire_at_millis,
            payload: record.payload,
        }
    }
}

pub struct AlarmControl {
    scheduler: Arc<AlarmScheduler>,
    platform: Arc<dyn AlarmPlatform>,
    presenter: Arc<NotificationPresenter>,
    tap_listener: Option<TapListener>,
}

impl AlarmControl {
    pub fn new(
        scheduler: Arc<AlarmScheduler>,
        platform: Arc<dyn AlarmPlatform>,
        presenter: Arc<NotificationPresenter>,
    ) -> Self {
        Self {
            scheduler,
            platform,
            presenter,
            tap_listener: None,
        }
    }

    pub fn with_tap_listener(mut self, listener: TapListener) -> Self {
        self.tap_listener = Some(listener);
        self
    }

    pub fn schedule_alarm(&self, args: ScheduleAlarmArgs) -> ControlResponse<AlarmSummary> {
        AlarmRequest::try_from(args)
            .and_then(|request| self.scheduler.schedule(request))
            .map(AlarmSummary::from)
            .into()
    }

    pub fn cancel_alarm(&self, id: i64) -> ControlResponse<bool> {
        // Ids outside the valid range can never have been scheduled.
        let Ok(id) = AlarmId::try_from(id) else {
            return ControlResponse::ok(true);
        };
        self.scheduler.cancel(id).map(|()| true).into()
    }

    pub fn cancel_all_alarms(&self) -> ControlResponse<CancelAllReport> {
        self.scheduler.cancel_all().into()
    }

    /// Empty on storage failure; the failure is logged.
    pub fn get_all_scheduled_alarms(&self) -> Vec<AlarmSummary> {
        match self.scheduler.scheduled_alarms() {
            Ok(records) => records.into_iter().map(AlarmSummary::from).collect(),
            Err(err) => {
                warn!(%err, "cannot list scheduled alarms");
                Vec::new()
            }
        }
    }

    pub fn can_schedule_exact_alarms(&self) -> bool {
        self.scheduler.can_schedule_exact_alarms()
    }

    pub fn open_alarm_permission_settings(&self) -> ControlResponse<bool> {
        self.platform
            .open_exact_alarm_settings()
            .map(|()| true)
            .map_err(AlarmError::from)
            .into()
    }

    /// Dismisses the tapped notification and hands its payload to the app.
    pub fn notification_tapped(&self, tap: NotificationTap) {
        if let Err(err) = self.presenter.cancel(tap.id) {
            warn!(alarm_id = tap.id, %err, "could not dismiss tapped notification");
        }
        match &self.tap_listener {
            Some(listener) => listener(&tap),
            None => debug!(alarm_id = tap.id, "notification tapped with no listener"),
        }
    }

    pub fn dispatch(&self, method: &str, args: Value) -> Value {
        debug!(method, "control call");
        match method {
            "scheduleAlarm" => match parse_args::<ScheduleAlarmArgs>(args) {
                Ok(args) => respond(self.schedule_alarm(args)),
                Err(failure) => respond(failure),
            },
            "cancelAlarm" => match parse_args::<CancelArgs>(args) {
                Ok(args) => respond(self.cancel_alarm(args.id)),
                Err(failure) => respond(failure),
            },
            "cancelAllAlarms" => respond(self.cancel_all_alarms()),
            "getAllScheduledAlarms" => respond(ControlResponse::ok(self.get_all_scheduled_alarms())),
            "canScheduleExactAlarms" => respond(ControlResponse::ok(self.can_schedule_exact_alarms())),
            "openAlarmPermissionSettings" => respond(self.open_alarm_permission_settings()),
            other => respond(ControlResponse::<()>::failed(
                FailureReason::UnknownMethod,
                format!("unknown method `{other}`"),
            )),
        }
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ControlResponse<()>> {
    serde_json::from_value(args).map_err(|err| {
        warn!(%err, "malformed control arguments");
        ControlResponse::failed(FailureReason::InvalidRequest, err.to_string())
    })
}

fn respond<T: Serialize>(response: ControlResponse<T>) -> Value {
    serde_json::to_value(&response).unwrap_or_else(|err| {
        json!({
            "status": "failed",
            "reason": FailureReason::InvalidRequest,
            "message": format!("unencodable response: {err}"),
        })
    })
}
