use std::io::{BufRead, Write};
use std::sync::Arc;

use alarm_core::notifications::{NotificationPresenter, NotificationTap};
use alarm_core::platform::{Clock, SystemClock};
use alarm_core::recovery::{BootRecovery, BootSignal};
use alarm_core::{AlarmConfig, AlarmControl, AlarmFiredHandler, AlarmScheduler, FileAlarmStore};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::device::{DeliveryLoop, SimulatedDevice};

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub(crate) alarm: AlarmConfig,
    pub(crate) api_level: u32,
    pub(crate) exact_permission: bool,
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            alarm: AlarmConfig::from_env()?,
            ..Self::default()
        };
        if let Ok(level) = std::env::var("ALARM_HOST_API_LEVEL") {
            if let Ok(value) = level.trim().parse::<u32>() {
                config.api_level = value;
            }
        }
        if let Ok(flag) = std::env::var("ALARM_HOST_EXACT_PERMISSION") {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.exact_permission = true,
                "0" | "false" | "no" => config.exact_permission = false,
                other => warn!(value = other, "ignoring ALARM_HOST_EXACT_PERMISSION"),
            }
        }
        Ok(config)
    }

    pub fn with_alarm_config(mut self, alarm: AlarmConfig) -> Self {
        self.alarm = alarm;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            alarm: AlarmConfig::default(),
            api_level: 34,
            exact_permission: true,
        }
    }
}

/// Composition root: owns every component and the simulated device.
pub struct AlarmHost {
    device: Arc<SimulatedDevice>,
    control: AlarmControl,
    recovery: BootRecovery,
    _delivery: DeliveryLoop,
}

impl AlarmHost {
    pub fn start(config: HostConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::start_with_clock(config, clock)
    }

    pub fn start_with_clock(config: HostConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(
            FileAlarmStore::open(&config.alarm.store_path).with_context(|| {
                format!("opening alarm store {}", config.alarm.store_path.display())
            })?,
        );
        let device = Arc::new(SimulatedDevice::new(
            config.api_level,
            config.exact_permission,
            clock.clone(),
        ));
        let scheduler = Arc::new(
            AlarmScheduler::builder()
                .with_store(store.clone())
                .with_timer(device.clone())
                .with_platform(device.clone())
                .with_clock(clock)
                .with_config(&config.alarm)
                .build()?,
        );
        let presenter = Arc::new(NotificationPresenter::new(
            device.clone(),
            config.alarm.channel.clone(),
        ));
        let fired = Arc::new(
            AlarmFiredHandler::new(store.clone(), presenter.clone(), device.clone())
                .with_config(&config.alarm),
        );
        let recovery = BootRecovery::new(store, scheduler.clone());
        let control = AlarmControl::new(scheduler, device.clone(), presenter).with_tap_listener(
            Box::new(|tap: &NotificationTap| {
                info!(alarm_id = tap.id, payload = ?tap.payload, "notification opened");
            }),
        );

        // A fresh process has an empty timer table, exactly as after a boot.
        let report = recovery.recover();
        info!(rearmed = report.rearmed, "host started");

        let delivery = device.start_delivery(fired);
        Ok(Self {
            device,
            control,
            recovery,
            _delivery: delivery,
        })
    }

    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }

    pub fn control(&self) -> &AlarmControl {
        &self.control
    }

    /// Handles one `{"method": ..., "args": ...}` call. Host-only methods
    /// drive the simulated device; everything else goes to the control surface.
    pub fn handle_call(&self, call: Value) -> Value {
        let method = call
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = call.get("args").cloned().unwrap_or(Value::Null);
        match method.as_str() {
            "reboot" => {
                self.device.reboot();
                let report = self.recovery.on_signal(&BootSignal::BootCompleted);
                json!({"status": "ok", "value": report})
            }
            "setExactPermission" => match args.get("granted").and_then(Value::as_bool) {
                Some(granted) => {
                    self.device.set_exact_permission(granted);
                    json!({"status": "ok", "value": granted})
                }
                None => json!({
                    "status": "failed",
                    "reason": "invalid_request",
                    "message": "`granted` must be a boolean",
                }),
            },
            "tapNotification" => match serde_json::from_value::<NotificationTap>(args) {
                Ok(tap) => {
                    self.control.notification_tapped(tap);
                    json!({"status": "ok", "value": true})
                }
                Err(err) => json!({
                    "status": "failed",
                    "reason": "invalid_request",
                    "message": err.to_string(),
                }),
            },
            "tray" => json!({"status": "ok", "value": self.device.tray()}),
            _ => self.control.dispatch(&method, args),
        }
    }

    /// Serves line-delimited JSON calls until `input` is exhausted.
    pub fn serve(&self, input: impl BufRead, mut output: impl Write) -> Result<()> {
        for line in input.lines() {
            let line = line.context("reading host input")?;
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Value>(&line) {
                Ok(call) => self.handle_call(call),
                Err(err) => json!({
                    "status": "failed",
                    "reason": "invalid_request",
                    "message": err.to_string(),
                }),
            };
            writeln!(output, "{response}").context("writing host output")?;
            output.flush()?;
        }
        Ok(())
    }
}

pub fn run(config: HostConfig) -> Result<()> {
    let host = AlarmHost::start(config)?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    host.serve(stdin.lock(), stdout.lock())
}
