pub mod config;
pub mod control;
pub mod error;
pub mod fired;
pub mod notifications;
pub mod platform;
pub mod record;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod testing;

pub use crate::config::AlarmConfig;
pub use crate::control::AlarmControl;
pub use crate::error::{AlarmError, PlatformError, StoreError};
pub use crate::fired::AlarmFiredHandler;
pub use crate::record::{AlarmId, AlarmRecord, AlarmRequest};
pub use crate::recovery::BootRecovery;
pub use crate::scheduler::{AlarmScheduler, AlarmSchedulerBuilder};
pub use crate::store::{AlarmStore, FileAlarmStore, MemoryAlarmStore};
