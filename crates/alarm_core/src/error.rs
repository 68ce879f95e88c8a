use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::AlarmId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("alarm store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("alarm store serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("alarm store at {path} has version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure reported by one of the host OS facilities.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("wake timer rejected alarm {id}: {reason}")]
    Timer { id: AlarmId, reason: String },
    #[error("wake lock unavailable: {0}")]
    WakeLock(String),
    #[error("notification failed: {0}")]
    Notification(String),
    #[error("settings screen unavailable: {0}")]
    Settings(String),
}

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("invalid alarm request: {0}")]
    InvalidRequest(String),
    #[error("exact alarm permission not granted")]
    PermissionDenied,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Coarse failure category handed across the control boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidRequest,
    PermissionDenied,
    Storage,
    Platform,
    UnknownMethod,
}

impl AlarmError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AlarmError::InvalidRequest(_) => FailureReason::InvalidRequest,
            AlarmError::PermissionDenied => FailureReason::PermissionDenied,
            AlarmError::Store(_) => FailureReason::Storage,
            AlarmError::Platform(_) => FailureReason::Platform,
        }
    }
}
