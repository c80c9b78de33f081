//! Device status snapshot
//!
//! One mutable snapshot per client. Every writer replaces whole fields under
//! a lock, so readers always see a consistent copy; the last write wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// Client-side operation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStage {
    Disconnected,
    Connected,
    Reconnecting,
    Slewing,
    Tracking,
    Focusing,
    Imaging,
    Parking,
    Parked,
    Error,
}

impl OperationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStage::Disconnected => "disconnected",
            OperationStage::Connected => "connected",
            OperationStage::Reconnecting => "reconnecting",
            OperationStage::Slewing => "slewing",
            OperationStage::Tracking => "tracking",
            OperationStage::Focusing => "focusing",
            OperationStage::Imaging => "imaging",
            OperationStage::Parking => "parking",
            OperationStage::Parked => "parked",
            OperationStage::Error => "error",
        }
    }

    /// Parse the client-side stage name carried by state-change pushes
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disconnected" => Some(OperationStage::Disconnected),
            "connected" => Some(OperationStage::Connected),
            "reconnecting" => Some(OperationStage::Reconnecting),
            "slewing" => Some(OperationStage::Slewing),
            "tracking" => Some(OperationStage::Tracking),
            "focusing" => Some(OperationStage::Focusing),
            "imaging" => Some(OperationStage::Imaging),
            "parking" => Some(OperationStage::Parking),
            "parked" => Some(OperationStage::Parked),
            "error" => Some(OperationStage::Error),
            _ => None,
        }
    }

    /// Map a device-reported stage (`AutoGoto`, `Stack`, ...) to a client stage.
    /// `None` and `Idle` both mean the scope is idle and ready.
    pub fn from_device_stage(stage: Option<&str>) -> Option<Self> {
        match stage {
            Some("AutoGoto") => Some(OperationStage::Slewing),
            Some("AutoFocus") => Some(OperationStage::Focusing),
            Some("Stack") => Some(OperationStage::Imaging),
            Some("ScopeHome") => Some(OperationStage::Parking),
            Some("Idle") | None => Some(OperationStage::Tracking),
            Some(_) => None,
        }
    }
}

impl std::fmt::Display for OperationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mount coordinate mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    AltAz,
    Equatorial,
    Unknown,
}

/// Snapshot of what the client believes about the device
#[derive(Debug, Clone, Serialize)]
pub struct SeestarStatus {
    pub connected: bool,
    pub stage: OperationStage,
    pub mount_mode: MountMode,
    pub equatorial_initialized: bool,
    pub current_target: Option<String>,
    pub current_ra_hours: Option<f64>,
    pub current_dec_degrees: Option<f64>,
    pub firmware_version: Option<String>,
    pub is_tracking: bool,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for SeestarStatus {
    fn default() -> Self {
        Self {
            connected: false,
            stage: OperationStage::Disconnected,
            mount_mode: MountMode::AltAz,
            equatorial_initialized: false,
            current_target: None,
            current_ra_hours: None,
            current_dec_degrees: None,
            firmware_version: None,
            is_tracking: false,
            last_error: None,
            last_update: None,
        }
    }
}

/// Observer notified after every status change
pub type StatusCallback = Arc<dyn Fn(&SeestarStatus) + Send + Sync>;

/// Shared status container
pub struct StatusModel {
    status: RwLock<SeestarStatus>,
    observer: RwLock<Option<StatusCallback>>,
}

impl StatusModel {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(SeestarStatus::default()),
            observer: RwLock::new(None),
        }
    }

    /// Copy of the current status
    pub fn snapshot(&self) -> SeestarStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    #[cfg(test)]
    pub fn stage(&self) -> OperationStage {
        self.snapshot().stage
    }

    pub fn set_observer(&self, callback: Option<StatusCallback>) {
        *self
            .observer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    /// Apply an update, stamp it and notify the observer
    pub fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut SeestarStatus),
    {
        let snapshot = {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            apply(&mut status);
            status.last_update = Some(Utc::now());
            status.clone()
        };

        tracing::debug!(
            stage = %snapshot.stage,
            connected = snapshot.connected,
            "Telescope status update"
        );

        let observer = self
            .observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(observer) = observer {
            if catch_unwind(AssertUnwindSafe(|| observer(&snapshot))).is_err() {
                tracing::error!("Status callback panicked");
            }
        }
    }

    pub fn set_stage(&self, stage: OperationStage) {
        self.update(|s| {
            s.stage = stage;
            s.is_tracking = stage == OperationStage::Tracking;
        });
    }

    pub fn set_target(&self, stage: OperationStage, target: &str) {
        self.update(|s| {
            s.stage = stage;
            s.is_tracking = stage == OperationStage::Tracking;
            s.current_target = Some(target.to_string());
        });
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| s.last_error = Some(message));
    }

    pub fn set_connected(&self, connected: bool, stage: OperationStage) {
        self.update(|s| {
            s.connected = connected;
            s.stage = stage;
            s.is_tracking = stage == OperationStage::Tracking;
        });
    }
}

impl Default for StatusModel {
    fn default() -> Self {
        Self::new()
    }
}
