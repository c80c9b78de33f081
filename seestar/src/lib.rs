//! Seestar Smart Telescope Client
//!
//! Drives a Seestar S50 over its JSON-over-TCP control protocol.
//!
//! ## Features
//!
//! - Newline-delimited JSON commands correlated to responses by id
//! - Signed-challenge authentication (firmware 6.45+)
//! - Unsolicited event classification and subscriber fan-out
//! - Keepalive heartbeat and bounded auto-reconnect
//! - Best-effort status snapshot (stage, mount mode, pointing, last error)
//! - Mount-mode aware goto with local equatorial to horizon conversion
//! - File channel downloads for stacked images and raw frames

mod auth;
mod camera;
mod client;
mod coords;
mod correlation;
mod error;
mod events;
mod focuser;
mod images;
mod mount;
mod protocol;
mod reconnect;
mod status;
mod system;
mod transport;

#[cfg(test)]
mod testing;

pub use auth::{load_private_key, resolve_key_path, sign_challenge, DEFAULT_KEY_FILE};
pub use camera::ImagingProgressCallback;
pub use client::SeestarClient;
pub use coords::{
    equatorial_to_horizontal, horizontal_to_equatorial, EquatorialCoordinates,
    HorizontalCoordinates, ObserverLocation,
};
pub use error::{DeviceCondition, SeestarError, SeestarResult};
pub use events::{
    classify, DeviceEvent, EventCallback, EventKind, ProgressCallback, SubscriptionId,
};
pub use images::{ImageInfo, ImageKind};
pub use mount::MoveAction;
pub use protocol::{methods, DeviceMessage};
pub use reconnect::{ReconnectConfig, ReconnectDecision, ReconnectTracker};
pub use status::{MountMode, OperationStage, SeestarStatus, StatusCallback};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Control channel port (firmware 6.x)
pub const DEFAULT_PORT: u16 = 4700;

/// UDP discovery port
pub const DISCOVERY_PORT: u16 = 4720;

/// File transfer port
pub const FILE_TRANSFER_PORT: u16 = 4801;

/// Environment variable overriding the private key location
pub const PRIVATE_KEY_ENV: &str = "SEESTAR_PRIVATE_KEY_PATH";

/// Host and port of one telescope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct SeestarConfig {
    /// UDP discovery port (default: 4720)
    pub discovery_port: u16,
    /// File transfer port (default: 4801)
    pub file_transfer_port: u16,
    /// Send the UDP discovery probe before connecting (default: true)
    pub discovery_enabled: bool,
    /// How long to wait for a discovery reply (default: 1000ms)
    pub discovery_timeout_ms: u64,
    /// TCP connect timeout (default: 10 seconds)
    pub connection_timeout_secs: u64,
    /// Per-command response timeout (default: 30 seconds)
    pub command_timeout_secs: u64,
    /// Keepalive period (default: 2000ms)
    pub heartbeat_interval_ms: u64,
    /// Keepalive response timeout (default: 5 seconds)
    pub heartbeat_timeout_secs: u64,
    /// Default wait for a goto to finish (default: 180 seconds)
    pub goto_wait_secs: u64,
    /// Default wait for autofocus (default: 120 seconds)
    pub focus_wait_secs: u64,
    /// Default wait for an imaging run (default: 3600 seconds)
    pub imaging_wait_secs: u64,
    /// Pause after cancelling an active view before moving (default: 1000ms)
    pub cancel_settle_ms: u64,
    /// Time allowed for the homing sequence (default: 45 seconds)
    pub homing_settle_secs: u64,
    /// App version announced during discovery
    pub app_version: String,
    /// Protocol version announced during discovery
    pub protocol_version: String,
    /// Private key location; falls back to the environment, then the default file
    pub private_key_path: Option<PathBuf>,
    /// Observer location used by alt/az goto
    pub observer_location: Option<ObserverLocation>,
    pub reconnect: ReconnectConfig,
}

impl Default for SeestarConfig {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            file_transfer_port: FILE_TRANSFER_PORT,
            discovery_enabled: true,
            discovery_timeout_ms: 1000,
            connection_timeout_secs: 10,
            command_timeout_secs: 30,
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_secs: 5,
            goto_wait_secs: 180,
            focus_wait_secs: 120,
            imaging_wait_secs: 3600,
            cancel_settle_ms: 1000,
            homing_settle_secs: 45,
            app_version: "3.0.0".to_string(),
            protocol_version: "6.45".to_string(),
            private_key_path: None,
            observer_location: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SeestarConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn goto_wait(&self) -> Duration {
        Duration::from_secs(self.goto_wait_secs)
    }

    pub fn focus_wait(&self) -> Duration {
        Duration::from_secs(self.focus_wait_secs)
    }

    pub fn imaging_wait(&self) -> Duration {
        Duration::from_secs(self.imaging_wait_secs)
    }

    pub fn cancel_settle(&self) -> Duration {
        Duration::from_millis(self.cancel_settle_ms)
    }

    pub fn homing_settle(&self) -> Duration {
        Duration::from_secs(self.homing_settle_secs)
    }
}
