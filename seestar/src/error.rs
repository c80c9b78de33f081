//! Seestar error types
//!
//! Provides structured error types for Seestar operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Device result codes with a known meaning
pub const CODE_ALREADY_MOVING: i64 = 203;
pub const CODE_MOUNT_NOT_READY: i64 = 207;
pub const CODE_IMAGING_ACTIVE: i64 = 259;

/// Named condition behind a non-zero device code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCondition {
    /// The mount is already slewing
    AlreadyMoving,
    /// The mount needs homing/initialization first
    MountNotReady,
    /// A stack is already running
    ImagingActive,
    /// Any other non-zero code
    Unknown(i64),
}

impl DeviceCondition {
    pub fn from_code(code: i64) -> Self {
        match code {
            CODE_ALREADY_MOVING => DeviceCondition::AlreadyMoving,
            CODE_MOUNT_NOT_READY => DeviceCondition::MountNotReady,
            CODE_IMAGING_ACTIVE => DeviceCondition::ImagingActive,
            other => DeviceCondition::Unknown(other),
        }
    }
}

/// Seestar client errors
#[derive(Debug, Clone, Error)]
pub enum SeestarError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Connection timeout: failed to connect to {host}:{port} after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Not connected to telescope")]
    NotConnected,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error(
        "Seestar authentication key not found at {}. Ensure the key file exists or set the {env_var} environment variable.",
        .path.display()
    )]
    KeyNotFound { path: PathBuf, env_var: String },

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Command '{method}' timed out after {duration:?}")]
    CommandTimeout { method: String, duration: Duration },

    #[error("Command '{method}' failed: {message} (code {code})")]
    Command {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Telescope is already moving - stop current operation first")]
    AlreadyMoving,

    #[error("Mount not ready - needs initialization (run mount_go_home or use alt/az mode)")]
    MountNotReady,

    #[error("Imaging is active - stop imaging before slewing")]
    ImagingActive,

    #[error("Equatorial mode requires initialization. Call initialize_equatorial_mode() first or use alt/az mode.")]
    EquatorialNotInitialized,

    #[error("Failed to switch mount to alt/az mode: {0}")]
    ModeSwitchFailed(String),

    #[error("Failed to convert coordinates: {0}")]
    CoordinateConversion(String),

    #[error("Observer location is not configured; alt/az goto needs latitude and longitude")]
    ObserverLocationUnavailable,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("File transfer of {path} failed: {reason}")]
    FileTransfer { path: String, reason: String },

    #[error("File not found or empty: {0}")]
    FileNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectionFailed { attempts: u32, last_error: String },
}

impl SeestarError {
    /// Create a connection failure with address context
    pub fn connection_failed(host: impl Into<String>, port: u16, reason: impl ToString) -> Self {
        SeestarError::ConnectionFailed {
            host: host.into(),
            port,
            reason: reason.to_string(),
        }
    }

    /// Create a command timeout error
    pub fn command_timeout(method: impl Into<String>, duration: Duration) -> Self {
        SeestarError::CommandTimeout {
            method: method.into(),
            duration,
        }
    }

    /// Device condition for command errors
    pub fn condition(&self) -> Option<DeviceCondition> {
        match self {
            SeestarError::Command { code, .. } => Some(DeviceCondition::from_code(*code)),
            SeestarError::AlreadyMoving => Some(DeviceCondition::AlreadyMoving),
            SeestarError::MountNotReady => Some(DeviceCondition::MountNotReady),
            SeestarError::ImagingActive => Some(DeviceCondition::ImagingActive),
            _ => None,
        }
    }

    /// Whether the error is local to one call and the connection is still usable
    pub fn is_command_local(&self) -> bool {
        matches!(
            self,
            SeestarError::CommandTimeout { .. }
                | SeestarError::Command { .. }
                | SeestarError::AlreadyMoving
                | SeestarError::MountNotReady
                | SeestarError::ImagingActive
                | SeestarError::InvalidInput(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SeestarError::ConnectionFailed { .. } => true,
            SeestarError::ConnectionTimeout { .. } => true,
            SeestarError::ConnectionClosed(_) => true,
            SeestarError::CommandTimeout { .. } => true,
            SeestarError::Io(_) => true,
            SeestarError::FileTransfer { .. } => true,
            // Device rejected the request or input was bad; retrying will not help
            _ => false,
        }
    }
}

impl From<std::io::Error> for SeestarError {
    fn from(err: std::io::Error) -> Self {
        SeestarError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SeestarError {
    fn from(err: serde_json::Error) -> Self {
        SeestarError::Json(err.to_string())
    }
}

impl From<SeestarError> for String {
    fn from(err: SeestarError) -> String {
        err.to_string()
    }
}

/// Result type for Seestar operations
pub type SeestarResult<T> = Result<T, SeestarError>;
