//! Mount control: goto, manual moves, parking, alignment
//!
//! `goto_target` is mount-mode aware. In alt/az mode it converts the J2000
//! target to horizon coordinates for the observer and issues a horizon move;
//! in equatorial mode it hands RA/Dec straight to `iscope_start_view`, which
//! needs a completed homing sequence first.

use crate::client::SeestarClient;
use crate::coords::{equatorial_to_horizontal, EquatorialCoordinates, ObserverLocation};
use crate::error::{DeviceCondition, SeestarError, SeestarResult};
use crate::events::{DeviceEvent, EventKind, SubscriptionGuard};
use crate::protocol::methods;
use crate::status::{MountMode, OperationStage};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Targets below this altitude get a visibility warning
const LOW_ALTITUDE_WARNING_DEG: f64 = 10.0;

/// Duration of one directional nudge
const NUDGE_DURATION_SECS: u64 = 3;

/// Manual mount action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveAction {
    Slew,
    Stop,
    Abort,
    Up,
    Down,
    Left,
    Right,
}

impl MoveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveAction::Slew => "slew",
            MoveAction::Stop => "stop",
            MoveAction::Abort => "abort",
            MoveAction::Up => "up",
            MoveAction::Down => "down",
            MoveAction::Left => "left",
            MoveAction::Right => "right",
        }
    }

    /// `scope_speed_move` angle: 0 = azimuth up, 90 = altitude up
    fn angle(&self) -> Option<u32> {
        match self {
            MoveAction::Up => Some(90),
            MoveAction::Down => Some(270),
            MoveAction::Right => Some(0),
            MoveAction::Left => Some(180),
            _ => None,
        }
    }
}

impl FromStr for MoveAction {
    type Err = SeestarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slew" => Ok(MoveAction::Slew),
            "stop" => Ok(MoveAction::Stop),
            "abort" => Ok(MoveAction::Abort),
            "up" => Ok(MoveAction::Up),
            "down" => Ok(MoveAction::Down),
            "left" => Ok(MoveAction::Left),
            "right" => Ok(MoveAction::Right),
            other => Err(SeestarError::InvalidInput(format!(
                "Invalid action '{}'. Must be one of: slew, stop, abort, up, down, left, right",
                other
            ))),
        }
    }
}

fn validate_target(ra_hours: f64, dec_degrees: f64) -> SeestarResult<()> {
    if !ra_hours.is_finite() || !(0.0..24.0).contains(&ra_hours) {
        return Err(SeestarError::InvalidInput(format!(
            "RA must be in [0, 24) hours, got {}",
            ra_hours
        )));
    }
    if !dec_degrees.is_finite() || !(-90.0..=90.0).contains(&dec_degrees) {
        return Err(SeestarError::InvalidInput(format!(
            "Dec must be in [-90, 90] degrees, got {}",
            dec_degrees
        )));
    }
    Ok(())
}

/// Replace a raw device code with its named goto condition
fn goto_error(error: SeestarError) -> SeestarError {
    match error.condition() {
        Some(DeviceCondition::AlreadyMoving) => SeestarError::AlreadyMoving,
        Some(DeviceCondition::MountNotReady) => SeestarError::MountNotReady,
        Some(DeviceCondition::ImagingActive) => SeestarError::ImagingActive,
        _ => error,
    }
}

impl SeestarClient {
    /// Low-level goto without starting a view
    pub async fn scope_goto(&self, ra_hours: f64, dec_degrees: f64) -> SeestarResult<bool> {
        validate_target(ra_hours, dec_degrees)?;
        tracing::info!("Scope goto: RA={}h, Dec={}°", ra_hours, dec_degrees);
        self.status_model().set_stage(OperationStage::Slewing);
        self.command_accepted(methods::SCOPE_GOTO, json!([ra_hours, dec_degrees]))
            .await
    }

    /// Slew to a target and start viewing it, using the configured observer
    /// location and the current time for alt/az conversion.
    pub async fn goto_target(
        &self,
        ra_hours: f64,
        dec_degrees: f64,
        target_name: &str,
        use_lp_filter: bool,
    ) -> SeestarResult<bool> {
        self.goto_target_at(ra_hours, dec_degrees, target_name, use_lp_filter, None, Utc::now())
            .await
    }

    /// `goto_target` with an explicit observer location and instant.
    ///
    /// Steps:
    /// 1. Cancel an active view or stack (best effort)
    /// 2. Reconcile the believed mount mode with what the device reports
    /// 3. Alt/az: convert and issue `scope_move_to_horizon`;
    ///    equatorial: issue `iscope_start_view` with RA/Dec
    ///
    /// A `location` of `None` falls back to the client's observer location;
    /// if neither is set, alt/az goto fails with `ObserverLocationUnavailable`.
    pub async fn goto_target_at(
        &self,
        ra_hours: f64,
        dec_degrees: f64,
        target_name: &str,
        use_lp_filter: bool,
        location: Option<&ObserverLocation>,
        when: DateTime<Utc>,
    ) -> SeestarResult<bool> {
        validate_target(ra_hours, dec_degrees)?;
        tracing::info!(
            "Goto target: {} at RA={}h, Dec={}°",
            target_name,
            ra_hours,
            dec_degrees
        );

        self.cancel_active_view().await;

        let device_state = self.get_device_state(None).await?;
        let device_equatorial =
            device_state.pointer("/mount/equ_mode").and_then(Value::as_bool) == Some(true);

        let status = self.status();
        match status.mount_mode {
            MountMode::AltAz | MountMode::Unknown if device_equatorial => {
                tracing::warn!(
                    "Device in equatorial mode but client wants alt/az - clearing polar alignment"
                );
                match self.clear_polar_alignment().await {
                    Ok(true) => tracing::info!("Switched mount to alt/az mode"),
                    Ok(false) => {
                        return Err(SeestarError::ModeSwitchFailed(
                            "clear_polar_align was not accepted".to_string(),
                        ))
                    }
                    Err(e) => return Err(SeestarError::ModeSwitchFailed(e.to_string())),
                }
            }
            MountMode::Equatorial if !status.equatorial_initialized => {
                tracing::warn!("Equatorial mode requested but not initialized");
                return Err(SeestarError::EquatorialNotInitialized);
            }
            _ => {}
        }

        if status.mount_mode == MountMode::Equatorial {
            return self
                .start_equatorial_view(ra_hours, dec_degrees, target_name, use_lp_filter)
                .await;
        }

        let location = location
            .cloned()
            .or_else(|| self.observer_location())
            .ok_or(SeestarError::ObserverLocationUnavailable)?;
        let horizon = equatorial_to_horizontal(ra_hours, dec_degrees, &location, when).map_err(
            |e| match e {
                SeestarError::CoordinateConversion(_) => e,
                other => SeestarError::CoordinateConversion(other.to_string()),
            },
        )?;
        tracing::debug!(
            "Converted to Az={:.2}°, Alt={:.2}°",
            horizon.azimuth,
            horizon.altitude
        );
        if horizon.altitude < LOW_ALTITUDE_WARNING_DEG {
            tracing::warn!(
                "Target {} is low (alt={:.1}°) - may not be visible",
                target_name,
                horizon.altitude
            );
        }

        self.status_model()
            .set_target(OperationStage::Slewing, target_name);
        self.move_to_horizon(horizon.azimuth, horizon.altitude).await
    }

    async fn cancel_active_view(&self) {
        let view_state = match self.query(methods::GET_VIEW_STATE, Some(json!({}))).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Could not check view state: {}", e);
                return;
            }
        };
        let view = &view_state["View"];
        let state = view["state"].as_str();
        let stage = view["stage"].as_str();
        if state != Some("working") && !matches!(stage, Some("ContinuousExposure") | Some("Stacking")) {
            return;
        }

        tracing::warn!("Cancelling active {} before goto", stage.unwrap_or("view"));
        match self.command(methods::CANCEL_VIEW, json!({})).await {
            Ok(_) => sleep(self.config().cancel_settle()).await,
            Err(e) => tracing::warn!("Cancel view failed: {}", e),
        }
    }

    async fn start_equatorial_view(
        &self,
        ra_hours: f64,
        dec_degrees: f64,
        target_name: &str,
        use_lp_filter: bool,
    ) -> SeestarResult<bool> {
        let params = json!({
            "mode": "star",
            "target_ra_dec": [ra_hours, dec_degrees],
            "target_name": target_name,
            "lp_filter": use_lp_filter,
        });
        self.status_model()
            .set_target(OperationStage::Slewing, target_name);

        // A non-zero top-level code fails inside `command`; a non-zero
        // nested result code is mapped below
        let response = self
            .command(methods::START_VIEW, params)
            .await
            .map_err(goto_error)?;
        if response.is_accepted() {
            return Ok(true);
        }
        let code = response.result_code().unwrap_or(-1);
        tracing::error!("Goto failed with result={}, code={}", response.result(), response.code());
        Err(goto_error(SeestarError::Command {
            method: methods::START_VIEW.to_string(),
            code,
            message: format!("Goto failed with result={}", response.result()),
        }))
    }

    /// Run the homing sequence that equatorial goto depends on
    pub async fn initialize_equatorial_mode(&self) -> SeestarResult<bool> {
        tracing::info!("Initializing equatorial mode...");
        self.command(methods::MOUNT_GO_HOME, json!({})).await?;

        tracing::info!("Go home accepted, waiting for homing to finish");
        sleep(self.config().homing_settle()).await;

        self.status_model().update(|s| {
            s.mount_mode = MountMode::Equatorial;
            s.equatorial_initialized = true;
        });
        tracing::info!("Equatorial mode initialized");
        Ok(true)
    }

    pub async fn set_mount_mode(&self, mode: MountMode) -> SeestarResult<()> {
        tracing::info!("Setting mount mode to {:?}", mode);
        if mode == MountMode::Equatorial && !self.status().equatorial_initialized {
            tracing::warn!("Equatorial mode requested but not initialized");
            return Err(SeestarError::EquatorialNotInitialized);
        }
        self.status_model().update(|s| s.mount_mode = mode);
        Ok(())
    }

    /// Whether the device reports equatorial tracking; false if it cannot be read
    pub async fn is_equatorial_mode(&self) -> bool {
        match self.get_device_state(None).await {
            Ok(state) => {
                let mount = &state["mount"];
                let equatorial = match mount.get("is_equ").or_else(|| mount.get("equ_mode")) {
                    Some(flag) => flag.as_bool().unwrap_or(false),
                    None => mount["tracking_mode"] == "equatorial",
                };
                tracing::debug!("Mount mode check: is_equatorial={}", equatorial);
                equatorial
            }
            Err(e) => {
                tracing::warn!("Could not determine mount mode, assuming alt/az: {}", e);
                false
            }
        }
    }

    /// Manual movement by action name (`slew`, `stop`, `abort`, `up`, `down`,
    /// `left`, `right`). Slew needs RA and Dec; directions take a speed
    /// multiplier (default 1.0).
    pub async fn move_scope(
        &self,
        action: &str,
        ra: Option<f64>,
        dec: Option<f64>,
        speed: Option<f64>,
    ) -> SeestarResult<bool> {
        let action = MoveAction::from_str(action)?;
        match action {
            MoveAction::Stop | MoveAction::Abort => {
                tracing::info!("Scope move: {}", action.as_str());
                self.command_accepted(methods::SCOPE_MOVE, json!({"action": action.as_str()}))
                    .await
            }
            MoveAction::Slew => {
                let (Some(ra), Some(dec)) = (ra, dec) else {
                    return Err(SeestarError::InvalidInput(
                        "RA and Dec required for slew action".to_string(),
                    ));
                };
                self.command_accepted(
                    methods::SCOPE_MOVE,
                    json!({"action": "slew", "ra": ra, "dec": dec}),
                )
                .await
            }
            MoveAction::Up | MoveAction::Down | MoveAction::Left | MoveAction::Right => {
                let speed = speed.unwrap_or(1.0);
                let percent = (speed * 10.0).clamp(1.0, 100.0) as i64;
                let level = speed as i64;
                let angle = action.angle().unwrap_or_default();
                tracing::info!(
                    "Directional move {}: angle={}°, percent={}%, level={}",
                    action.as_str(),
                    angle,
                    percent,
                    level
                );
                self.command_accepted(
                    methods::SCOPE_SPEED_MOVE,
                    json!({
                        "angle": angle,
                        "percent": percent,
                        "level": level,
                        "dur_sec": NUDGE_DURATION_SECS,
                    }),
                )
                .await
            }
        }
    }

    pub async fn slew_to_coordinates(&self, ra_hours: f64, dec_degrees: f64) -> SeestarResult<bool> {
        self.move_scope("slew", Some(ra_hours), Some(dec_degrees), None)
            .await
    }

    pub async fn stop_telescope_movement(&self) -> SeestarResult<bool> {
        self.move_scope("stop", None, None, None).await
    }

    /// Stop a running goto
    pub async fn stop_slew(&self) -> SeestarResult<bool> {
        tracing::info!("Stopping slew");
        self.command_accepted(methods::STOP_VIEW, json!({"stage": "AutoGoto"}))
            .await
    }

    pub async fn park(&self, equ_mode: bool) -> SeestarResult<bool> {
        tracing::info!(
            "Parking telescope in {} mode",
            if equ_mode { "equatorial" } else { "alt/az" }
        );
        self.status_model().set_stage(OperationStage::Parking);
        self.command_accepted(methods::SCOPE_PARK, json!({"equ_mode": equ_mode}))
            .await
    }

    pub async fn move_to_horizon(&self, azimuth: f64, altitude: f64) -> SeestarResult<bool> {
        tracing::info!("Moving to horizon: az={}°, alt={}°", azimuth, altitude);
        self.status_model().set_stage(OperationStage::Slewing);
        self.command_accepted(
            methods::SCOPE_MOVE_TO_HORIZON,
            json!({"azimuth": azimuth, "altitude": altitude}),
        )
        .await
    }

    /// Current pointing; also stored in the status snapshot
    pub async fn get_current_coordinates(&self) -> SeestarResult<EquatorialCoordinates> {
        let result = self.query(methods::GET_EQU_COORD, Some(json!({}))).await?;
        let ra = result.get("ra").and_then(Value::as_f64);
        let dec = result.get("dec").and_then(Value::as_f64);
        if let (Some(ra), Some(dec)) = (ra, dec) {
            self.status_model().update(|s| {
                s.current_ra_hours = Some(ra);
                s.current_dec_degrees = Some(dec);
            });
        }
        Ok(EquatorialCoordinates {
            ra_hours: ra.unwrap_or(0.0),
            dec_degrees: dec.unwrap_or(0.0),
        })
    }

    /// Tell the device where it is (west longitudes negative)
    pub async fn set_location(&self, longitude: f64, latitude: f64) -> SeestarResult<bool> {
        if !(-180.0..=180.0).contains(&longitude) || !(-90.0..=90.0).contains(&latitude) {
            return Err(SeestarError::InvalidInput(format!(
                "Location out of range: lon={}, lat={}",
                longitude, latitude
            )));
        }
        tracing::info!("Setting location: lon={}, lat={}", longitude, latitude);
        self.command_accepted(
            methods::SET_USER_LOCATION,
            json!({"lon_lat": [longitude, latitude]}),
        )
        .await
    }

    pub async fn check_polar_alignment(&self) -> SeestarResult<Value> {
        self.query(methods::CHECK_PA_ALT, Some(json!({}))).await
    }

    pub async fn clear_polar_alignment(&self) -> SeestarResult<bool> {
        tracing::info!("Clearing polar alignment");
        self.command_accepted(methods::CLEAR_POLAR_ALIGN, json!({}))
            .await
    }

    pub async fn start_compass_calibration(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::START_COMPASS_CALIBRATION, json!({}))
            .await
    }

    pub async fn stop_compass_calibration(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::STOP_COMPASS_CALIBRATION, json!({}))
            .await
    }

    pub async fn get_compass_state(&self) -> SeestarResult<Value> {
        self.query(methods::GET_COMPASS_STATE, Some(json!({}))).await
    }

    /// Wait for a goto to settle.
    ///
    /// True on a `tracking` state event; false on `connected` or `parked`
    /// (goto aborted) or when `wait` (default 180s) runs out.
    pub async fn wait_for_goto_complete(&self, wait: Option<Duration>) -> bool {
        let wait = wait.unwrap_or_else(|| self.config().goto_wait());
        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
        let _subscription = SubscriptionGuard::new(
            self.events(),
            EventKind::StateChange,
            Arc::new(move |event: &DeviceEvent| match event.get_str("state") {
                Some("tracking") => {
                    let _ = tx.send(true);
                }
                Some("connected") | Some("parked") => {
                    let _ = tx.send(false);
                }
                _ => {}
            }),
        );

        match timeout(wait, rx.recv()).await {
            Ok(Some(success)) => success,
            Ok(None) => false,
            Err(_) => {
                tracing::warn!("Goto operation timed out after {:?}", wait);
                false
            }
        }
    }
}
