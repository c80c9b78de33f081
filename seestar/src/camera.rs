//! Imaging: views, stacking, camera settings and device state queries

use crate::client::SeestarClient;
use crate::error::SeestarResult;
use crate::events::{DeviceEvent, EventKind, SubscriptionGuard};
use crate::protocol::methods;
use crate::status::OperationStage;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Imaging progress: `(frame, total_frames, percent)`
pub type ImagingProgressCallback = Arc<dyn Fn(u64, u64, f64) + Send + Sync>;

fn preview_label(mode: &str) -> String {
    match mode {
        "scenery" => "Landscape View".to_string(),
        "moon" => "Moon".to_string(),
        "planet" => "Planet".to_string(),
        "sun" => "Sun".to_string(),
        "star" => "Star Preview".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => format!(
                    "{}{} View",
                    first.to_uppercase(),
                    chars.as_str().to_lowercase()
                ),
                None => "View".to_string(),
            }
        }
    }
}

impl SeestarClient {
    /// Device state, optionally restricted to `keys`.
    ///
    /// Records the firmware version and forces `parked` when the arm is closed.
    pub async fn get_device_state(&self, keys: Option<&[&str]>) -> SeestarResult<Value> {
        let params = match keys {
            Some(keys) if !keys.is_empty() => json!({ "keys": keys }),
            _ => json!({}),
        };
        let result = self.query(methods::GET_DEVICE_STATE, Some(params)).await?;

        if let Some(version) = result
            .pointer("/device/firmware_ver_string")
            .and_then(Value::as_str)
        {
            let version = version.to_string();
            self.status_model()
                .update(|s| s.firmware_version = Some(version));
        }
        if result.pointer("/mount/close").and_then(Value::as_bool) == Some(true) {
            self.status_model().set_stage(OperationStage::Parked);
        }
        Ok(result)
    }

    /// Application state; the device `stage` drives the client stage
    pub async fn get_app_state(&self) -> SeestarResult<Value> {
        let result = self.query(methods::GET_APP_STATE, Some(json!({}))).await?;
        let stage = result.get("stage").and_then(Value::as_str);
        if let Some(stage) = OperationStage::from_device_stage(stage) {
            self.status_model().set_stage(stage);
        }
        Ok(result)
    }

    /// View state (also reports view plan progress)
    pub async fn get_view_state(&self) -> SeestarResult<Value> {
        self.query(methods::GET_VIEW_STATE, Some(json!({}))).await
    }

    /// Start stacking on the current target
    pub async fn start_imaging(&self, restart: bool) -> SeestarResult<bool> {
        tracing::info!("Starting imaging (restart={})", restart);
        self.status_model().set_stage(OperationStage::Imaging);
        self.command_accepted(methods::START_STACK, json!({"restart": restart}))
            .await
    }

    pub async fn stop_imaging(&self) -> SeestarResult<bool> {
        tracing::info!("Stopping imaging");
        self.status_model().set_stage(OperationStage::Tracking);
        self.command_accepted(methods::STOP_VIEW, json!({"stage": "Stack"}))
            .await
    }

    /// Start a coordinate-free view (`scenery`, `moon`, `planet`, `sun`, `star`).
    ///
    /// Once the view is accepted, the RTMP stream and auto-exposure brightness
    /// are requested too; failures of either are only logged.
    pub async fn start_preview(&self, mode: &str, brightness: f64) -> SeestarResult<bool> {
        tracing::info!("Starting preview mode={}, brightness={}", mode, brightness);
        self.status_model()
            .set_target(OperationStage::Tracking, &preview_label(mode));

        let response = self.command(methods::START_VIEW, json!({"mode": mode})).await?;
        if response.result_code() != Some(0) {
            return Ok(false);
        }

        match self
            .command(methods::START_AVI_RTMP, json!({"name": format!("{}_preview", mode)}))
            .await
        {
            Ok(_) => tracing::info!("RTMP stream started"),
            Err(e) => tracing::warn!("Failed to start RTMP stream: {}", e),
        }
        if let Err(e) = self
            .command(
                methods::SET_SETTING,
                json!({"exp_ms": null, "target_brightness": brightness, "is_auto": true}),
            )
            .await
        {
            tracing::warn!("Failed to set AE brightness: {}", e);
        }
        Ok(true)
    }

    pub async fn cancel_current_operation(&self) -> SeestarResult<bool> {
        tracing::info!("Cancelling current operation");
        self.command_accepted(methods::CANCEL_VIEW, json!({})).await
    }

    pub async fn set_exposure(
        &self,
        stack_exposure_ms: u64,
        continuous_exposure_ms: u64,
    ) -> SeestarResult<bool> {
        tracing::info!(
            "Setting exposure: stack={}ms, continuous={}ms",
            stack_exposure_ms,
            continuous_exposure_ms
        );
        self.command_accepted(
            methods::SET_SETTING,
            json!({"exp_ms": {"stack_l": stack_exposure_ms, "continuous": continuous_exposure_ms}}),
        )
        .await
    }

    pub async fn configure_dither(
        &self,
        enabled: bool,
        pixels: u32,
        interval: u32,
    ) -> SeestarResult<bool> {
        self.command_accepted(
            methods::SET_SETTING,
            json!({"stack_dither": {"enable": enabled, "pix": pixels, "interval": interval}}),
        )
        .await
    }

    pub async fn configure_advanced_stacking(
        &self,
        dark_background_extraction: bool,
        star_correction: bool,
        airplane_removal: bool,
        drizzle_2x: bool,
    ) -> SeestarResult<bool> {
        self.command_accepted(
            methods::SET_SETTING,
            json!({
                "stack": {
                    "dbe": dark_background_extraction,
                    "star_correction": star_correction,
                    "airplane_line_removal": airplane_removal,
                    "drizzle2x": drizzle_2x,
                }
            }),
        )
        .await
    }

    pub async fn set_manual_exposure(&self, exposure_ms: f64, gain: f64) -> SeestarResult<bool> {
        tracing::info!("Setting manual exposure: {}ms, gain={}", exposure_ms, gain);
        self.command_accepted(
            methods::SET_SETTING,
            json!({"manual_exp": true, "isp_exp_ms": exposure_ms, "isp_gain": gain}),
        )
        .await
    }

    pub async fn set_auto_exposure(&self, brightness_target: f64) -> SeestarResult<bool> {
        self.command_accepted(
            methods::SET_SETTING,
            json!({"manual_exp": false, "ae_bri_percent": brightness_target}),
        )
        .await
    }

    pub async fn configure_planetary_imaging(
        &self,
        frame_count: u32,
        save_frames: bool,
        denoise: bool,
    ) -> SeestarResult<bool> {
        self.command_accepted(
            methods::SET_SETTING,
            json!({
                "stack": {
                    "capt_type": "planet",
                    "capt_num": frame_count,
                    "save_discrete_frame": save_frames,
                    "wide_denoise": denoise,
                }
            }),
        )
        .await
    }

    pub async fn start_planet_scan(
        &self,
        planet: &str,
        exposure_ms: u32,
        gain: f64,
    ) -> SeestarResult<bool> {
        tracing::info!("Starting planet scan: {}, exp={}ms, gain={}", planet, exposure_ms, gain);
        self.command_accepted(
            methods::START_SCAN_PLANET,
            json!({"planet": planet, "exposure_ms": exposure_ms, "gain": gain}),
        )
        .await
    }

    pub async fn check_stacking_complete(&self) -> SeestarResult<bool> {
        let result = self.query(methods::IS_STACKED, Some(json!({}))).await?;
        Ok(result
            .get("is_stacked")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn get_plate_solve_result(&self) -> SeestarResult<Value> {
        self.query(methods::GET_SOLVE_RESULT, Some(json!({}))).await
    }

    pub async fn get_field_annotations(&self) -> SeestarResult<Value> {
        self.query(methods::GET_ANNOTATE_RESULT, Some(json!({}))).await
    }

    /// Run a multi-target plan; `plan` is sent as the params object unchanged
    pub async fn start_view_plan(&self, plan: Value) -> SeestarResult<bool> {
        tracing::info!("Starting view plan: {}", plan);
        self.command_accepted(methods::START_VIEW_PLAN, plan).await
    }

    pub async fn stop_view_plan(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::STOP_VIEW_PLAN, json!({})).await
    }

    /// Wait until the stack reaches `expected_frames`.
    ///
    /// `on_progress` sees every progress event as `(frame, total, percent)`;
    /// a panic inside it is logged and ignored. Returns false on timeout
    /// (default 3600s).
    pub async fn wait_for_imaging_complete(
        &self,
        expected_frames: u64,
        on_progress: Option<ImagingProgressCallback>,
        wait: Option<Duration>,
    ) -> bool {
        let wait = wait.unwrap_or_else(|| self.config().imaging_wait());
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let reached = Arc::new(AtomicU64::new(0));
        let latest = Arc::clone(&reached);

        let _subscription = SubscriptionGuard::new(
            self.events(),
            EventKind::ProgressUpdate,
            Arc::new(move |event: &DeviceEvent| {
                let frame = event.get_u64("frame").unwrap_or(0);
                let total = event
                    .get_u64("total_frames")
                    .filter(|total| *total > 0)
                    .unwrap_or(expected_frames);
                let percent = event.get_f64("percent").unwrap_or(0.0);
                latest.store(frame, Ordering::SeqCst);

                if let Some(callback) = on_progress.as_ref() {
                    if catch_unwind(AssertUnwindSafe(|| callback(frame, total, percent))).is_err() {
                        tracing::error!("Imaging progress callback panicked");
                    }
                }
                if frame >= expected_frames {
                    let _ = tx.send(());
                }
            }),
        );

        match timeout(wait, rx.recv()).await {
            Ok(Some(())) => true,
            Ok(None) => false,
            Err(_) => {
                tracing::warn!(
                    "Imaging session timed out after {:?} (reached {}/{} frames)",
                    wait,
                    reached.load(Ordering::SeqCst),
                    expected_frames
                );
                false
            }
        }
    }
}
