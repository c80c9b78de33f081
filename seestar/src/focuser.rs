//! Focuser control

use crate::client::SeestarClient;
use crate::error::SeestarResult;
use crate::events::{DeviceEvent, EventKind, SubscriptionGuard};
use crate::protocol::methods;
use crate::status::OperationStage;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

impl SeestarClient {
    /// Start autofocus
    pub async fn auto_focus(&self) -> SeestarResult<bool> {
        tracing::info!("Starting auto focus");
        self.status_model().set_stage(OperationStage::Focusing);
        let response = self.command_no_params(methods::START_AUTO_FOCUS).await?;
        Ok(response.is_accepted())
    }

    pub async fn stop_autofocus(&self) -> SeestarResult<bool> {
        tracing::info!("Stopping autofocus");
        self.command_accepted(methods::STOP_AUTO_FOCUS, json!({}))
            .await
    }

    /// Move to an absolute step (typically 0..=2600)
    pub async fn move_focuser_to_position(&self, position: i64) -> SeestarResult<bool> {
        tracing::info!("Moving focuser to position {}", position);
        self.status_model().set_stage(OperationStage::Focusing);
        self.command_accepted(methods::MOVE_FOCUSER, json!({"step": position}))
            .await
    }

    /// Move by a relative offset; positive is outward
    pub async fn move_focuser_relative(&self, offset: i64) -> SeestarResult<bool> {
        tracing::info!("Moving focuser by offset {}", offset);
        self.status_model().set_stage(OperationStage::Focusing);
        self.command_accepted(methods::MOVE_FOCUSER, json!({"offset": offset}))
            .await
    }

    pub async fn reset_focuser_to_factory(&self) -> SeestarResult<bool> {
        tracing::info!("Resetting focuser to factory position");
        self.command_accepted(methods::RESET_FACTORY_FOCAL_POS, json!({}))
            .await
    }

    /// Wait for autofocus to report completion.
    ///
    /// Matches an operation-complete event whose operation mentions focus or
    /// that came from the autofocus command. Returns `(success, position)`;
    /// `(false, None)` on timeout (default 120s).
    pub async fn wait_for_focus_complete(&self, wait: Option<Duration>) -> (bool, Option<f64>) {
        let wait = wait.unwrap_or_else(|| self.config().focus_wait());
        let (tx, mut rx) = mpsc::unbounded_channel::<(bool, Option<f64>)>();
        let _subscription = SubscriptionGuard::new(
            self.events(),
            EventKind::OperationComplete,
            Arc::new(move |event: &DeviceEvent| {
                let operation = event.get_str("operation").unwrap_or_default();
                let from_focus_command =
                    event.source_command.as_deref() == Some(methods::START_AUTO_FOCUS);
                if operation.to_ascii_lowercase().contains("focus") || from_focus_command {
                    let success = event.get("success").and_then(Value::as_bool).unwrap_or(true);
                    let _ = tx.send((success, event.get_f64("position")));
                }
            }),
        );

        match timeout(wait, rx.recv()).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => (false, None),
            Err(_) => {
                tracing::warn!("Autofocus operation timed out after {:?}", wait);
                (false, None)
            }
        }
    }
}
