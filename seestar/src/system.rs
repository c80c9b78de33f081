//! System, network and session management

use crate::client::SeestarClient;
use crate::error::{SeestarError, SeestarResult};
use crate::protocol::methods;
use serde_json::{json, Value};

/// Volume preset used by `play_notification_sound` when none is given
pub const DEFAULT_SOUND_VOLUME: &str = "backyard";

pub const DEFAULT_HEATER_POWER: u8 = 90;

/// Security mode sent when saving a station network
const STATION_SECURITY: &str = "WPA2-PSK";

fn optional_param(key: &str, value: Option<&str>) -> Value {
    let mut params = serde_json::Map::new();
    if let Some(v) = value {
        params.insert(key.to_string(), json!(v));
    }
    Value::Object(params)
}

/// `pi_is_verified` answers either a bare bool or `{is_verified}`
fn parse_verified(result: &Value) -> bool {
    match result {
        Value::Bool(verified) => *verified,
        Value::Object(map) => map
            .get("is_verified")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        _ => false,
    }
}

impl SeestarClient {
    pub async fn shutdown_telescope(&self) -> SeestarResult<bool> {
        tracing::warn!("Shutting down telescope");
        self.command_accepted(methods::PI_SHUTDOWN, json!({})).await
    }

    pub async fn reboot_telescope(&self) -> SeestarResult<bool> {
        tracing::warn!("Rebooting telescope");
        self.command_accepted(methods::PI_REBOOT, json!({})).await
    }

    pub async fn play_notification_sound(&self, volume: Option<&str>) -> SeestarResult<bool> {
        let volume = volume.unwrap_or(DEFAULT_SOUND_VOLUME);
        self.command_accepted(methods::PLAY_SOUND, json!({ "volume": volume }))
            .await
    }

    // Wi-Fi

    /// Configure the telescope's own access point
    pub async fn configure_access_point(
        &self,
        ssid: &str,
        password: &str,
        is_5g: bool,
    ) -> SeestarResult<bool> {
        if ssid.is_empty() {
            return Err(SeestarError::InvalidInput(
                "Access point SSID must not be empty".to_string(),
            ));
        }
        tracing::info!("Configuring access point '{}' (5GHz: {})", ssid, is_5g);
        self.command_accepted(
            methods::PI_SET_AP,
            json!({ "ssid": ssid, "passwd": password, "is_5g": is_5g }),
        )
        .await
    }

    pub async fn set_wifi_country(&self, country: &str) -> SeestarResult<bool> {
        self.command_accepted(methods::SET_WIFI_COUNTRY, json!({ "country": country }))
            .await
    }

    /// Enable station (client) mode
    pub async fn enable_station_mode(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::PI_STATION_OPEN, json!({})).await
    }

    pub async fn disable_station_mode(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::PI_STATION_CLOSE, json!({})).await
    }

    /// Visible networks as reported by the device
    pub async fn scan_wifi_networks(&self) -> SeestarResult<Value> {
        self.query(methods::PI_STATION_SCAN, Some(json!({}))).await
    }

    pub async fn select_wifi_network(&self, ssid: &str) -> SeestarResult<bool> {
        self.command_accepted(methods::PI_STATION_SELECT, json!({ "ssid": ssid }))
            .await
    }

    pub async fn save_wifi_network(&self, ssid: &str, password: &str) -> SeestarResult<bool> {
        if ssid.is_empty() {
            return Err(SeestarError::InvalidInput(
                "Network SSID must not be empty".to_string(),
            ));
        }
        tracing::info!("Saving Wi-Fi network '{}'", ssid);
        self.command_accepted(
            methods::PI_STATION_SET,
            json!({ "ssid": ssid, "passwd": password, "security": STATION_SECURITY }),
        )
        .await
    }

    pub async fn list_saved_networks(&self) -> SeestarResult<Value> {
        self.query(methods::PI_STATION_LIST, Some(json!({}))).await
    }

    pub async fn remove_wifi_network(&self, ssid: &str) -> SeestarResult<bool> {
        self.command_accepted(methods::PI_STATION_REMOVE, json!({ "ssid": ssid }))
            .await
    }

    pub async fn get_station_state(&self) -> SeestarResult<Value> {
        self.query(methods::PI_STATION_STATE, Some(json!({}))).await
    }

    // Pi

    pub async fn get_pi_info(&self) -> SeestarResult<Value> {
        self.query(methods::PI_GET_INFO, Some(json!({}))).await
    }

    pub async fn get_pi_time(&self) -> SeestarResult<Value> {
        self.query(methods::PI_GET_TIME, Some(json!({}))).await
    }

    /// Set the device clock; `time` is passed through as the device expects it
    pub async fn set_pi_time(&self, time: Value) -> SeestarResult<bool> {
        self.command_accepted(methods::PI_SET_TIME, json!({ "time": time }))
            .await
    }

    // Power outputs

    /// Switch the dew heater. `power` is a percentage (default 90).
    pub async fn set_dew_heater(&self, enabled: bool, power: Option<u8>) -> SeestarResult<bool> {
        let power = power.unwrap_or(DEFAULT_HEATER_POWER);
        if power > 100 {
            return Err(SeestarError::InvalidInput(format!(
                "Dew heater power must be 0-100, got {}",
                power
            )));
        }
        tracing::info!("Dew heater {} at {}%", if enabled { "on" } else { "off" }, power);
        self.command_accepted(
            methods::PI_OUTPUT_SET2,
            json!({ "heater": { "state": enabled, "value": power } }),
        )
        .await
    }

    /// Write a raw DC output configuration
    pub async fn set_dc_output(&self, config: Value) -> SeestarResult<bool> {
        self.command_accepted(methods::PI_OUTPUT_SET2, config).await
    }

    pub async fn get_dc_output(&self) -> SeestarResult<Value> {
        self.query(methods::PI_OUTPUT_GET2, Some(json!({}))).await
    }

    // Demo mode

    pub async fn start_demo_mode(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::START_DEMONSTRATE, json!({})).await
    }

    pub async fn stop_demo_mode(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::STOP_DEMONSTRATE, json!({})).await
    }

    // Remote sessions

    /// Join a shared session; without an id the device picks one
    pub async fn join_remote_session(&self, session_id: Option<&str>) -> SeestarResult<bool> {
        self.command_accepted(
            methods::REMOTE_JOIN,
            optional_param("session_id", session_id),
        )
        .await
    }

    pub async fn leave_remote_session(&self) -> SeestarResult<bool> {
        self.command_accepted(methods::REMOTE_DISJOIN, json!({})).await
    }

    /// Kick a client from the session (or the current one without an id)
    pub async fn disconnect_remote_client(&self, client_id: Option<&str>) -> SeestarResult<bool> {
        self.command_accepted(
            methods::REMOTE_DISCONNECT,
            optional_param("client_id", client_id),
        )
        .await
    }

    /// Whether the device considers this client verified; false on any failure
    pub async fn check_client_verified(&self) -> bool {
        match self.command_no_params(methods::PI_IS_VERIFIED).await {
            Ok(response) => parse_verified(response.result()),
            Err(e) => {
                tracing::warn!("Verification check failed: {}", e);
                false
            }
        }
    }
}
