//! Seestar JSON line protocol
//!
//! Commands go out as one JSON object per line terminated by CRLF. Responses
//! and unsolicited pushes come back interleaved on the same stream, one JSON
//! object per line.

use crate::error::{SeestarError, SeestarResult};
use serde::Serialize;
use serde_json::{Map, Value};

/// JSON-RPC version tag sent with every command
pub const JSONRPC_VERSION: &str = "2.0";

/// First identifier handed out on a fresh connection
pub const FIRST_COMMAND_ID: u64 = 10000;

/// Device method names
pub mod methods {
    // Session
    pub const TEST_CONNECTION: &str = "test_connection";
    pub const GET_VERIFY_STR: &str = "get_verify_str";
    pub const VERIFY_CLIENT: &str = "verify_client";
    pub const SCAN_ISCOPE: &str = "scan_iscope";

    // State queries
    pub const GET_DEVICE_STATE: &str = "get_device_state";
    pub const GET_APP_STATE: &str = "iscope_get_app_state";
    pub const GET_VIEW_STATE: &str = "get_view_state";
    pub const GET_EQU_COORD: &str = "scope_get_equ_coord";

    // Mount
    pub const SCOPE_GOTO: &str = "scope_goto";
    pub const SCOPE_MOVE: &str = "scope_move";
    pub const SCOPE_SPEED_MOVE: &str = "scope_speed_move";
    pub const SCOPE_MOVE_TO_HORIZON: &str = "scope_move_to_horizon";
    pub const SCOPE_PARK: &str = "scope_park";
    pub const MOUNT_GO_HOME: &str = "mount_go_home";
    pub const SET_USER_LOCATION: &str = "set_user_location";
    pub const CHECK_PA_ALT: &str = "check_pa_alt";
    pub const CLEAR_POLAR_ALIGN: &str = "clear_polar_align";
    pub const START_COMPASS_CALIBRATION: &str = "start_compass_calibration";
    pub const STOP_COMPASS_CALIBRATION: &str = "stop_compass_calibration";
    pub const GET_COMPASS_STATE: &str = "get_compass_state";

    // View / imaging
    pub const START_VIEW: &str = "iscope_start_view";
    pub const STOP_VIEW: &str = "iscope_stop_view";
    pub const CANCEL_VIEW: &str = "iscope_cancel_view";
    pub const START_STACK: &str = "iscope_start_stack";
    pub const START_AVI_RTMP: &str = "start_avi_rtmp";
    pub const SET_SETTING: &str = "set_setting";
    pub const IS_STACKED: &str = "is_stacked";
    pub const GET_SOLVE_RESULT: &str = "get_solve_result";
    pub const GET_ANNOTATE_RESULT: &str = "get_annotate_result";
    pub const START_VIEW_PLAN: &str = "start_view_plan";
    pub const STOP_VIEW_PLAN: &str = "stop_view_plan";
    pub const START_SCAN_PLANET: &str = "start_scan_planet";

    // Focuser
    pub const START_AUTO_FOCUS: &str = "start_auto_focuse";
    pub const STOP_AUTO_FOCUS: &str = "stop_auto_focuse";
    pub const MOVE_FOCUSER: &str = "move_focuser";
    pub const RESET_FACTORY_FOCAL_POS: &str = "reset_factory_focal_pos";

    // Files
    pub const GET_IMG_FILE_INFO: &str = "get_img_file_info";
    pub const PI_EXECUTE_CMD: &str = "pi_execute_cmd";

    // System
    pub const PI_SHUTDOWN: &str = "pi_shutdown";
    pub const PI_REBOOT: &str = "pi_reboot";
    pub const PLAY_SOUND: &str = "play_sound";
    pub const PI_GET_INFO: &str = "pi_get_info";
    pub const PI_GET_TIME: &str = "pi_get_time";
    pub const PI_SET_TIME: &str = "pi_set_time";
    pub const PI_IS_VERIFIED: &str = "pi_is_verified";
    pub const PI_OUTPUT_SET2: &str = "pi_output_set2";
    pub const PI_OUTPUT_GET2: &str = "pi_output_get2";
    pub const START_DEMONSTRATE: &str = "start_demonstrate";
    pub const STOP_DEMONSTRATE: &str = "stop_demonstrate";

    // Remote sessions
    pub const REMOTE_JOIN: &str = "remote_join";
    pub const REMOTE_DISJOIN: &str = "remote_disjoin";
    pub const REMOTE_DISCONNECT: &str = "remote_disconnect";

    // Wi-Fi
    pub const PI_SET_AP: &str = "pi_set_ap";
    pub const SET_WIFI_COUNTRY: &str = "set_wifi_country";
    pub const PI_STATION_OPEN: &str = "pi_station_open";
    pub const PI_STATION_CLOSE: &str = "pi_station_close";
    pub const PI_STATION_SCAN: &str = "pi_station_scan";
    pub const PI_STATION_SELECT: &str = "pi_station_select";
    pub const PI_STATION_SET: &str = "pi_station_set";
    pub const PI_STATION_LIST: &str = "pi_station_list";
    pub const PI_STATION_REMOVE: &str = "pi_station_remove";
    pub const PI_STATION_STATE: &str = "pi_station_state";
}

/// Outgoing command
#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest<'a> {
    pub method: &'a str,
    pub id: u64,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> CommandRequest<'a> {
    pub fn new(method: &'a str, id: u64, params: Option<&'a Value>) -> Self {
        Self {
            method,
            id,
            jsonrpc: JSONRPC_VERSION,
            params,
        }
    }

    /// Serialize to a single CRLF-terminated line
    pub fn encode(&self) -> SeestarResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push_str("\r\n");
        Ok(line)
    }
}

/// Decode one inbound line. Blank lines yield `None`.
pub fn decode_line(line: &str) -> SeestarResult<Option<DeviceMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    if !value.is_object() {
        return Err(SeestarError::Protocol(format!(
            "expected a JSON object, got: {}",
            trimmed
        )));
    }
    Ok(Some(DeviceMessage::new(value)))
}

/// Weakly typed inbound message with accessors for the envelope fields
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMessage {
    raw: Value,
}

impl DeviceMessage {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    pub fn id(&self) -> Option<u64> {
        self.raw.get("id").and_then(Value::as_u64)
    }

    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(Value::as_str)
    }

    /// The `result` member, or `Null` when absent
    pub fn result(&self) -> &Value {
        self.raw.get("result").unwrap_or(&Value::Null)
    }

    /// The `result` member as an object, if it is one
    pub fn result_object(&self) -> Option<&Map<String, Value>> {
        self.raw.get("result").and_then(Value::as_object)
    }

    /// Top-level status code; absent means success
    pub fn code(&self) -> i64 {
        self.raw.get("code").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn has_error(&self) -> bool {
        self.raw.get("error").is_some()
    }

    /// Device error text, if any
    pub fn error_message(&self) -> Option<String> {
        self.raw.get("error").map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Numeric `result`, the per-command success flag (0 = accepted)
    pub fn result_code(&self) -> Option<i64> {
        self.raw.get("result").and_then(Value::as_i64)
    }

    /// True when both `result` and `code` report success
    pub fn is_accepted(&self) -> bool {
        self.result_code() == Some(0) && self.code() == 0
    }

    /// `result` cloned as an object, or an empty object
    pub fn result_or_empty(&self) -> Value {
        match self.raw.get("result") {
            Some(v @ Value::Object(_)) => v.clone(),
            _ => Value::Object(Map::new()),
        }
    }

    /// Fails with a command error if the device reported one
    pub fn check(self, method: &str) -> SeestarResult<Self> {
        if self.has_error() || self.code() != 0 {
            return Err(SeestarError::Command {
                method: method.to_string(),
                code: self.code(),
                message: self
                    .error_message()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        Ok(self)
    }
}

/// UDP discovery datagram
pub fn discovery_request(app_version: &str, protocol_version: &str) -> Value {
    serde_json::json!({
        "id": 1,
        "method": methods::SCAN_ISCOPE,
        "params": "",
        "app_version": app_version,
        "protocol_version": protocol_version,
    })
}

/// File channel request line
pub fn file_request(remote_path: &str) -> SeestarResult<String> {
    let mut line = serde_json::to_string(&serde_json::json!({ "file": remote_path }))?;
    line.push('\n');
    Ok(line)
}
