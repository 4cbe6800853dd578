//! Wire types for the cloud HTTP and WebSocket protocol
//!
//! All messages are JSON. Field names and the constant fields below are
//! backend contract: they must match the vendor web client byte for
//! byte, so the serde renames here are not negotiable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{FanSpeed, Mode, Power};

/// `message_type` discriminator of live state frames
pub const STATE_UPDATE: &str = "StateUpdate";

/// `connection_source` value identifying a web client
pub const CONNECTION_SOURCE_WEB: u8 = 0;

/// `preset` value for plain (non-preset) commands
pub const PRESET_NONE: u8 = 0;

/// `application_version` reported in every command envelope
pub const APPLICATION_VERSION: &str = "1.0.0";

// Protocol-required constant action fields. This client never drives
// them, but every envelope must carry them.
pub const DEFAULT_SWING: &str = "auto";
pub const DEFAULT_TURBO: &str = "off";
pub const DEFAULT_LIGHT: &str = "off";
pub const DEFAULT_FOLLOWME: &str = "off";

/// Body of `POST /auth/login`
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub user: LoginUser,

    #[serde(rename = "captchaToken", skip_serializing_if = "Option::is_none")]
    pub captcha_token: Option<String>,
}

/// Fixed web-client identity payload inside the login body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub user_id: String,
    /// Lowercase-hex digest, never the plaintext password
    pub password: String,
    pub mobile_device_id: String,
    pub device_token_id: String,
    pub app_type: String,
    pub app_version: String,
    pub time_zone: String,
    pub mobile_device_name: String,
    pub device_type: String,
    pub ip_address: String,
    #[serde(rename = "isSmartHVAC")]
    pub is_smart_hvac: String,
    pub locale: String,
}

/// Response of `POST /auth/login`
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    /// In-body status; anything but 200 is a rejection
    pub status: u16,
    #[serde(default)]
    pub message: String,
    pub data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
pub struct LoginData {
    pub user: Option<SessionUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub session_id: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Response of `GET /web/token/refresh`
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub data: Option<RefreshData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshData {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Response of `GET /web/devices`
#[derive(Debug, Deserialize)]
pub struct DevicesResponse {
    pub data: Option<DevicesData>,
}

#[derive(Debug, Deserialize)]
pub struct DevicesData {
    #[serde(rename = "listDevices", default)]
    pub list_devices: Vec<DeviceEntry>,
}

/// One device in the directory snapshot
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    pub mac_address: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub appliance_id: i64,
    #[serde(default)]
    pub fw_version: String,
    #[serde(default)]
    pub device_type_version: String,
    #[serde(default)]
    pub latest_action: ActionFields,
    #[serde(default)]
    pub lat_env: Option<LatEnv>,
}

/// Command-state fields as they appear in directory snapshots and
/// inbound socket frames; every field is optional because partial
/// updates are valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionFields {
    pub power: Option<Power>,
    pub mode: Option<Mode>,
    pub fanspeed: Option<FanSpeed>,
    /// The backend emits this as either a string or a number
    #[serde(default, deserialize_with = "loose_string")]
    pub temp: Option<String>,
}

/// Environment block of a directory snapshot
#[derive(Debug, Clone, Deserialize)]
pub struct LatEnv {
    pub temp: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
}

/// Environment block of an inbound socket frame (different field
/// names than the directory's `latEnv`, a backend quirk)
#[derive(Debug, Clone, Deserialize)]
pub struct EnvUpdate {
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
}

/// Inbound socket frame. Only frames with `message_type` and
/// `mac_address` set are acted on; everything else is ignored.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub action: Option<ActionFields>,
    #[serde(default)]
    pub lat_env_var: Option<EnvUpdate>,
}

/// Outbound command, one parameter change per message
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "applianceId")]
    pub appliance_id: i64,
    #[serde(rename = "deviceTypeVersion")]
    pub device_type_version: String,
    #[serde(rename = "fwVersion")]
    pub fw_version: String,
    #[serde(rename = "actionType")]
    pub action_type: String,
    /// String for power/mode/fanspeed, numeric for temp
    #[serde(rename = "actionValue")]
    pub action_value: Value,
    pub connection_source: u8,
    pub user_id: String,
    pub preset: u8,
    #[serde(rename = "oldPower")]
    pub old_power: String,
    pub actions: CommandActions,
    pub application_version: String,
    /// Unix seconds
    pub ts: i64,
}

/// Full action block of a command envelope
#[derive(Debug, Clone, Serialize)]
pub struct CommandActions {
    pub power: String,
    pub mode: String,
    pub fanspeed: String,
    pub temp: String,
    pub swing: String,
    pub turbo: String,
    pub light: String,
    pub followme: String,
}

/// Accepts a JSON string or number and yields the string form.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
