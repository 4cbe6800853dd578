//! Per-device command state and telemetry
//!
//! A [`Device`] mirrors one physical thermostat. Its command state only
//! ever changes from confirmed backend data (directory snapshots and
//! inbound socket updates); commands are never applied optimistically.
//! Building an outbound payload is a pure transform with no I/O.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{
    ActionFields, CommandActions, CommandEnvelope, DeviceEntry, EnvUpdate, APPLICATION_VERSION,
    CONNECTION_SOURCE_WEB, DEFAULT_FOLLOWME, DEFAULT_LIGHT, DEFAULT_SWING, DEFAULT_TURBO,
    PRESET_NONE,
};

/// Canonical MAC form: uppercase, separators stripped.
///
/// The directory reports `c4:5b:be:c4:24:67` while socket frames carry
/// `C45BBEC42467`; both must key the same device.
pub fn normalize_mac(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Power {
    On,
    #[default]
    Off,
}

impl Power {
    pub fn as_str(&self) -> &'static str {
        match self {
            Power::On => "on",
            Power::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Cool,
    Heat,
    Dry,
    Fan,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Cool => "cool",
            Mode::Heat => "heat",
            Mode::Dry => "dry",
            Mode::Fan => "fan",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanSpeed {
    #[default]
    Auto,
    Low,
    Medium,
    High,
}

impl FanSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanSpeed::Auto => "auto",
            FanSpeed::Low => "low",
            FanSpeed::Medium => "medium",
            FanSpeed::High => "high",
        }
    }
}

/// Last command state confirmed by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandState {
    pub power: Power,
    pub mode: Mode,
    pub fan_speed: FanSpeed,
    /// Set-point; kept as the wire string (e.g. "70")
    pub temperature: String,
}

/// Room environment readings, updated independently of command state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub room_temperature: Option<f64>,
    pub room_humidity: Option<f64>,
}

/// One change to dispatch to a device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandAction {
    Power(Power),
    Mode(Mode),
    FanSpeed(FanSpeed),
    Temperature(f64),
}

impl CommandAction {
    pub fn action_type(&self) -> &'static str {
        match self {
            CommandAction::Power(_) => "power",
            CommandAction::Mode(_) => "mode",
            CommandAction::FanSpeed(_) => "fanspeed",
            CommandAction::Temperature(_) => "temp",
        }
    }

    /// Top-level `actionValue`. A temperature change is numeric here
    /// while `actions.temp` stays a string; the backend expects both
    /// representations at once.
    pub fn action_value(&self) -> Value {
        match self {
            CommandAction::Power(p) => Value::String(p.as_str().to_string()),
            CommandAction::Mode(m) => Value::String(m.as_str().to_string()),
            CommandAction::FanSpeed(f) => Value::String(f.as_str().to_string()),
            CommandAction::Temperature(t) => {
                serde_json::Number::from_f64(*t).map_or(Value::Null, Value::Number)
            }
        }
    }
}

fn format_temperature(t: f64) -> String {
    if t.fract() == 0.0 {
        format!("{}", t as i64)
    } else {
        t.to_string()
    }
}

/// One physical unit, keyed by normalized MAC address
#[derive(Debug, Clone)]
pub struct Device {
    pub mac_address: String,
    pub display_name: String,
    pub appliance_id: i64,
    pub fw_version: String,
    pub device_type_version: String,
    pub state: CommandState,
    pub telemetry: Telemetry,
}

impl Device {
    /// Seed a device from a directory snapshot entry
    pub fn from_entry(entry: DeviceEntry) -> Self {
        let mut device = Self {
            mac_address: normalize_mac(&entry.mac_address),
            display_name: entry.device_name,
            appliance_id: entry.appliance_id,
            fw_version: entry.fw_version,
            device_type_version: entry.device_type_version,
            state: CommandState::default(),
            telemetry: Telemetry::default(),
        };
        device.apply_action(&entry.latest_action);
        if let Some(env) = entry.lat_env {
            device.telemetry.room_temperature = env.temp;
            device.telemetry.room_humidity = env.humidity;
        }
        device
    }

    /// Overwrite command-state fields present in the update; absent
    /// fields are left untouched (partial updates are expected).
    pub fn apply_action(&mut self, action: &ActionFields) {
        if let Some(power) = action.power {
            self.state.power = power;
        }
        if let Some(mode) = action.mode {
            self.state.mode = mode;
        }
        if let Some(fanspeed) = action.fanspeed {
            self.state.fan_speed = fanspeed;
        }
        if let Some(temp) = &action.temp {
            self.state.temperature = temp.clone();
        }
    }

    /// Apply a telemetry update; returns true when a reading changed.
    pub fn apply_env(&mut self, env: &EnvUpdate) -> bool {
        let mut changed = false;
        if let Some(temp) = env.temperature {
            if self.telemetry.room_temperature != Some(temp) {
                changed = true;
            }
            self.telemetry.room_temperature = Some(temp);
        }
        if let Some(humidity) = env.humidity {
            if self.telemetry.room_humidity != Some(humidity) {
                changed = true;
            }
            self.telemetry.room_humidity = Some(humidity);
        }
        changed
    }

    /// Build the outbound payload for one parameter change.
    ///
    /// Unchanged fields carry the current confirmed state; swing,
    /// turbo, light, and followme are protocol-required constants.
    pub fn build_command(
        &self,
        action: &CommandAction,
        old_power: Power,
        user_id: &str,
    ) -> CommandEnvelope {
        let mut actions = CommandActions {
            power: self.state.power.as_str().to_string(),
            mode: self.state.mode.as_str().to_string(),
            fanspeed: self.state.fan_speed.as_str().to_string(),
            temp: self.state.temperature.clone(),
            swing: DEFAULT_SWING.to_string(),
            turbo: DEFAULT_TURBO.to_string(),
            light: DEFAULT_LIGHT.to_string(),
            followme: DEFAULT_FOLLOWME.to_string(),
        };

        match action {
            CommandAction::Power(p) => actions.power = p.as_str().to_string(),
            CommandAction::Mode(m) => actions.mode = m.as_str().to_string(),
            CommandAction::FanSpeed(f) => actions.fanspeed = f.as_str().to_string(),
            CommandAction::Temperature(t) => actions.temp = format_temperature(*t),
        }

        CommandEnvelope {
            mac_address: self.mac_address.clone(),
            appliance_id: self.appliance_id,
            device_type_version: self.device_type_version.clone(),
            fw_version: self.fw_version.clone(),
            action_type: action.action_type().to_string(),
            action_value: action.action_value(),
            connection_source: CONNECTION_SOURCE_WEB,
            user_id: user_id.to_string(),
            preset: PRESET_NONE,
            old_power: old_power.as_str().to_string(),
            actions,
            application_version: APPLICATION_VERSION.to_string(),
            ts: Utc::now().timestamp(),
        }
    }
}
