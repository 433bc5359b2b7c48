// Wire types exchanged between controller and robot

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::NUM_SERVOS;

/// Top-level behavior of the robot, selects who supplies servo targets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Idle,
    Walk,
    Manual,
    Scan,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Idle, Mode::Walk, Mode::Manual, Mode::Scan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Walk => "walk",
            Mode::Manual => "manual",
            Mode::Scan => "scan",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `set_mode` request asks for. `stand` is accepted there too but is a
/// one-shot pose, not a persisted mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    Enter(Mode),
    Stand,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown mode: {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for ModeRequest {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Exact lowercase names only
        if s == "stand" {
            return Ok(ModeRequest::Stand);
        }
        Mode::ALL
            .iter()
            .find(|m| s == m.as_str())
            .map(|&m| ModeRequest::Enter(m))
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

// Command from controller -> robot, one JSON object per message: {"cmd": "...", ...}
// Mode names and angle lists stay loose on the wire so that a bad value is
// rejected by the state machine instead of vanishing as an undecodable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    SetMode { mode: String },
    SetServo { id: usize, angle: f64 },
    SetAllServos { angles: Vec<f64> },
    Stand,
    EnableServos,
    DisableServos,
    GetStatus,
    SetPid { id: usize, kp: f64, ki: f64, kd: f64 },
}

impl Command {
    pub fn set_mode(mode: Mode) -> Self {
        Command::SetMode {
            mode: mode.as_str().to_string(),
        }
    }

    /// Name used in the `cmd` field
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetMode { .. } => "set_mode",
            Command::SetServo { .. } => "set_servo",
            Command::SetAllServos { .. } => "set_all_servos",
            Command::Stand => "stand",
            Command::EnableServos => "enable_servos",
            Command::DisableServos => "disable_servos",
            Command::GetStatus => "get_status",
            Command::SetPid { .. } => "set_pid",
        }
    }
}

/// State pushed robot -> controller. Every field is optional: a message only
/// carries what changed, absent fields leave the receiver's cache alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servos: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servos_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Returns the angle list as a fixed array when it has exactly one entry per servo
pub fn servo_array(angles: &[f64]) -> Option<[f64; NUM_SERVOS]> {
    <[f64; NUM_SERVOS]>::try_from(angles).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let json = serde_json::to_string(&Command::set_mode(Mode::Walk)).unwrap();
        assert_eq!(json, r#"{"cmd":"set_mode","mode":"walk"}"#);

        let json = serde_json::to_string(&Command::Stand).unwrap();
        assert_eq!(json, r#"{"cmd":"stand"}"#);

        let cmd: Command = serde_json::from_str(r#"{"cmd":"set_servo","id":3,"angle":45.5}"#).unwrap();
        assert_eq!(cmd, Command::SetServo { id: 3, angle: 45.5 });
    }

    #[test]
    fn test_unknown_mode_still_decodes() {
        // Rejection happens when the command is applied, not at decode time
        let cmd: Command = serde_json::from_str(r#"{"cmd":"set_mode","mode":"flying"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::SetMode {
                mode: "flying".into()
            }
        );
        assert!("flying".parse::<ModeRequest>().is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"cmd":"fly"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"mode":"walk"}"#).is_err());
    }

    #[test]
    fn test_mode_request_parsing() {
        assert_eq!(
            "walk".parse::<ModeRequest>(),
            Ok(ModeRequest::Enter(Mode::Walk))
        );
        assert_eq!(
            "scan".parse::<ModeRequest>(),
            Ok(ModeRequest::Enter(Mode::Scan))
        );
        assert_eq!("stand".parse::<ModeRequest>(), Ok(ModeRequest::Stand));
    }

    #[test]
    fn test_mode_names_are_case_sensitive() {
        for name in ["SCAN", "Walk", "IDLE", "STAND", " walk", ""] {
            assert_eq!(
                name.parse::<ModeRequest>(),
                Err(UnknownMode(name.to_string())),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_partial_state_update() {
        let update: StateUpdate = serde_json::from_str(r#"{"servos_enabled":false}"#).unwrap();
        assert_eq!(update.servos_enabled, Some(false));
        assert!(update.mode.is_none());
        assert!(update.servos.is_none());

        // Unknown fields (e.g. debug extras from firmware) are ignored
        let update: StateUpdate =
            serde_json::from_str(r#"{"mode":"manual","pid_errors":[0,0,0,0,0,0]}"#).unwrap();
        assert_eq!(update.mode, Some(Mode::Manual));
    }

    #[test]
    fn test_servo_array() {
        assert!(servo_array(&[90.0; 6]).is_some());
        assert!(servo_array(&[90.0; 5]).is_none());
    }
}
