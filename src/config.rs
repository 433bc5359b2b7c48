// Timeouts, topics, geometry, gains and the loadable runtime configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Tick loop frequency (actuator simulation + gait)
pub const LOOP_HZ: u64 = 50;

// Number of leg servos, wire order: L hip, R hip, L knee, R knee, L ankle, R ankle
pub const NUM_SERVOS: usize = 6;

// Servo range (degrees)
pub const SERVO_MIN_ANGLE: f64 = 0.0;
pub const SERVO_MAX_ANGLE: f64 = 180.0;
pub const SERVO_DEFAULT_ANGLE: f64 = 90.0;

// Maximum change of a simulated servo per tick (degrees), stands in for inertia
pub const MAX_CHANGE_PER_TICK: f64 = 5.0;

// Default PID gains
pub const PID_KP_DEFAULT: f64 = 2.6;
pub const PID_KI_DEFAULT: f64 = 1.05;
pub const PID_KD_DEFAULT: f64 = 0.75;

// Leg geometry (mm)
pub const LEG_LENGTH_THIGH: f64 = 100.0;
pub const LEG_LENGTH_SHANK: f64 = 100.0;
pub const FOOT_SIZE: f64 = 30.0;
pub const HIP_OFFSET: f64 = 50.0;

// Gait amplitudes (degrees) and relative walking speed
pub const GAIT_HIP_AMPLITUDE: f64 = 20.0;
pub const GAIT_KNEE_AMPLITUDE: f64 = 15.0;
pub const GAIT_ANKLE_AMPLITUDE: f64 = 10.0;
pub const WALK_SPEED: f64 = 1.0;

// Zenoh topics
pub const TOPIC_CMD: &str = "biped/cmd"; // controller -> robot
pub const TOPIC_STATE: &str = "biped/state"; // robot -> controller

// Link discipline
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(200);
pub const STATE_WATCHDOG: Duration = Duration::from_secs(3);
pub const STATE_PUBLISH_PERIOD: Duration = Duration::from_millis(100);

// How long shutdown waits for background tasks before moving on
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// Servo bus (Feetech STS), ids follow the wire order above
pub const SERVO_PORT: &str = "/dev/ttyUSB0";
pub const SERVO_IDS: [u8; NUM_SERVOS] = [1, 2, 3, 4, 5, 6];

/// Errors raised while loading or validating a [`RobotConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.into(),
    }
}

/// Leg segment lengths, shared by both legs (the right leg is mirrored)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegGeometry {
    /// Thigh length, hip to knee (mm)
    pub l1: f64,
    /// Shank length, knee to ankle (mm)
    pub l2: f64,
    pub foot_size: f64,
    /// Lateral distance from the body center to each hip (mm)
    pub hip_offset: f64,
}

impl Default for LegGeometry {
    fn default() -> Self {
        Self {
            l1: LEG_LENGTH_THIGH,
            l2: LEG_LENGTH_SHANK,
            foot_size: FOOT_SIZE,
            hip_offset: HIP_OFFSET,
        }
    }
}

/// PID gain triple
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: PID_KP_DEFAULT,
            ki: PID_KI_DEFAULT,
            kd: PID_KD_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub min_angle: f64,
    pub max_angle: f64,
    pub default_angle: f64,
    pub max_change: f64,
    pub gains: PidGains,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            min_angle: SERVO_MIN_ANGLE,
            max_angle: SERVO_MAX_ANGLE,
            default_angle: SERVO_DEFAULT_ANGLE,
            max_change: MAX_CHANGE_PER_TICK,
            gains: PidGains::default(),
        }
    }
}

impl ServoConfig {
    /// Clamp an angle into the servo range
    pub fn clamp(&self, angle: f64) -> f64 {
        angle.clamp(self.min_angle, self.max_angle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaitConfig {
    pub hip_amplitude: f64,
    pub knee_amplitude: f64,
    pub ankle_amplitude: f64,
    pub speed: f64,
}

impl Default for GaitConfig {
    fn default() -> Self {
        Self {
            hip_amplitude: GAIT_HIP_AMPLITUDE,
            knee_amplitude: GAIT_KNEE_AMPLITUDE,
            ankle_amplitude: GAIT_ANKLE_AMPLITUDE,
            speed: WALK_SPEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cmd_topic: String,
    pub state_topic: String,
    /// Zenoh endpoints to connect to, e.g. `tcp/192.168.1.40:7447`; empty = scouting
    pub endpoints: Vec<String>,
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub send_timeout: Duration,
    #[serde(with = "millis")]
    pub recv_poll_timeout: Duration,
    /// Silence on the state topic longer than this counts as a dead link (None disables).
    /// Assumes the robot publishes periodically (`state_publish_period`); keep it
    /// well above that period, or disable it for a robot that only answers commands.
    #[serde(with = "millis_opt")]
    pub state_watchdog: Option<Duration>,
    #[serde(with = "millis")]
    pub state_publish_period: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cmd_topic: TOPIC_CMD.to_string(),
            state_topic: TOPIC_STATE.to_string(),
            endpoints: Vec::new(),
            retry_backoff: RETRY_BACKOFF,
            connect_timeout: CONNECT_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            recv_poll_timeout: RECV_POLL_TIMEOUT,
            state_watchdog: Some(STATE_WATCHDOG),
            state_publish_period: STATE_PUBLISH_PERIOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    // Enable hardware servo output (false = pure simulation)
    pub enabled: bool,
    pub port: String,
    pub servo_ids: [u8; NUM_SERVOS],
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: SERVO_PORT.to_string(),
            servo_ids: SERVO_IDS,
        }
    }
}

/// Complete runtime configuration. Loaded once at startup, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub leg: LegGeometry,
    pub servo: ServoConfig,
    pub gait: GaitConfig,
    #[serde(with = "millis")]
    pub tick_period: Duration,
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    pub sync: SyncConfig,
    pub hardware: HardwareConfig,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            leg: LegGeometry::default(),
            servo: ServoConfig::default(),
            gait: GaitConfig::default(),
            tick_period: Duration::from_millis(1000 / LOOP_HZ),
            join_timeout: JOIN_TIMEOUT,
            sync: SyncConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl RobotConfig {
    /// Read a JSON config file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Tick period in seconds, the `dt` fed to the PID step
    pub fn dt(&self) -> f64 {
        self.tick_period.as_secs_f64()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(positive(self.leg.l1) && positive(self.leg.l2)) {
            return Err(invalid("leg", "segment lengths must be > 0"));
        }
        if !positive(self.servo.max_angle - self.servo.min_angle) {
            return Err(invalid("servo", "min_angle must be below max_angle"));
        }
        if !(self.servo.min_angle..=self.servo.max_angle).contains(&self.servo.default_angle) {
            return Err(invalid("servo.default_angle", "outside servo range"));
        }
        if !positive(self.servo.max_change) {
            return Err(invalid("servo.max_change", "must be > 0"));
        }
        if self.tick_period.is_zero() {
            return Err(invalid("tick_period", "must be > 0"));
        }
        if self.sync.recv_poll_timeout.is_zero() {
            return Err(invalid("sync.recv_poll_timeout", "must be > 0"));
        }
        if self.sync.state_publish_period.is_zero() {
            return Err(invalid("sync.state_publish_period", "must be > 0"));
        }
        if self.sync.cmd_topic == self.sync.state_topic {
            return Err(invalid("sync", "cmd_topic and state_topic must differ"));
        }
        Ok(())
    }
}

// Durations travel as integer milliseconds in config files
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
