// Robot state and the lock-guarded handle shared by the tick loop, the link loop and callers

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};

use crate::actuator::ServoState;
use crate::config::{NUM_SERVOS, ServoConfig};
use crate::messages::{Mode, StateUpdate, servo_array};

/// Everything known about the robot at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    pub mode: Mode,
    pub servos: [ServoState; NUM_SERVOS],
    pub servos_enabled: bool,
    pub sensors: Map<String, Value>,
    pub connected: bool,
}

impl RobotState {
    /// All servos at the default angle, mode idle, torque enabled
    pub fn new(servo: &ServoConfig) -> Self {
        Self {
            mode: Mode::Idle,
            servos: [ServoState::new(servo.default_angle, servo.gains); NUM_SERVOS],
            servos_enabled: true,
            sensors: Map::new(),
            connected: false,
        }
    }

    pub fn current_angles(&self) -> [f64; NUM_SERVOS] {
        self.servos.map(|s| s.current)
    }

    pub fn target_angles(&self) -> [f64; NUM_SERVOS] {
        self.servos.map(|s| s.target)
    }

    pub fn set_targets(&mut self, targets: &[f64; NUM_SERVOS], limits: &ServoConfig) {
        for (servo, &target) in self.servos.iter_mut().zip(targets) {
            servo.target = limits.clamp(target);
        }
    }

    /// Full state message as pushed by the robot
    pub fn to_update(&self) -> StateUpdate {
        StateUpdate {
            mode: Some(self.mode),
            servos: Some(self.current_angles().to_vec()),
            targets: Some(self.target_angles().to_vec()),
            servos_enabled: Some(self.servos_enabled),
            sensors: Some(self.sensors.clone()),
        }
    }

    /// Fold a (possibly partial) state message into this cached state.
    ///
    /// Absent fields keep their cached values. Angle lists that do not have one
    /// entry per servo, or contain non-finite values, are ignored; angles are clamped.
    pub fn merge(&mut self, update: StateUpdate, limits: &ServoConfig) {
        if let Some(mode) = update.mode {
            self.mode = mode;
        }
        if let Some(servos) = update.servos.as_deref().and_then(finite_servo_array) {
            for (servo, angle) in self.servos.iter_mut().zip(servos) {
                servo.current = limits.clamp(angle);
            }
        }
        if let Some(targets) = update.targets.as_deref().and_then(finite_servo_array) {
            self.set_targets(&targets, limits);
        }
        if let Some(enabled) = update.servos_enabled {
            self.servos_enabled = enabled;
        }
        if let Some(sensors) = update.sensors {
            self.sensors = sensors;
        }
    }
}

fn finite_servo_array(angles: &[f64]) -> Option<[f64; NUM_SERVOS]> {
    servo_array(angles).filter(|a| a.iter().all(|v| v.is_finite()))
}

/// Cloneable handle to one [`RobotState`] behind a single mutex.
///
/// The lock is held only for the closure passed to [`SharedState::update`] or
/// for the copy made by [`SharedState::snapshot`]; never across I/O or `.await`.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<RobotState>>,
}

impl SharedState {
    pub fn new(state: RobotState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    // Every field is plain data, a poisoned lock still guards a usable state
    fn lock(&self) -> MutexGuard<'_, RobotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of the whole state
    pub fn snapshot(&self) -> RobotState {
        self.lock().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RobotState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Set the connectivity flag, returns the previous value
    pub fn set_connected(&self, connected: bool) -> bool {
        std::mem::replace(&mut self.lock().connected, connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ServoConfig {
        ServoConfig::default()
    }

    #[test]
    fn test_initial_state() {
        let state = RobotState::new(&limits());
        assert_eq!(state.mode, Mode::Idle);
        assert_eq!(state.current_angles(), [90.0; NUM_SERVOS]);
        assert_eq!(state.target_angles(), [90.0; NUM_SERVOS]);
        assert!(state.servos_enabled);
        assert!(!state.connected);
    }

    #[test]
    fn test_merge_keeps_absent_fields() {
        let mut state = RobotState::new(&limits());
        state.merge(
            StateUpdate {
                mode: Some(Mode::Walk),
                servos: Some(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]),
                ..StateUpdate::default()
            },
            &limits(),
        );
        state.merge(
            StateUpdate {
                servos_enabled: Some(false),
                ..StateUpdate::default()
            },
            &limits(),
        );

        assert_eq!(state.mode, Mode::Walk);
        assert_eq!(state.current_angles(), [10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert!(!state.servos_enabled);
    }

    #[test]
    fn test_merge_clamps_and_ignores_bad_lengths() {
        let mut state = RobotState::new(&limits());
        state.merge(
            StateUpdate {
                servos: Some(vec![-5.0, 200.0, 90.0, 90.0, 90.0, 90.0]),
                targets: Some(vec![1.0, 2.0, 3.0]),
                ..StateUpdate::default()
            },
            &limits(),
        );
        assert_eq!(state.current_angles()[0], 0.0);
        assert_eq!(state.current_angles()[1], 180.0);
        assert_eq!(state.target_angles(), [90.0; NUM_SERVOS]);
    }

    #[test]
    fn test_update_round_trip_through_json() {
        let mut state = RobotState::new(&limits());
        state.mode = Mode::Scan;
        state.servos[3].current = 33.0;
        state.sensors.insert("battery".into(), Value::from(7.4));

        let json = serde_json::to_string(&state.to_update()).unwrap();
        let mut mirror = RobotState::new(&limits());
        mirror.merge(serde_json::from_str(&json).unwrap(), &limits());

        assert_eq!(mirror.mode, Mode::Scan);
        assert_eq!(mirror.current_angles(), state.current_angles());
        assert_eq!(mirror.sensors.get("battery"), Some(&Value::from(7.4)));
    }

    #[test]
    fn test_shared_state_snapshot_is_a_copy() {
        let shared = SharedState::new(RobotState::new(&limits()));
        let snap = shared.snapshot();
        shared.update(|s| s.mode = Mode::Manual);
        assert_eq!(snap.mode, Mode::Idle);
        assert_eq!(shared.mode(), Mode::Manual);
        assert!(!shared.set_connected(true));
        assert!(shared.is_connected());
    }
}
