// Mode state machine: applies commands to the robot state
//
// WALK hands the targets to the gait generator every tick; MANUAL leaves them to
// explicit servo commands; IDLE and SCAN hold whatever targets were last set.
// STAND is one-shot: it writes the standing pose and keeps the current mode.

use tracing::info;

use crate::config::{NUM_SERVOS, RobotConfig};
use crate::kinematics::LegKinematics;
use crate::messages::{Command, ModeRequest, UnknownMode, servo_array};
use crate::state::RobotState;

/// Why a command was refused. A refused command changes nothing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    InvalidMode(#[from] UnknownMode),

    #[error("Invalid servo id {id} (expected 0..{})", NUM_SERVOS)]
    InvalidServo { id: usize },

    #[error("Expected {} angles, got {got}", NUM_SERVOS)]
    AngleCount { got: usize },

    #[error("Non-finite value in {cmd} command")]
    NonFinite { cmd: &'static str },
}

/// Apply one command. Either the whole command takes effect or nothing does.
pub fn apply_command(
    state: &mut RobotState,
    cmd: &Command,
    kinematics: &LegKinematics,
    config: &RobotConfig,
) -> Result<(), CommandError> {
    let limits = &config.servo;
    match cmd {
        Command::SetMode { mode } => match mode.parse::<ModeRequest>()? {
            ModeRequest::Enter(mode) => {
                if state.mode != mode {
                    info!("Mode {} -> {}", state.mode, mode);
                }
                state.mode = mode;
            }
            ModeRequest::Stand => stand(state, kinematics, config),
        },
        Command::SetServo { id, angle } => {
            let servo = state
                .servos
                .get_mut(*id)
                .ok_or(CommandError::InvalidServo { id: *id })?;
            if !angle.is_finite() {
                return Err(CommandError::NonFinite { cmd: cmd.name() });
            }
            servo.target = limits.clamp(*angle);
        }
        Command::SetAllServos { angles } => {
            let angles = servo_array(angles)
                .ok_or(CommandError::AngleCount { got: angles.len() })?;
            if !angles.iter().all(|a| a.is_finite()) {
                return Err(CommandError::NonFinite { cmd: cmd.name() });
            }
            state.set_targets(&angles, limits);
        }
        Command::Stand => stand(state, kinematics, config),
        Command::EnableServos => {
            if !state.servos_enabled {
                info!("Servos enabled");
            }
            state.servos_enabled = true;
        }
        Command::DisableServos => {
            if state.servos_enabled {
                info!("Servos disabled");
            }
            state.servos_enabled = false;
        }
        // Nothing to change; the caller answers with a state message
        Command::GetStatus => {}
        Command::SetPid { id, kp, ki, kd } => {
            let servo = state
                .servos
                .get_mut(*id)
                .ok_or(CommandError::InvalidServo { id: *id })?;
            if ![kp, ki, kd].iter().all(|g| g.is_finite()) {
                return Err(CommandError::NonFinite { cmd: cmd.name() });
            }
            servo.gains.kp = *kp;
            servo.gains.ki = *ki;
            servo.gains.kd = *kd;
        }
    }
    Ok(())
}

fn stand(state: &mut RobotState, kinematics: &LegKinematics, config: &RobotConfig) {
    let pose: [f64; NUM_SERVOS] = kinematics.get_standing_pose(&config.servo);
    info!("Standing pose {:?}", pose);
    state.set_targets(&pose, &config.servo);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Mode;

    struct Fixture {
        state: RobotState,
        kinematics: LegKinematics,
        config: RobotConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let config = RobotConfig::default();
            Self {
                state: RobotState::new(&config.servo),
                kinematics: LegKinematics::new(config.leg),
                config,
            }
        }

        fn apply(&mut self, cmd: Command) -> Result<(), CommandError> {
            apply_command(&mut self.state, &cmd, &self.kinematics, &self.config)
        }
    }

    #[test]
    fn test_set_mode() {
        let mut f = Fixture::new();
        for mode in Mode::ALL {
            f.apply(Command::set_mode(mode)).unwrap();
            assert_eq!(f.state.mode, mode);
        }
    }

    #[test]
    fn test_unknown_mode_changes_nothing() {
        let mut f = Fixture::new();
        f.apply(Command::set_mode(Mode::Manual)).unwrap();
        f.apply(Command::SetServo { id: 0, angle: 30.0 }).unwrap();
        let before = f.state.clone();

        let result = f.apply(Command::SetMode {
            mode: "flying".into(),
        });
        assert!(matches!(result, Err(CommandError::InvalidMode(_))));
        assert_eq!(f.state, before);
    }

    #[test]
    fn test_mode_names_must_match_exactly() {
        let mut f = Fixture::new();
        let before = f.state.clone();
        for name in ["WALK", "Manual", "STAND"] {
            let result = f.apply(Command::SetMode { mode: name.into() });
            assert!(matches!(result, Err(CommandError::InvalidMode(_))), "{name}");
        }
        assert_eq!(f.state, before);
    }

    #[test]
    fn test_five_angles_rejected_wholesale() {
        let mut f = Fixture::new();
        let before = f.state.clone();
        let result = f.apply(Command::SetAllServos {
            angles: vec![90.0; 5],
        });
        assert_eq!(result, Err(CommandError::AngleCount { got: 5 }));
        assert_eq!(f.state, before);
    }

    #[test]
    fn test_set_all_servos_clamps() {
        let mut f = Fixture::new();
        f.apply(Command::SetAllServos {
            angles: vec![-10.0, 10.0, 20.0, 30.0, 40.0, 250.0],
        })
        .unwrap();
        assert_eq!(f.state.target_angles(), [0.0, 10.0, 20.0, 30.0, 40.0, 180.0]);
        // Currents only move on ticks
        assert_eq!(f.state.current_angles(), [90.0; NUM_SERVOS]);
    }

    #[test]
    fn test_set_servo_bounds() {
        let mut f = Fixture::new();
        f.apply(Command::SetServo { id: 5, angle: 181.0 }).unwrap();
        assert_eq!(f.state.servos[5].target, 180.0);

        let before = f.state.clone();
        assert_eq!(
            f.apply(Command::SetServo { id: 6, angle: 10.0 }),
            Err(CommandError::InvalidServo { id: 6 })
        );
        assert_eq!(
            f.apply(Command::SetServo {
                id: 1,
                angle: f64::NAN
            }),
            Err(CommandError::NonFinite { cmd: "set_servo" })
        );
        assert_eq!(f.state, before);
    }

    #[test]
    fn test_stand_keeps_mode() {
        let mut f = Fixture::new();
        f.apply(Command::set_mode(Mode::Manual)).unwrap();
        f.apply(Command::Stand).unwrap();
        assert_eq!(f.state.mode, Mode::Manual);
        let pose = f.kinematics.get_standing_pose(&f.config.servo);
        assert_eq!(f.state.target_angles(), pose);

        // set_mode("stand") is the same one-shot
        f.apply(Command::SetAllServos {
            angles: vec![90.0; 6],
        })
        .unwrap();
        f.apply(Command::SetMode {
            mode: "stand".into(),
        })
        .unwrap();
        assert_eq!(f.state.mode, Mode::Manual);
        assert_eq!(f.state.target_angles(), pose);
    }

    #[test]
    fn test_torque_flag_toggles_only() {
        let mut f = Fixture::new();
        f.apply(Command::DisableServos).unwrap();
        assert!(!f.state.servos_enabled);
        assert_eq!(f.state.mode, Mode::Idle);
        f.apply(Command::EnableServos).unwrap();
        assert!(f.state.servos_enabled);
    }

    #[test]
    fn test_set_pid() {
        let mut f = Fixture::new();
        f.apply(Command::SetPid {
            id: 2,
            kp: 1.0,
            ki: 0.0,
            kd: 0.5,
        })
        .unwrap();
        assert_eq!(f.state.servos[2].gains.kp, 1.0);
        assert_eq!(f.state.servos[2].gains.kd, 0.5);
        assert_eq!(f.state.servos[3].gains, f.config.servo.gains);
    }

    #[test]
    fn test_get_status_is_noop() {
        let mut f = Fixture::new();
        let before = f.state.clone();
        f.apply(Command::GetStatus).unwrap();
        assert_eq!(f.state, before);
    }
}
