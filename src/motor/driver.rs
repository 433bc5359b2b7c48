// High-level driver for the six leg servos
//
// Maps joint angles (degrees, 90 = neutral) onto Feetech goal positions and
// keeps torque in step with the robot's servos_enabled flag.

use tracing::{debug, info, warn};

use super::feetech::{FeetechBus, FeetechError, MAX_POSITION, OperatingMode, Register, STEPS_PER_REV};
use crate::config::{HardwareConfig, NUM_SERVOS};

/// Steps at the neutral joint angle (90 degrees)
const CENTER_STEPS: f64 = 2048.0;
const NEUTRAL_DEGREES: f64 = 90.0;

/// Joint angle in degrees to goal position steps, saturating at the encoder range
pub fn degrees_to_steps(degrees: f64) -> u16 {
    let steps = CENTER_STEPS + (degrees - NEUTRAL_DEGREES) * f64::from(STEPS_PER_REV) / 360.0;
    steps.round().clamp(0.0, f64::from(MAX_POSITION)) as u16
}

pub fn steps_to_degrees(steps: u16) -> f64 {
    NEUTRAL_DEGREES + (f64::from(steps) - CENTER_STEPS) * 360.0 / f64::from(STEPS_PER_REV)
}

/// Position-mode driver for `[L hip, R hip, L knee, R knee, L ankle, R ankle]`
pub struct ServoDriver {
    bus: FeetechBus,
    servo_ids: [u8; NUM_SERVOS],
    torque: bool,
}

impl ServoDriver {
    pub fn open(config: &HardwareConfig) -> Result<Self, FeetechError> {
        info!("Opening servo bus on {}", config.port);
        let bus = FeetechBus::open(&config.port)?;
        Ok(Self {
            bus,
            servo_ids: config.servo_ids,
            torque: false,
        })
    }

    /// Ping every servo and switch it to position mode. Torque stays off until
    /// [`ServoDriver::set_torque`] is called.
    pub fn initialize(&mut self) -> Result<(), FeetechError> {
        info!("Initializing servos {:?} for position control", self.servo_ids);

        for &id in &self.servo_ids {
            match self.bus.ping(id) {
                Ok(true) => debug!("Servo {} responding", id),
                Ok(false) => {
                    warn!("Servo {} not responding to ping", id);
                    return Err(FeetechError::Timeout { id });
                }
                Err(e) => return Err(e),
            }
        }

        // Mode changes need torque off
        for &id in &self.servo_ids {
            self.bus.disable_torque(id)?;
            self.bus.set_operating_mode(id, OperatingMode::Position)?;
            let mode = self.bus.read_u8(id, Register::OperatingMode)?;
            if mode != OperatingMode::Position as u8 {
                return Err(FeetechError::InvalidResponse {
                    id,
                    reason: format!("operating mode is {} after switching to position", mode),
                });
            }
        }
        self.torque = false;

        info!("Servos initialized");
        Ok(())
    }

    pub fn torque_enabled(&self) -> bool {
        self.torque
    }

    pub fn set_torque(&mut self, enabled: bool) -> Result<(), FeetechError> {
        info!("{} torque on all servos", if enabled { "Enabling" } else { "Disabling" });
        for &id in &self.servo_ids {
            if enabled {
                self.bus.enable_torque(id)?;
            } else {
                self.bus.disable_torque(id)?;
            }
        }
        self.torque = enabled;
        Ok(())
    }

    /// One sync-write packet for all six goal positions
    pub fn write_angles(&mut self, angles: &[f64; NUM_SERVOS]) -> Result<(), FeetechError> {
        let mut data = [(0u8, 0u16); NUM_SERVOS];
        for (slot, (&id, &angle)) in data.iter_mut().zip(self.servo_ids.iter().zip(angles)) {
            *slot = (id, degrees_to_steps(angle));
        }
        self.bus.sync_write_u16(Register::GoalPosition, &data)
    }

    /// Present positions in degrees
    pub fn read_angles(&mut self) -> Result<[f64; NUM_SERVOS], FeetechError> {
        let mut angles = [0.0; NUM_SERVOS];
        for (angle, &id) in angles.iter_mut().zip(&self.servo_ids) {
            *angle = steps_to_degrees(self.bus.get_position(id)?);
        }
        Ok(angles)
    }
}

impl Drop for ServoDriver {
    fn drop(&mut self) {
        // Leave the legs limp rather than holding a stale pose
        if self.torque {
            if let Err(e) = self.set_torque(false) {
                warn!("Failed to release servos on drop: {}", e);
            }
        }
    }
}
