// Servo output for the leg joints
//
// Provides:
// - Feetech STS3215 serial protocol implementation
// - Six-servo position driver fed from the simulated joint angles

mod driver;
pub mod feetech;

pub use driver::{ServoDriver, degrees_to_steps, steps_to_degrees};
pub use feetech::{FeetechBus, FeetechError};
