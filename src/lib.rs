pub mod actuator;
pub mod config;
pub mod gait;
pub mod kinematics;
pub mod messages;
pub mod mode;
pub mod motor;
pub mod runtime;
pub mod state;
pub mod sync;
pub mod task;
