// Sinusoidal walking gait
// Targets are a pure function of elapsed time, so late or skipped ticks do not
// shift the pattern.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::time::{Duration, Instant};

use crate::config::{GaitConfig, NUM_SERVOS, SERVO_DEFAULT_ANGLE};

#[derive(Debug, Clone, Copy)]
pub struct GaitGenerator {
    config: GaitConfig,
    origin: Instant,
    active: bool,
}

impl GaitGenerator {
    pub fn new(config: GaitConfig) -> Self {
        Self {
            config,
            origin: Instant::now(),
            active: false,
        }
    }

    /// Per-tick entry point. Returns the targets while walking, restarting the
    /// pattern at phase 0 whenever walking resumes.
    pub fn update(&mut self, walking: bool) -> Option<[f64; NUM_SERVOS]> {
        if !walking {
            self.active = false;
            return None;
        }
        if !self.active {
            self.restart();
            self.active = true;
        }
        Some(self.targets_at(self.current_phase()))
    }

    /// Start the pattern over from phase 0
    pub fn restart(&mut self) {
        self.origin = Instant::now();
    }

    /// Phase (radians) after `elapsed` wall time, scaled by the walking speed
    pub fn phase(&self, elapsed: Duration) -> f64 {
        elapsed.as_secs_f64() * self.config.speed
    }

    /// Phase right now
    pub fn current_phase(&self) -> f64 {
        self.phase(self.origin.elapsed())
    }

    /// Targets at phase `t`, wire order `[L hip, R hip, L knee, R knee, L ankle, R ankle]`.
    /// Left and right legs move in anti-phase around the neutral angle.
    pub fn targets_at(&self, t: f64) -> [f64; NUM_SERVOS] {
        let GaitConfig {
            hip_amplitude,
            knee_amplitude,
            ankle_amplitude,
            ..
        } = self.config;
        let hip = hip_amplitude * t.sin();
        let knee = knee_amplitude * (t + FRAC_PI_4).sin();
        let ankle = ankle_amplitude * (t + FRAC_PI_2).sin();

        [
            SERVO_DEFAULT_ANGLE + hip,
            SERVO_DEFAULT_ANGLE - hip,
            SERVO_DEFAULT_ANGLE + knee,
            SERVO_DEFAULT_ANGLE - knee,
            SERVO_DEFAULT_ANGLE + ankle,
            SERVO_DEFAULT_ANGLE - ankle,
        ]
    }
}
