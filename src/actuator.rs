// Simulated servo dynamics: a PID position tracker per servo, stepped once per tick
//
// Each tick moves `current` toward `target` by at most `max_change` degrees, which
// stands in for the inertia and speed limit of a real hobby servo.

use serde::{Deserialize, Serialize};

use crate::config::{NUM_SERVOS, PidGains, ServoConfig};

/// Per-servo state. `target` is written by commands and the gait generator,
/// everything else only by [`ServoState::step`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoState {
    pub current: f64,
    pub target: f64,
    pub integral: f64,
    pub previous_error: f64,
    pub gains: PidGains,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ServoFault {
    #[error("Non-finite PID output {output} (current={current}, target={target})")]
    NonFinite {
        output: f64,
        current: f64,
        target: f64,
    },
}

impl ServoState {
    pub fn new(angle: f64, gains: PidGains) -> Self {
        Self {
            current: angle,
            target: angle,
            integral: 0.0,
            previous_error: 0.0,
            gains,
        }
    }

    /// Advance one tick of `dt` seconds and return the applied change.
    ///
    /// On a fault the servo is left exactly as it was.
    pub fn step(&mut self, dt: f64, limits: &ServoConfig) -> Result<f64, ServoFault> {
        let PidGains { kp, ki, kd } = self.gains;
        let error = self.target - self.current;
        let integral = self.integral + error * dt;
        let derivative = if dt > 0.0 {
            (error - self.previous_error) / dt
        } else {
            0.0
        };

        let raw = kp * error + ki * integral + kd * derivative;
        if !raw.is_finite() || !integral.is_finite() {
            return Err(ServoFault::NonFinite {
                output: raw,
                current: self.current,
                target: self.target,
            });
        }

        let output = raw.clamp(-limits.max_change, limits.max_change);
        let next = limits.clamp(self.current + output);
        let applied = next - self.current;

        self.current = next;
        self.integral = integral;
        self.previous_error = error;
        Ok(applied)
    }
}

/// Step all servos; a fault in one does not keep the others from updating.
/// Returns the faults by servo index.
pub fn step_all(
    servos: &mut [ServoState; NUM_SERVOS],
    dt: f64,
    limits: &ServoConfig,
) -> Vec<(usize, ServoFault)> {
    servos
        .iter_mut()
        .enumerate()
        .filter_map(|(i, servo)| servo.step(dt, limits).err().map(|fault| (i, fault)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servo(current: f64, target: f64) -> ServoState {
        ServoState {
            target,
            ..ServoState::new(current, PidGains::default())
        }
    }

    #[test]
    fn test_equilibrium_is_fixed_point() {
        let limits = ServoConfig::default();
        let mut s = servo(42.0, 42.0);
        for _ in 0..10 {
            let applied = s.step(0.02, &limits).unwrap();
            assert_eq!(applied, 0.0);
        }
        assert_eq!(s.current, 42.0);
    }

    #[test]
    fn test_large_error_clamped_to_max_change() {
        // raw = 2.6*90 + 1.05*1.8 + 0.75*(90/0.02), far above 5
        let limits = ServoConfig::default();
        let mut s = servo(90.0, 180.0);
        let applied = s.step(0.02, &limits).unwrap();
        assert_eq!(applied, 5.0);
        assert_eq!(s.current, 95.0);
        assert_eq!(s.previous_error, 90.0);
        assert!((s.integral - 1.8).abs() < 1e-12);
    }

    #[test]
    fn test_change_per_tick_bounded() {
        let limits = ServoConfig::default();
        let pairs = [(0.0, 180.0), (180.0, 0.0), (90.0, 91.0), (10.0, 3.0), (170.0, 179.5)];
        for &(current, target) in &pairs {
            let mut s = servo(current, target);
            for _ in 0..50 {
                let before = s.current;
                s.step(0.02, &limits).unwrap();
                assert!((s.current - before).abs() <= limits.max_change + 1e-12);
                assert!((0.0..=180.0).contains(&s.current));
            }
        }
    }

    #[test]
    fn test_converges_with_proportional_gain() {
        let limits = ServoConfig::default();
        let mut s = servo(90.0, 130.0);
        s.gains = PidGains {
            kp: 0.5,
            ki: 0.0,
            kd: 0.0,
        };
        for _ in 0..100 {
            s.step(0.02, &limits).unwrap();
        }
        assert!((s.current - 130.0).abs() < 1e-6, "ended at {}", s.current);
    }

    #[test]
    fn test_zero_dt_has_no_derivative() {
        let limits = ServoConfig::default();
        let mut s = servo(90.0, 91.0);
        s.gains = PidGains {
            kp: 1.0,
            ki: 0.0,
            kd: 10.0,
        };
        let applied = s.step(0.0, &limits).unwrap();
        assert_eq!(applied, 1.0);
    }

    #[test]
    fn test_non_finite_output_leaves_servo_untouched() {
        let limits = ServoConfig::default();
        let mut s = servo(90.0, 100.0);
        s.gains.kp = f64::INFINITY;
        let before = s;
        assert!(matches!(s.step(0.02, &limits), Err(ServoFault::NonFinite { .. })));
        assert_eq!(s, before);
    }

    #[test]
    fn test_fault_isolated_to_one_servo() {
        let limits = ServoConfig::default();
        let mut servos = [servo(90.0, 120.0); NUM_SERVOS];
        servos[2].gains.kd = f64::NAN;

        let faults = step_all(&mut servos, 0.02, &limits);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, 2);
        assert_eq!(servos[2].current, 90.0);
        for (i, s) in servos.iter().enumerate() {
            if i != 2 {
                assert_eq!(s.current, 95.0);
            }
        }
    }
}
