// Two-link leg kinematics for the biped
// Converts a 2D foot position (relative to the hip, y pointing up) into hip/knee/ankle
// servo angles and back. Servo space is degrees in [0, 180] with 90 as neutral.

use std::f64::consts::PI;

use crate::config::{LegGeometry, NUM_SERVOS, SERVO_DEFAULT_ANGLE, ServoConfig};

/// Which leg. The right leg is mounted mirrored, only its hip is flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn is_left(self) -> bool {
        self == Side::Left
    }
}

/// Servo-space angles for one leg (degrees, not clamped)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LegAngles {
    pub hip: f64,
    pub knee: f64,
    pub ankle: f64,
}

impl LegAngles {
    pub const NEUTRAL: LegAngles = LegAngles {
        hip: SERVO_DEFAULT_ANGLE,
        knee: SERVO_DEFAULT_ANGLE,
        ankle: SERVO_DEFAULT_ANGLE,
    };

    pub fn as_array(&self) -> [f64; 3] {
        [self.hip, self.knee, self.ankle]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum KinematicsError {
    #[error(
        "Foot position ({x:.1}, {y:.1}) unreachable: distance {distance:.1} outside [{min:.1}, {max:.1}]"
    )]
    Unreachable {
        x: f64,
        y: f64,
        distance: f64,
        min: f64,
        max: f64,
    },
}

pub type Point3 = [f64; 3];

/// 3D joint positions for the rendering layer. Body at the origin, legs hang in the x-z plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointPositions {
    pub body: Point3,
    pub left_hip: Point3,
    pub right_hip: Point3,
    pub left_knee: Point3,
    pub right_knee: Point3,
    pub left_foot: Point3,
    pub right_foot: Point3,
}

/// Kinematics engine for one leg geometry, shared by both legs
#[derive(Debug, Clone, Copy)]
pub struct LegKinematics {
    geometry: LegGeometry,
}

impl LegKinematics {
    pub fn new(geometry: LegGeometry) -> Self {
        Self { geometry }
    }

    /// Foot position -> servo angles
    ///
    /// # Arguments
    /// * `x` - Forward offset of the foot from the hip (mm)
    /// * `y` - Vertical offset of the foot from the hip (mm, negative = below)
    /// * `side` - Leg side; the right hip angle is mirrored
    ///
    /// # Returns
    /// Servo-space degrees, unclamped, or `Unreachable` when the point is outside the
    /// annulus `[|l1 - l2|, l1 + l2]`
    pub fn inverse_kinematics(
        &self,
        x: f64,
        y: f64,
        side: Side,
    ) -> Result<LegAngles, KinematicsError> {
        let LegGeometry { l1, l2, .. } = self.geometry;
        let distance = x.hypot(y);
        let (min, max) = ((l1 - l2).abs(), l1 + l2);

        // NaN or infinite input never compares out of range, reject it explicitly
        if !distance.is_finite() || distance > max || distance < min {
            return Err(KinematicsError::Unreachable {
                x,
                y,
                distance,
                min,
                max,
            });
        }

        // Hip angle measured from straight down, positive towards +x
        let hip_base = x.atan2(-y);

        // Law of cosines; knee is the bend between thigh and shank directions
        let cos_knee =
            ((distance * distance - l1 * l1 - l2 * l2) / (2.0 * l1 * l2)).clamp(-1.0, 1.0);
        let knee = cos_knee.acos();

        // Folded leg (foot on the hip): any hip angle works, keep the base direction
        let hip_extra = if distance > f64::EPSILON {
            ((l1 * l1 + distance * distance - l2 * l2) / (2.0 * l1 * distance))
                .clamp(-1.0, 1.0)
                .acos()
        } else {
            0.0
        };

        let hip = hip_base + hip_extra;
        // Keeps the foot level
        let ankle = -(hip + (PI - knee));

        let mut hip_deg = 90.0 - hip.to_degrees();
        let knee_deg = 90.0 + (knee - PI).to_degrees();
        let ankle_deg = 90.0 - ankle.to_degrees();

        if !side.is_left() {
            hip_deg = 180.0 - hip_deg;
        }

        Ok(LegAngles {
            hip: hip_deg,
            knee: knee_deg,
            ankle: ankle_deg,
        })
    }

    /// Servo angles -> foot position `(x, y, 0)` relative to the hip.
    /// Exact inverse of [`Self::inverse_kinematics`] for the same side.
    pub fn forward_kinematics(&self, angles: LegAngles, side: Side) -> Point3 {
        let (_, foot) = self.leg_chain(angles, side);
        [foot[0], foot[1], 0.0]
    }

    /// Knee and foot positions in the leg plane, relative to the hip
    fn leg_chain(&self, angles: LegAngles, side: Side) -> ([f64; 2], [f64; 2]) {
        let LegGeometry { l1, l2, .. } = self.geometry;
        let hip_deg = match side {
            Side::Left => angles.hip,
            Side::Right => 180.0 - angles.hip,
        };
        let hip = (90.0 - hip_deg).to_radians();
        let knee = (angles.knee - 90.0).to_radians() + PI;

        let knee_pos = [l1 * hip.sin(), -l1 * hip.cos()];
        let shank = hip - knee;
        let foot_pos = [knee_pos[0] + l2 * shank.sin(), knee_pos[1] - l2 * shank.cos()];
        (knee_pos, foot_pos)
    }

    /// Inverse kinematics with the neutral pose as fallback
    pub fn set_leg_position(&self, x: f64, y: f64, side: Side) -> [f64; 3] {
        self.inverse_kinematics(x, y, side)
            .unwrap_or(LegAngles::NEUTRAL)
            .as_array()
    }

    /// Slightly crouched standing pose, in wire order
    /// `[L hip, R hip, L knee, R knee, L ankle, R ankle]`, clamped to the servo range.
    /// Falls back to all-neutral when the geometry cannot reach the stance height.
    pub fn get_standing_pose(&self, servo: &ServoConfig) -> [f64; NUM_SERVOS] {
        let LegGeometry { l1, l2, .. } = self.geometry;
        let leg_height = -(l1 + l2 - 20.0);

        let left = self.inverse_kinematics(0.0, leg_height, Side::Left);
        let right = self.inverse_kinematics(0.0, leg_height, Side::Right);

        match (left, right) {
            (Ok(l), Ok(r)) => {
                [l.hip, r.hip, l.knee, r.knee, l.ankle, r.ankle].map(|a| servo.clamp(a))
            }
            _ => [servo.default_angle; NUM_SERVOS],
        }
    }

    /// Joint positions for all six servos (wire order), for the rendering layer
    pub fn calculate_joint_positions(&self, servo_angles: &[f64; NUM_SERVOS]) -> JointPositions {
        let offset = self.geometry.hip_offset;
        let left = LegAngles {
            hip: servo_angles[0],
            knee: servo_angles[2],
            ankle: servo_angles[4],
        };
        let right = LegAngles {
            hip: servo_angles[1],
            knee: servo_angles[3],
            ankle: servo_angles[5],
        };

        let (lk, lf) = self.leg_chain(left, Side::Left);
        let (rk, rf) = self.leg_chain(right, Side::Right);

        JointPositions {
            body: [0.0, 0.0, 0.0],
            left_hip: [-offset, 0.0, 0.0],
            right_hip: [offset, 0.0, 0.0],
            left_knee: [lk[0] - offset, 0.0, lk[1]],
            right_knee: [rk[0] + offset, 0.0, rk[1]],
            left_foot: [lf[0] - offset, 0.0, lf[1]],
            right_foot: [rf[0] + offset, 0.0, rf[1]],
        }
    }
}

impl Default for LegKinematics {
    fn default() -> Self {
        Self::new(LegGeometry::default())
    }
}
