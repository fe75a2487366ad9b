//! Joint-angle extraction from sensor pairs.
//!
//! The ordering discipline is an invariant, not a heuristic: the
//! device-id encoding says which sensor is proximal (thigh, low nibble
//! 2) and which is distal (shin, low nibble 1), and a pair that does
//! not contain exactly one of each fails the computation. Sorting a
//! swapped pair silently would produce plausible but wrong angles,
//! which is the worst possible failure mode for a clinical signal.

use flexrig_types::{Axis, DeviceId, Quaternion};

use crate::config::Calibration;
use crate::error::{Error, Result};

/// A computed relative rotation and its extracted angle.
#[derive(Debug, Clone, PartialEq)]
pub struct JointAngle {
    /// Angle in degrees after calibration, in `(-180, 180]`.
    pub angle_deg: f64,
    /// The relative rotation the angle came from.
    pub relative: Quaternion,
    /// Proximal then distal sensor.
    pub devices: [DeviceId; 2],
}

/// Extract a joint angle from exactly two sensor orientations.
///
/// The relative rotation is `conj(q_proximal) * q_distal`; the angle is
/// the rotation about the requested axis read from its rotation matrix,
/// then calibrated as `(angle + offset) * multiplier` and wrapped back
/// into `(-180, 180]`.
pub fn compute_joint_angle(
    a: (DeviceId, Quaternion),
    b: (DeviceId, Quaternion),
    axis: Axis,
    calibration: Calibration,
) -> Result<JointAngle> {
    let (proximal, distal) = order_pair(a, b)?;

    let q_rel = proximal.1.conjugate().mul(&distal.1).normalize();
    let m = q_rel.to_rotation_matrix();

    let radians = match axis {
        Axis::Y => m[2].atan2(m[0]),
        Axis::X => m[7].atan2(m[8]),
        Axis::Z => m[3].atan2(m[4]),
    };

    let raw_deg = radians.to_degrees();
    let angle_deg = wrap_degrees((raw_deg + calibration.offset) * calibration.multiplier);

    Ok(JointAngle {
        angle_deg,
        relative: q_rel,
        devices: [proximal.0, distal.0],
    })
}

fn order_pair(
    a: (DeviceId, Quaternion),
    b: (DeviceId, Quaternion),
) -> Result<((DeviceId, Quaternion), (DeviceId, Quaternion))> {
    match (a.0.is_proximal(), b.0.is_proximal()) {
        (true, false) if b.0.is_distal() => Ok((a, b)),
        (false, true) if a.0.is_distal() => Ok((b, a)),
        _ => Err(Error::InvalidSensorPair(format!(
            "{} and {} are not a proximal/distal pair",
            a.0, b.0
        ))),
    }
}

/// Wrap an angle into `(-180, 180]`.
fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation_y(degrees: f64) -> Quaternion {
        Quaternion::from_axis_angle([0.0, 1.0, 0.0], degrees.to_radians())
    }

    fn no_calibration() -> Calibration {
        Calibration::default()
    }

    #[test]
    fn test_identical_orientations_give_zero() {
        let q = Quaternion::new(0.8, 0.2, 0.5, 0.1).normalize();
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, q),
            (DeviceId::LeftShin, q),
            Axis::Y,
            no_calibration(),
        )
        .unwrap();
        assert!(result.angle_deg.abs() < 1e-6);
    }

    #[test]
    fn test_rest_pose_zero_degrees() {
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, Quaternion::IDENTITY),
            Axis::Y,
            no_calibration(),
        )
        .unwrap();
        assert!(result.angle_deg.abs() < 1e-9);
        assert_eq!(result.devices, [DeviceId::LeftThigh, DeviceId::LeftShin]);
    }

    #[test]
    fn test_quarter_turn_about_y() {
        let result = compute_joint_angle(
            (DeviceId::RightThigh, Quaternion::IDENTITY),
            (DeviceId::RightShin, rotation_y(90.0)),
            Axis::Y,
            no_calibration(),
        )
        .unwrap();
        assert!((result.angle_deg.abs() - 90.0).abs() < 0.1);
    }

    #[test]
    fn test_flexion_sweep_is_signed() {
        for target in [-120.0, -45.0, 10.0, 90.0, 150.0] {
            let result = compute_joint_angle(
                (DeviceId::LeftThigh, Quaternion::IDENTITY),
                (DeviceId::LeftShin, rotation_y(target)),
                Axis::Y,
                no_calibration(),
            )
            .unwrap();
            assert!(
                (result.angle_deg - target).abs() < 0.01,
                "target {target} got {}",
                result.angle_deg
            );
        }
    }

    #[test]
    fn test_axis_selectors() {
        let x_rot = Quaternion::from_axis_angle([1.0, 0.0, 0.0], 30f64.to_radians());
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, x_rot),
            Axis::X,
            no_calibration(),
        )
        .unwrap();
        assert!((result.angle_deg - 30.0).abs() < 0.01);

        let z_rot = Quaternion::from_axis_angle([0.0, 0.0, 1.0], -60f64.to_radians());
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, z_rot),
            Axis::Z,
            no_calibration(),
        )
        .unwrap();
        assert!((result.angle_deg + 60.0).abs() < 0.01);
    }

    #[test]
    fn test_argument_order_does_not_matter() {
        let distal = rotation_y(45.0);
        let forward = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, distal),
            Axis::Y,
            no_calibration(),
        )
        .unwrap();
        let swapped = compute_joint_angle(
            (DeviceId::LeftShin, distal),
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            Axis::Y,
            no_calibration(),
        )
        .unwrap();
        assert!((forward.angle_deg - swapped.angle_deg).abs() < 1e-9);
        assert_eq!(forward.devices, swapped.devices);
    }

    #[test]
    fn test_invalid_pairs_rejected() {
        // Two proximal sensors.
        let err = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::RightThigh, Quaternion::IDENTITY),
            Axis::Y,
            no_calibration(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSensorPair(_)));

        // Two distal sensors.
        let err = compute_joint_angle(
            (DeviceId::LeftShin, Quaternion::IDENTITY),
            (DeviceId::RightShin, Quaternion::IDENTITY),
            Axis::Y,
            no_calibration(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSensorPair(_)));
    }

    #[test]
    fn test_calibration_applied() {
        let calibration = Calibration {
            offset: 10.0,
            multiplier: 2.0,
        };
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, rotation_y(30.0)),
            Axis::Y,
            calibration,
        )
        .unwrap();
        // (30 + 10) * 2 = 80.
        assert!((result.angle_deg - 80.0).abs() < 0.01);
    }

    #[test]
    fn test_calibrated_angle_stays_in_range() {
        let calibration = Calibration {
            offset: 180.0,
            multiplier: 1.5,
        };
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, rotation_y(100.0)),
            Axis::Y,
            calibration,
        )
        .unwrap();
        assert!(result.angle_deg > -180.0 && result.angle_deg <= 180.0);
        assert!(result.angle_deg.is_finite());
    }

    #[test]
    fn test_relative_quaternion_is_unit() {
        let result = compute_joint_angle(
            (DeviceId::LeftThigh, Quaternion::new(0.9, 0.1, 0.4, 0.2).normalize()),
            (DeviceId::LeftShin, Quaternion::new(0.3, 0.7, 0.2, 0.6).normalize()),
            Axis::Y,
            no_calibration(),
        )
        .unwrap();
        assert!(result.relative.is_unit(1e-5));
    }
}
