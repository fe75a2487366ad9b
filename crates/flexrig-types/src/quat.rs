//! Unit-quaternion math for the orientation pipeline.
//!
//! Everything downstream of packet decoding assumes unit quaternions;
//! [`Quaternion::normalize`] is applied at the pipeline boundary and
//! after every interpolation so the invariant holds within 1e-5.

use serde::{Deserialize, Serialize};

/// Above this dot product the arc between two quaternions is so small
/// that normalized linear interpolation is numerically safer than SLERP.
pub const SLERP_LINEAR_THRESHOLD: f64 = 0.9995;

/// An orientation quaternion `{w, x, y, z}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    /// Scalar component.
    pub w: f64,
    /// First vector component.
    pub x: f64,
    /// Second vector component.
    pub y: f64,
    /// Third vector component.
    pub z: f64,
}

impl Quaternion {
    /// The identity rotation.
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Create a quaternion from components.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Build the rotation of `angle_rad` radians about a unit axis.
    pub fn from_axis_angle(axis: [f64; 3], angle_rad: f64) -> Self {
        let half = angle_rad / 2.0;
        let s = half.sin();
        Self {
            w: half.cos(),
            x: axis[0] * s,
            y: axis[1] * s,
            z: axis[2] * s,
        }
    }

    /// Euclidean norm of the four components.
    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Return the unit quaternion with the same orientation.
    ///
    /// A degenerate (near-zero) quaternion normalizes to the identity so
    /// a corrupt packet cannot propagate NaNs through the pipeline.
    pub fn normalize(&self) -> Self {
        let n = self.norm();
        if n < 1e-12 {
            return Self::IDENTITY;
        }
        Self {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    /// Dot product with another quaternion.
    pub fn dot(&self, other: &Quaternion) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Conjugate; equals the inverse for unit quaternions.
    pub fn conjugate(&self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    /// Hamilton product `self · other`.
    pub fn mul(&self, other: &Quaternion) -> Self {
        Self {
            w: self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            x: self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            y: self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            z: self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        }
    }

    /// Spherical linear interpolation along the shortest arc.
    ///
    /// `t` is clamped to `[0, 1]`. When the two inputs are nearly
    /// parallel (dot above [`SLERP_LINEAR_THRESHOLD`]) the angle is tiny
    /// and normalized LERP is used instead. The result is always
    /// normalized.
    pub fn slerp(&self, other: &Quaternion, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);

        let mut dot = self.dot(other);
        // Shortest-arc correction: q and -q are the same rotation.
        let mut q2 = *other;
        if dot < 0.0 {
            q2 = Quaternion::new(-q2.w, -q2.x, -q2.y, -q2.z);
            dot = -dot;
        }

        if dot > SLERP_LINEAR_THRESHOLD {
            return Quaternion {
                w: self.w + t * (q2.w - self.w),
                x: self.x + t * (q2.x - self.x),
                y: self.y + t * (q2.y - self.y),
                z: self.z + t * (q2.z - self.z),
            }
            .normalize();
        }

        let theta = dot.clamp(-1.0, 1.0).acos();
        let sin_theta = theta.sin();
        let a = ((1.0 - t) * theta).sin() / sin_theta;
        let b = (t * theta).sin() / sin_theta;

        Quaternion {
            w: a * self.w + b * q2.w,
            x: a * self.x + b * q2.x,
            y: a * self.y + b * q2.y,
            z: a * self.z + b * q2.z,
        }
        .normalize()
    }

    /// Convert to a row-major 3x3 rotation matrix.
    ///
    /// Assumes `self` is unit; callers normalize at the pipeline
    /// boundary.
    pub fn to_rotation_matrix(&self) -> [f64; 9] {
        let (w, x, y, z) = (self.w, self.x, self.y, self.z);
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ]
    }

    /// Whether the norm is within `tolerance` of 1.
    pub fn is_unit(&self, tolerance: f64) -> bool {
        (self.norm() - 1.0).abs() <= tolerance
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}
