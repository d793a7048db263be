//! Rotation and transform value types

use glam::DQuat;
use serde::{Deserialize, Serialize};

/// Rotation quaternion (x, y, z, w)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    /// Build a rotation from Euler angles in radians.
    ///
    /// The composition is `Rz(c) * Ry(b) * Rx(a)`: `a` rolls about X, `b`
    /// pitches about Y and `c` yaws about Z.
    pub fn from_euler(a: f64, b: f64, c: f64) -> Self {
        let q = DQuat::from_rotation_z(c) * DQuat::from_rotation_y(b) * DQuat::from_rotation_x(a);
        Self::from(q).normalized()
    }

    /// Euclidean norm
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    /// Unit-length copy. Degenerate input (zero length, NaN, infinity)
    /// collapses to identity.
    pub fn normalized(&self) -> Self {
        let n = self.norm();
        if !n.is_finite() || n <= f64::EPSILON {
            return Self::IDENTITY;
        }
        Self {
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
            w: self.w / n,
        }
    }

    /// Rotation angle in radians, in [0, pi]
    pub fn angle(&self) -> f64 {
        let q = self.normalized();
        2.0 * q.w.abs().min(1.0).acos()
    }
}

impl From<DQuat> for Quaternion {
    fn from(q: DQuat) -> Self {
        Self::new(q.x, q.y, q.z, q.w)
    }
}

/// Position in scene space
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A single bone's transform. Only rotation is relayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub rotation: Quaternion,
}

/// Virtual camera viewpoint, written by viewers rather than by receivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: Vector3,
    pub rotation: Quaternion,
}
