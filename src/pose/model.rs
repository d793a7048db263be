//! Concurrently accessed pose state
//!
//! Each logical field (bones, blend shapes, camera) sits behind its own lock,
//! so a listener writing bones never waits on a viewer reading the camera.
//! Locks are held only for the in-memory update and never across an await.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{Bone, Camera, Quaternion};

/// Fully materialised pose, as pushed to viewers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseSnapshot {
    /// Bone name to transform; absent bones are at identity
    pub bones: HashMap<String, Bone>,
    /// Blend shape name to weight in [0, 1]
    pub blend_shapes: HashMap<String, f64>,
}

/// Pose state fed by one motion receiver
#[derive(Debug, Default)]
pub struct PoseModel {
    bones: RwLock<HashMap<String, Bone>>,
    blend_shapes: RwLock<HashMap<String, f64>>,
    camera: RwLock<Camera>,
}

impl PoseModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a bone's rotation. The rotation is normalised before storing.
    pub fn write_bone(&self, name: &str, rotation: Quaternion) {
        let bone = Bone {
            rotation: rotation.normalized(),
        };
        let mut bones = self.bones.write();
        match bones.get_mut(name) {
            Some(existing) => *existing = bone,
            None => {
                bones.insert(name.to_string(), bone);
            }
        }
    }

    /// Set a blend shape weight, clamped into [0, 1]. NaN is ignored.
    pub fn write_blend_shape(&self, name: &str, weight: f64) {
        if weight.is_nan() {
            tracing::trace!("Ignoring NaN weight for blend shape {}", name);
            return;
        }
        let weight = weight.clamp(0.0, 1.0);
        let mut shapes = self.blend_shapes.write();
        match shapes.get_mut(name) {
            Some(existing) => *existing = weight,
            None => {
                shapes.insert(name.to_string(), weight);
            }
        }
    }

    /// Replace the camera viewpoint
    pub fn write_camera(&self, camera: Camera) {
        let camera = Camera {
            position: camera.position,
            rotation: camera.rotation.normalized(),
        };
        *self.camera.write() = camera;
    }

    /// Current rotation for a bone, identity if it was never written
    pub fn bone(&self, name: &str) -> Quaternion {
        self.bones
            .read()
            .get(name)
            .map(|b| b.rotation)
            .unwrap_or(Quaternion::IDENTITY)
    }

    /// Current weight for a blend shape, if it was ever written
    pub fn blend_shape(&self, name: &str) -> Option<f64> {
        self.blend_shapes.read().get(name).copied()
    }

    /// Current camera viewpoint
    pub fn camera(&self) -> Camera {
        *self.camera.read()
    }

    /// Copy the bones and blend shapes out of the model.
    ///
    /// Each field is copied under its own lock: a single bone or blend shape
    /// is never torn, but a bone and a blend shape written back to back may
    /// land in different snapshots.
    pub fn snapshot(&self) -> PoseSnapshot {
        let bones = self.bones.read().clone();
        let blend_shapes = self.blend_shapes.read().clone();
        PoseSnapshot {
            bones,
            blend_shapes,
        }
    }

    /// Invoke `f` exactly once with a snapshot of the model
    pub fn read_snapshot<R>(&self, f: impl FnOnce(&PoseSnapshot) -> R) -> R {
        let snapshot = self.snapshot();
        f(&snapshot)
    }

    /// Number of bones that have been written
    pub fn bone_count(&self) -> usize {
        self.bones.read().len()
    }

    /// Number of blend shapes that have been written
    pub fn blend_shape_count(&self) -> usize {
        self.blend_shapes.read().len()
    }
}
