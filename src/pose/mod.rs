//! Pose model
//!
//! Bone rotations, facial blend shapes and the virtual camera, shared between
//! the protocol listeners that write them and the viewers that read them.

pub mod model;
pub mod types;

pub use model::{PoseModel, PoseSnapshot};
pub use types::{Bone, Camera, Quaternion, Vector3};
