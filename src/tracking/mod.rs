//! Tracking module
//!
//! Capture protocols that feed a receiver's pose model:
//! - FaceMotion3D text framing over TCP
//! - VMC/OSC over UDP (VSeeFace, iFacialMocap, etc.)

pub mod facemotion3d;
pub mod vmc;
