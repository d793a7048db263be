//! Scene file: the viewer camera, persisted as JSON

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SceneError;
use crate::pose::Camera;

/// Persisted scene state
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scene {
    pub camera: Camera,
}

impl Scene {
    /// Read a scene file. A missing file yields the default scene.
    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No scene file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(SceneError::Read {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        serde_json::from_str(&contents).map_err(|e| SceneError::Parse(e.to_string()))
    }

    /// Write the scene as indented JSON
    pub fn save(&self, path: &Path) -> Result<(), SceneError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| SceneError::Parse(e.to_string()))?;

        std::fs::write(path, json).map_err(|e| SceneError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        tracing::info!("Saved scene to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{Quaternion, Vector3};

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let scene = Scene::load(&dir.path().join("scene.json")).unwrap();
        assert_eq!(scene, Scene::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");
        let scene = Scene {
            camera: Camera {
                position: Vector3::new(0.0, 1.3, 1.5),
                rotation: Quaternion::new(0.0, 1.0, 0.0, 0.0),
            },
        };

        scene.save(&path).unwrap();
        assert_eq!(Scene::load(&path).unwrap(), scene);
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");
        std::fs::write(&path, "{ camera: ").unwrap();
        assert!(matches!(Scene::load(&path), Err(SceneError::Parse(_))));
    }
}
