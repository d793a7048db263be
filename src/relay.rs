//! Relay orchestrator
//!
//! Holds every configured motion receiver, the pointer to the active one, and
//! the camera broadcast pool. Viewer transports read pose state through the
//! relay so that switching the active receiver redirects every viewer at once.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::pool::BroadcastPool;
use crate::pose::{Camera, PoseSnapshot};
use crate::receiver::{MotionReceiver, MotionSource};
use crate::scene::Scene;
use crate::tracking::{facemotion3d::FaceMotion3d, vmc::Vmc};

/// Shared relay state
pub struct Relay {
    receivers: BTreeMap<String, Arc<MotionReceiver>>,
    active: RwLock<Arc<MotionReceiver>>,
    camera_pool: Arc<BroadcastPool<Camera>>,
    push_interval: Duration,
}

impl Relay {
    /// Build a relay over `receivers` with `default_active` selected. Every
    /// receiver's camera starts at the saved scene's camera.
    pub fn new(
        receivers: Vec<MotionReceiver>,
        default_active: &str,
        scene: Scene,
        update_frequency: u32,
    ) -> Result<Self> {
        let receivers: BTreeMap<String, Arc<MotionReceiver>> = receivers
            .into_iter()
            .map(|r| (r.name().to_string(), Arc::new(r)))
            .collect();

        let active = receivers
            .get(default_active)
            .cloned()
            .ok_or_else(|| RelayError::UnknownReceiver(default_active.to_string()))?;

        for receiver in receivers.values() {
            receiver.pose().write_camera(scene.camera);
        }

        tracing::info!("The active receiver is {}", active.name());

        Ok(Self {
            receivers,
            active: RwLock::new(active),
            camera_pool: BroadcastPool::new("camera"),
            push_interval: push_interval(update_frequency),
        })
    }

    /// Build the enabled receivers from configuration
    pub fn from_config(config: &Config, scene: Scene) -> Result<Arc<Self>> {
        let mut sources: Vec<Arc<dyn MotionSource>> = Vec::new();
        if config.vmc.enabled {
            sources.push(Arc::new(Vmc::new(&config.vmc)));
        }
        if config.facemotion3d.enabled {
            sources.push(Arc::new(FaceMotion3d::new(&config.facemotion3d)));
        }

        let receivers = sources.into_iter().map(MotionReceiver::from_arc).collect();
        let relay = Self::new(
            receivers,
            &config.relay.default_receiver,
            scene,
            config.relay.update_frequency,
        )?;

        Ok(Arc::new(relay))
    }

    /// Repoint the active receiver. Unknown names are rejected and leave the
    /// current receiver active.
    pub fn switch_active(&self, name: &str) -> Result<()> {
        let receiver = match self.receivers.get(name) {
            Some(r) => Arc::clone(r),
            None => {
                tracing::warn!("\"{}\" does not exist, keeping {}", name, self.active_name());
                return Err(RelayError::UnknownReceiver(name.to_string()));
            }
        };

        *self.active.write() = receiver;
        tracing::info!("Successfully changed the active receiver to {}", name);

        // Camera viewers follow the new receiver's viewpoint
        self.broadcast_camera();
        Ok(())
    }

    /// The currently active receiver
    pub fn active(&self) -> Arc<MotionReceiver> {
        Arc::clone(&self.active.read())
    }

    pub fn active_name(&self) -> String {
        self.active.read().name().to_string()
    }

    pub fn receiver(&self, name: &str) -> Option<Arc<MotionReceiver>> {
        self.receivers.get(name).cloned()
    }

    pub fn receiver_names(&self) -> Vec<String> {
        self.receivers.keys().cloned().collect()
    }

    /// All receivers, ordered by name
    pub fn receivers(&self) -> impl Iterator<Item = &Arc<MotionReceiver>> {
        self.receivers.values()
    }

    /// Start every receiver's listener. Inactive receivers keep listening so
    /// a switch takes effect immediately.
    pub fn start_all(&self) {
        for receiver in self.receivers.values() {
            receiver.start();
        }
    }

    /// Stop every receiver's listener
    pub async fn stop_all(&self) {
        for receiver in self.receivers.values() {
            receiver.stop().await;
        }
    }

    /// Pool of camera viewers
    pub fn camera_pool(&self) -> &Arc<BroadcastPool<Camera>> {
        &self.camera_pool
    }

    /// Camera of the active receiver's pose model
    pub fn camera(&self) -> Camera {
        self.active().pose().camera()
    }

    /// Store a viewer-sent camera and relay it to every camera viewer
    pub fn set_camera(&self, camera: Camera) {
        let active = self.active();
        active.pose().write_camera(camera);
        self.camera_pool.update(&active.pose().camera());
    }

    /// Push the current camera to every camera viewer
    pub fn broadcast_camera(&self) {
        self.camera_pool.update(&self.camera());
    }

    /// Snapshot of the active receiver's pose
    pub fn pose_snapshot(&self) -> PoseSnapshot {
        self.active().pose().snapshot()
    }

    /// Delay between pose pushes to each viewer
    pub fn push_interval(&self) -> Duration {
        self.push_interval
    }

    /// Current scene, for persisting
    pub fn scene(&self) -> Scene {
        Scene {
            camera: self.camera(),
        }
    }
}

fn push_interval(update_frequency: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(update_frequency.max(1)))
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("receivers", &self.receivers.keys().collect::<Vec<_>>())
            .field("active", &self.active_name())
            .field("camera_pool", &self.camera_pool)
            .field("push_interval", &self.push_interval)
            .finish()
    }
}
