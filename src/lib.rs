//! mocap-relay - Motion capture ingestion and live pose relay
//!
//! A Rust service that:
//! - Receives face and body tracking from capture devices (VMC/OSC,
//!   FaceMotion3D) into per-receiver pose models
//! - Relays the active receiver's pose to web viewers over WebSocket
//! - Shares the viewer camera between every connected viewer

pub mod config;
pub mod error;
pub mod pool;
pub mod pose;
pub mod receiver;
pub mod relay;
pub mod scene;
pub mod tracking;
pub mod web;

pub use config::Config;
pub use error::{RelayError, Result};
pub use relay::Relay;

use std::sync::Arc;
use tokio::sync::broadcast;

/// Application state shared with every HTTP handler
#[derive(Debug)]
pub struct AppState {
    /// Configuration the service was started with
    pub config: Config,
    /// Receivers, active pointer and camera pool
    pub relay: Arc<Relay>,
    /// Shutdown signal
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config, relay: Arc<Relay>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            relay,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
