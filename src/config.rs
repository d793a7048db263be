//! Configuration parsing and management for mocap-relay

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, RelayError};
use crate::tracking::facemotion3d::{DEFAULT_DEVICE_PORT, READ_CHUNK};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub relay: RelayConfig,
    pub files: FilesConfig,
    pub vmc: VmcConfig,
    pub facemotion3d: FaceMotion3dConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::ReadFile(format!("{}: {}", path.as_ref().display(), e))
        })?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, RelayError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }

    /// Load configuration from default paths
    pub fn load() -> Result<Self, RelayError> {
        let paths = [
            PathBuf::from("config.toml"),
            PathBuf::from("config/default.toml"),
        ];

        for path in &paths {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Names of the receivers enabled in this configuration
    pub fn enabled_receivers(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.vmc.enabled {
            names.push("vmc");
        }
        if self.facemotion3d.enabled {
            names.push("facemotion3d");
        }
        names
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.http.port == 0 {
            return Err(invalid("http.port", "Port must be greater than 0"));
        }

        if self.relay.update_frequency == 0 {
            return Err(invalid(
                "relay.update_frequency",
                "Update frequency must be greater than 0",
            ));
        }

        let enabled = self.enabled_receivers();
        if enabled.is_empty() {
            return Err(invalid("receivers", "At least one receiver must be enabled"));
        }

        if !enabled.contains(&self.relay.default_receiver.as_str()) {
            return Err(invalid(
                "relay.default_receiver",
                &format!(
                    "\"{}\" is not an enabled receiver (enabled: {})",
                    self.relay.default_receiver,
                    enabled.join(", ")
                ),
            ));
        }

        if self.vmc.retry_delay_ms == 0 {
            return Err(invalid("vmc.retry_delay_ms", "Retry delay must be greater than 0"));
        }

        if self.facemotion3d.retry_delay_ms == 0 {
            return Err(invalid(
                "facemotion3d.retry_delay_ms",
                "Retry delay must be greater than 0",
            ));
        }

        if self.facemotion3d.max_buffer_bytes < READ_CHUNK {
            return Err(invalid(
                "facemotion3d.max_buffer_bytes",
                &format!("Buffer limit must be at least {} bytes", READ_CHUNK),
            ));
        }

        if self.facemotion3d.enabled && self.facemotion3d.device_addr.trim().is_empty() {
            return Err(invalid(
                "facemotion3d.device_addr",
                "Device address is required when FaceMotion3D is enabled",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> RelayError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allow any origin, method and header
    pub cors_enabled: bool,
    /// Directory with the web frontend, served for every unmatched path
    pub frontend_dir: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3579,
            cors_enabled: true,
            frontend_dir: None,
        }
    }
}

/// Relay behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Pose snapshots pushed to each viewer per second
    pub update_frequency: u32,
    /// Receiver active at startup
    pub default_receiver: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            update_frequency: 60,
            default_receiver: "vmc".to_string(),
        }
    }
}

/// Files the relay reads and writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// VRM model served to viewers
    pub vrm_path: PathBuf,
    /// Scene (camera) file
    pub scene_path: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            vrm_path: PathBuf::from("default.vrm"),
            scene_path: PathBuf::from("scene.json"),
        }
    }
}

/// VMC receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmcConfig {
    /// Enable the VMC receiver
    pub enabled: bool,
    /// UDP address to listen on
    pub listen_addr: String,
    /// Delay before rebinding after a socket error
    pub retry_delay_ms: u64,
}

impl Default for VmcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:39540".to_string(),
            retry_delay_ms: 3000,
        }
    }
}

/// FaceMotion3D receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceMotion3dConfig {
    /// Enable the FaceMotion3D receiver
    pub enabled: bool,
    /// TCP address the device streams to
    pub listen_addr: String,
    /// IP address of the device running FaceMotion3D
    pub device_addr: String,
    /// UDP port the device listens on for commands
    pub device_port: u16,
    /// Pause between the stop and start commands
    pub handshake_delay_ms: u64,
    /// Delay before redoing the handshake after a failure
    pub retry_delay_ms: u64,
    /// Drop the connection when this many bytes arrive without a frame
    pub max_buffer_bytes: usize,
}

impl Default for FaceMotion3dConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:49986".to_string(),
            device_addr: "192.168.1.2".to_string(),
            device_port: DEFAULT_DEVICE_PORT,
            handshake_delay_ms: 500,
            retry_delay_ms: 3000,
            max_buffer_bytes: 256 * 1024,
        }
    }
}
