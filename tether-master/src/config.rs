//! Configuration for the master service.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Synthetic stream settings.
    pub stream: StreamConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port viewers connect to.
    pub port: u16,
    /// Framing mode: "raw" or "websocket".
    pub mode: String,
}

/// Synthetic stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Advertised screen width in pixels.
    pub width: u32,
    /// Advertised screen height in pixels.
    pub height: u32,
    /// Frames pushed per second.
    pub fps: u8,
    /// Bytes per synthetic frame.
    pub frame_bytes: usize,
    /// Frames between keyframes.
    pub keyframe_interval: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            stream: StreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 8887,
            mode: "websocket".into(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 2340,
            fps: 25,
            frame_bytes: 32 * 1024,
            keyframe_interval: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl MasterConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let cfg = Self::default();
        let text = toml::to_string_pretty(&cfg).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
