//! Configuration for the viewer.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Where the master lives.
    pub network: NetworkConfig,
    /// Reconnect behaviour.
    pub retry: RetryConfig,
    /// Local viewport advertised to the master.
    pub viewport: ViewportConfig,
    /// Keep-alive behaviour.
    pub keepalive: KeepaliveConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Master host name or address.
    pub host: String,
    /// Master port.
    pub port: u16,
    /// Framing mode: "raw" or "websocket".
    pub mode: String,
    /// Request path in websocket mode.
    pub path: String,
}

/// Reconnect behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Transport attempts per reconnect cycle.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub delay_ms: u64,
    /// Double the delay on every further attempt.
    pub exponential: bool,
}

/// Local viewport advertised to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

/// Keep-alive behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between pings; 0 disables them.
    pub interval_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            retry: RetryConfig::default(),
            viewport: ViewportConfig::default(),
            keepalive: KeepaliveConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8887,
            mode: "websocket".into(),
            path: "/tether".into(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2000,
            exponential: false,
        }
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 2340,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
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

impl ViewerConfig {
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
