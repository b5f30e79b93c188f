//! Viewer configuration.

use std::path::Path;
use std::time::Duration;

use rfb_core::{PixelFormat, SessionConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the viewer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub network: NetworkConfig,
    pub session: SessionSettings,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server address, `host`, `host:port` or `[v6]:port`.
    pub server_address: String,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,
}

/// Session negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// VNC password. Empty means none.
    pub password: String,
    /// Leave other clients connected.
    pub shared: bool,
    /// Pixel format to request: "bgra32", "rgb565", "bgr233" or "indexed8".
    pub pixel_format: String,
    /// Encoding ids in preference order. Empty advertises everything.
    pub encodings: Vec<i32>,
    /// Request an incremental update after each completed one.
    pub auto_refresh: bool,
}

/// Snapshot output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Where to write the PPM snapshot. Empty disables it.
    pub snapshot_path: String,
    /// Stop after this many frames; 0 runs until Ctrl-C.
    pub frames: u64,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:5900".into(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            password: String::new(),
            shared: true,
            pixel_format: "bgra32".into(),
            encodings: Vec::new(),
            auto_refresh: true,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "rfb-snapshot.ppm".into(),
            frames: 0,
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

impl ViewerConfig {
    /// Load from a TOML file, falling back to defaults.
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

    /// Write default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Session settings for `rfb-core`.
    ///
    /// An unknown pixel format name falls back to BGRA with a warning.
    pub fn session_config(&self) -> SessionConfig {
        let pixel_format = parse_pixel_format(&self.session.pixel_format).unwrap_or_else(|| {
            tracing::warn!(
                "unknown pixel format {:?}; using bgra32",
                self.session.pixel_format
            );
            PixelFormat::bgra32()
        });
        SessionConfig {
            password: Some(self.session.password.clone()).filter(|p| !p.is_empty()),
            shared: self.session.shared,
            pixel_format,
            encodings: Some(self.session.encodings.clone()).filter(|e| !e.is_empty()),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms),
            auto_refresh: self.session.auto_refresh,
            ..SessionConfig::default()
        }
    }
}

fn parse_pixel_format(name: &str) -> Option<PixelFormat> {
    match name.trim().to_ascii_lowercase().as_str() {
        "bgra32" => Some(PixelFormat::bgra32()),
        "rgb565" => Some(PixelFormat::rgb565()),
        "bgr233" => Some(PixelFormat::bgr233()),
        "indexed8" => Some(PixelFormat::indexed8()),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────
