//! Configuration management for CyMapper

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::resize::ResizeOptions;

/// Pixel format requested from the camera first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Prefer MJPEG (lower bandwidth, higher frame rates)
    #[default]
    Mjpeg,
    /// Prefer YUYV (uncompressed)
    Yuyv,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub format: CaptureFormat,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            format: CaptureFormat::default(),
        }
    }
}

/// Transport used to reach the LED controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    #[default]
    Serial,
    Udp,
}

/// LED controller link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub kind: LinkKind,
    /// Serial device (e.g. /dev/ttyACM0)
    pub port: String,
    pub baud: u32,
    /// UDP destination (host:port)
    pub address: String,
    /// Channel values sent in the handshake frame
    #[serde(default = "default_handshake")]
    pub handshake: [u16; 8],
}

fn default_handshake() -> [u16; 8] {
    [150, 150, 720, 150, 150, 0, 0, 0]
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::default(),
            port: "/dev/ttyACM0".to_string(),
            baud: 256_000,
            address: "192.168.0.113:1331".to_string(),
            handshake: default_handshake(),
        }
    }
}

/// Scan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// LEDs per strip
    pub leds: usize,
    /// Number of pins (strips) with LEDs connected
    pub pins: usize,
    /// LED brightness (1-255)
    pub brightness: u8,
    /// Blur kernel size, coerced odd and at least 1
    pub radius: i64,
    /// Milliseconds spent on each LED
    pub delay_ms: u64,
    /// First pin to scan (1-based)
    pub start_pin: usize,
    /// Empty frames tolerated per LED before giving up
    #[serde(default = "default_capture_retries")]
    pub capture_retries: u32,
    pub output: PathBuf,
}

fn default_capture_retries() -> u32 {
    5
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            leds: 460,
            pins: 8,
            brightness: 64,
            radius: 7,
            delay_ms: 1000,
            start_pin: 1,
            capture_retries: default_capture_retries(),
            output: PathBuf::from("output.tsv"),
        }
    }
}

/// Resize settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeSettings {
    #[serde(flatten)]
    pub options: ResizeOptions,
    pub output: PathBuf,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            options: ResizeOptions::default(),
            output: PathBuf::from("remapped.tsv"),
        }
    }
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub resize: ResizeSettings,
}

impl Config {
    /// Read `path`, writing the defaults there first when it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read config {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {:?}", path))?;
            tracing::info!("Using configuration {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Wrote default configuration to {:?}", path);
            Ok(config)
        }
    }

    /// Write the configuration as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Cannot write config {:?}", path))?;

        tracing::debug!("Saved configuration to {:?}", path);
        Ok(())
    }
}
