//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-live/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LiveConfigFile {
    /// Realtime session configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Microphone capture configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Camera capture configuration
    #[serde(default)]
    pub camera: CameraFileConfig,

    /// Voice swap configuration
    #[serde(default)]
    pub swap: SwapFileConfig,
}

/// Realtime session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Backend relay endpoint issuing session tickets
    pub relay_url: Option<String>,

    /// Realtime service websocket endpoint
    pub realtime_url: Option<String>,

    /// Model identifier (e.g. "gpt-4o-realtime-preview")
    pub model: Option<String>,

    /// System instructions sent with each session
    pub instructions: Option<String>,

    /// Initial voice identity (e.g. "alloy")
    pub voice: Option<String>,

    /// Limit on ticket issuance plus channel setup, in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Microphone capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub block_size: Option<usize>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub auto_gain: Option<bool>,
    pub amplitude_interval_ms: Option<u64>,
}

/// Camera capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CameraFileConfig {
    /// Sampling rate in frames per second
    pub sample_rate_hz: Option<f64>,
    /// Longer edge of transmitted frames, in pixels
    pub max_dimension: Option<u32>,
    /// JPEG quality (1-100)
    pub jpeg_quality: Option<u8>,
    /// Relative encoded-size change below which a frame counts as unchanged
    pub change_threshold: Option<f64>,
    pub settle_delay_ms: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Voice swap configuration
#[derive(Debug, Default, Deserialize)]
pub struct SwapFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub introduction_timeout_ms: Option<u64>,
    pub introduction_prompt: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LiveConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LiveConfigFile {
    let Some(path) = config_file_path() else {
        return LiveConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
///
/// Returns `LiveConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> LiveConfigFile {
    if !path.exists() {
        return LiveConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LiveConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LiveConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-live/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-live")
            .join("config.toml")
    })
}
