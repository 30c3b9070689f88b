//! Configuration management for the live voice pipeline
//!
//! Values resolve env > TOML file > defaults.

pub mod file;

use std::time::Duration;

use crate::capture::{AudioCaptureConfig, CameraCaptureConfig};
use crate::realtime::{RetryPolicy, SessionConfig};
use crate::swap::SwapConfig;
use crate::{Error, Result, Voice};

use file::LiveConfigFile;

/// Complete pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Realtime session parameters
    pub session: SessionConfig,

    /// Microphone capture parameters
    pub audio: AudioCaptureConfig,

    /// Camera capture parameters
    pub camera: CameraCaptureConfig,

    /// Voice swap parameters
    pub swap: SwapConfig,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup over defaults
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn resolve(fc: LiveConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        // Session (env > toml > default)
        let voice = match env("BEACON_LIVE_VOICE").or(fc.session.voice) {
            Some(name) => name.parse::<Voice>()?,
            None => defaults.session.voice,
        };
        let session = SessionConfig {
            relay_url: env("BEACON_LIVE_RELAY_URL")
                .or(fc.session.relay_url)
                .unwrap_or(defaults.session.relay_url),
            realtime_url: env("BEACON_LIVE_REALTIME_URL")
                .or(fc.session.realtime_url)
                .unwrap_or(defaults.session.realtime_url),
            model: env("BEACON_LIVE_MODEL")
                .or(fc.session.model)
                .unwrap_or(defaults.session.model),
            instructions: env("BEACON_LIVE_INSTRUCTIONS")
                .or(fc.session.instructions)
                .unwrap_or(defaults.session.instructions),
            voice,
            connect_timeout: fc
                .session
                .connect_timeout_ms
                .map_or(defaults.session.connect_timeout, Duration::from_millis),
        };

        // Audio (toml > default)
        let a = fc.audio;
        let audio = AudioCaptureConfig {
            sample_rate: a.sample_rate.unwrap_or(defaults.audio.sample_rate),
            block_size: a.block_size.unwrap_or(defaults.audio.block_size),
            echo_cancellation: a
                .echo_cancellation
                .unwrap_or(defaults.audio.echo_cancellation),
            noise_suppression: a
                .noise_suppression
                .unwrap_or(defaults.audio.noise_suppression),
            auto_gain: a.auto_gain.unwrap_or(defaults.audio.auto_gain),
            amplitude_interval: a
                .amplitude_interval_ms
                .map_or(defaults.audio.amplitude_interval, Duration::from_millis),
        };

        // Camera (toml > default)
        let c = fc.camera;
        let sample_interval = match c.sample_rate_hz {
            Some(hz) if hz > 0.0 && hz.is_finite() => Duration::from_secs_f64(1.0 / hz),
            Some(hz) => {
                return Err(Error::Config(format!(
                    "camera.sample_rate_hz must be positive, got {hz}"
                )));
            }
            None => defaults.camera.sample_interval,
        };
        let camera = CameraCaptureConfig {
            width: c.width.unwrap_or(defaults.camera.width),
            height: c.height.unwrap_or(defaults.camera.height),
            sample_interval,
            max_dimension: c.max_dimension.unwrap_or(defaults.camera.max_dimension),
            jpeg_quality: c.jpeg_quality.unwrap_or(defaults.camera.jpeg_quality),
            change_threshold: c
                .change_threshold
                .unwrap_or(defaults.camera.change_threshold),
            settle_delay: c
                .settle_delay_ms
                .map_or(defaults.camera.settle_delay, Duration::from_millis),
        };

        // Swap (toml > default)
        let s = fc.swap;
        let swap = SwapConfig {
            retry: RetryPolicy {
                max_attempts: s.max_attempts.unwrap_or(defaults.swap.retry.max_attempts),
                base_delay: s
                    .base_delay_ms
                    .map_or(defaults.swap.retry.base_delay, Duration::from_millis),
                max_delay: s
                    .max_delay_ms
                    .map_or(defaults.swap.retry.max_delay, Duration::from_millis),
            },
            ready_timeout: s
                .ready_timeout_ms
                .map_or(defaults.swap.ready_timeout, Duration::from_millis),
            introduction_timeout: s
                .introduction_timeout_ms
                .map_or(defaults.swap.introduction_timeout, Duration::from_millis),
            introduction_prompt: s
                .introduction_prompt
                .unwrap_or(defaults.swap.introduction_prompt),
        };

        let config = Self {
            session,
            audio,
            camera,
            swap,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the engines rely on
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be non-zero".to_string()));
        }
        if self.audio.block_size == 0 {
            return Err(Error::Config("audio.block_size must be non-zero".to_string()));
        }
        if self.camera.max_dimension == 0 {
            return Err(Error::Config("camera.max_dimension must be non-zero".to_string()));
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(Error::Config(format!(
                "camera.jpeg_quality must be 1-100, got {}",
                self.camera.jpeg_quality
            )));
        }
        if !(0.0..1.0).contains(&self.camera.change_threshold) {
            return Err(Error::Config(format!(
                "camera.change_threshold must be in [0, 1), got {}",
                self.camera.change_threshold
            )));
        }
        if self.session.connect_timeout.is_zero() {
            return Err(Error::Config("session.connect_timeout_ms must be non-zero".to_string()));
        }
        if self.swap.retry.max_attempts == 0 {
            return Err(Error::Config("swap.max_attempts must be at least 1".to_string()));
        }
        url::Url::parse(&self.session.realtime_url)
            .map_err(|e| Error::Config(format!("session.realtime_url: {e}")))?;
        url::Url::parse(&self.session.relay_url)
            .map_err(|e| Error::Config(format!("session.relay_url: {e}")))?;
        Ok(())
    }
}
