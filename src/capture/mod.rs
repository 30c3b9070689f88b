//! Microphone and camera capture gated on the conversation state
//!
//! Both engines own their device through a source capability ([`AudioSource`],
//! [`VideoSource`]) and hand frames to a shared non-blocking [`FrameSink`]. Each
//! frame is checked against [`StateSnapshot::allows_capture`](crate::StateSnapshot::allows_capture)
//! on a fresh snapshot right before hand-off.

mod audio;
mod camera;
mod cpal_source;
mod host_video;

use async_trait::async_trait;
use image::RgbImage;
use tokio::sync::mpsc;

use crate::{CameraFacing, Result};

pub use audio::{
    AudioCaptureConfig, AudioCaptureEngine, CaptureCounters, rms_level, samples_to_pcm16,
    samples_to_wav,
};
pub use camera::{
    CameraCaptureConfig, CameraCaptureEngine, CameraCounters, ChangeDetector, FrameSampler,
    TickOutcome, downscale, encode_jpeg,
};
pub use cpal_source::CpalAudioSource;
pub use host_video::{AccessDecision, FramePublisher, HostVideoSource, host_camera};

/// Receives mono `f32` samples at the requested rate, on the platform audio thread
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Sending half shared by both capture engines
pub type FrameSink = mpsc::Sender<CaptureFrame>;

/// Microphone acquisition constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    /// Target sample rate in Hz
    pub sample_rate: u32,
    /// Channel count delivered to the callback
    pub channels: u16,
    /// Ask the platform for echo cancellation
    pub echo_cancellation: bool,
    /// Ask the platform for noise suppression
    pub noise_suppression: bool,
    /// Ask the platform for automatic gain control
    pub auto_gain: bool,
}

/// Camera acquisition constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    /// Ideal facing mode
    pub facing: CameraFacing,
    /// Ideal base width in pixels
    pub width: u32,
    /// Ideal base height in pixels
    pub height: u32,
}

/// Platform microphone capability
///
/// `open` may suspend while the platform asks the user for consent. Samples are
/// delivered to the callback until `close`, which must be idempotent.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire the device and start delivering samples
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the user declines, `DeviceUnavailable` if no input exists
    async fn open(&self, constraints: &AudioConstraints, on_samples: SampleCallback)
    -> Result<()>;

    /// Resume a processing context the host suspended while backgrounded
    ///
    /// # Errors
    ///
    /// Returns error if the platform refuses to resume
    fn resume(&self) -> Result<()>;

    /// Stop delivery and release the device
    fn close(&self);
}

/// Platform camera capability
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Acquire the camera with the given constraints
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the user declines, `DeviceUnavailable` if no camera exists
    async fn open(&self, constraints: &VideoConstraints) -> Result<()>;

    /// Current video frame
    ///
    /// # Errors
    ///
    /// Returns error if the camera is closed or has not produced a frame yet
    fn grab(&self) -> Result<RgbImage>;

    /// Stop the stream and release the camera
    fn close(&self);
}

/// Host application visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Application is in the foreground
    #[default]
    Foreground,
    /// Application was sent to the background
    Background,
}

/// Downscaled, compressed camera frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// JPEG bytes
    pub jpeg: Vec<u8>,
    /// Width after downscaling
    pub width: u32,
    /// Height after downscaling
    pub height: u32,
}

/// Frame handed from a capture engine to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFrame {
    /// One block of little-endian PCM16 mono audio
    Audio(Vec<u8>),
    /// One changed camera frame
    Video(EncodedFrame),
}
