//! Camera capture engine: sampled, downscaled, change-detected JPEG frames

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{CaptureFrame, EncodedFrame, FrameSink, VideoConstraints, VideoSource};
use crate::{CameraFacing, ConversationState, Error, Result};

/// Camera capture parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCaptureConfig {
    /// Ideal base width requested from the camera
    pub width: u32,
    /// Ideal base height requested from the camera
    pub height: u32,
    /// Time between sampling ticks
    pub sample_interval: Duration,
    /// Longer edge of transmitted frames
    pub max_dimension: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Relative encoded-size change below which a frame is unchanged
    pub change_threshold: f64,
    /// Pause between releasing one camera and opening the other
    pub settle_delay: Duration,
}

impl Default for CameraCaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            sample_interval: Duration::from_millis(500),
            max_dimension: 512,
            jpeg_quality: 70,
            change_threshold: 0.05,
            settle_delay: Duration::from_millis(300),
        }
    }
}

/// Scale `frame` down so its longer edge is at most `max_dimension`
///
/// Frames already within bounds are returned unchanged. Aspect ratio is kept.
#[must_use]
pub fn downscale(frame: &RgbImage, max_dimension: u32) -> RgbImage {
    let (width, height) = frame.dimensions();
    let longer = width.max(height);
    if longer <= max_dimension {
        return frame.clone();
    }
    let scale = f64::from(max_dimension) / f64::from(longer);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let resize = |edge: u32| ((f64::from(edge) * scale).round() as u32).max(1);
    imageops::resize(frame, resize(width), resize(height), FilterType::Triangle)
}

/// Encode `frame` as JPEG
///
/// # Errors
///
/// Returns error if encoding fails
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(frame)?;
    Ok(out)
}

/// Encoded-size heuristic for "did the scene change"
///
/// Cheap proxy: a static scene compresses to nearly the same size. The
/// baseline only moves when a frame is emitted.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    threshold: f64,
    baseline: Option<usize>,
}

impl ChangeDetector {
    /// Create a detector with no baseline
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self {
            threshold,
            baseline: None,
        }
    }

    /// Whether a frame of `size` bytes differs enough from the baseline
    #[must_use]
    pub fn is_changed(&self, size: usize) -> bool {
        match self.baseline {
            None => true,
            Some(0) => size != 0,
            Some(prev) => {
                #[allow(clippy::cast_precision_loss)]
                let diff = (size as f64 - prev as f64).abs() / prev as f64;
                diff >= self.threshold
            }
        }
    }

    /// Accept the frame as the new baseline if it changed; returns whether it did
    pub fn observe(&mut self, size: usize) -> bool {
        if self.is_changed(size) {
            self.baseline = Some(size);
            true
        } else {
            false
        }
    }

    /// Forget the baseline so the next frame is always emitted
    pub const fn reset(&mut self) {
        self.baseline = None;
    }
}

/// What one sampling tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Gate closed; nothing grabbed or encoded
    Skipped,
    /// Gate closed while the frame was being encoded; the frame was thrown away
    Discarded,
    /// Frame encoded but too similar to the last emitted one
    Unchanged,
    /// Frame handed to the sink
    Emitted,
    /// Frame changed but the sink was full or closed
    Dropped,
}

/// Per-tick sampling pipeline
pub struct FrameSampler {
    state: ConversationState,
    sink: FrameSink,
    detector: ChangeDetector,
    max_dimension: u32,
    jpeg_quality: u8,
}

impl FrameSampler {
    /// Create a sampler writing to `sink`
    #[must_use]
    pub const fn new(state: ConversationState, sink: FrameSink, config: &CameraCaptureConfig) -> Self {
        Self {
            state,
            sink,
            detector: ChangeDetector::new(config.change_threshold),
            max_dimension: config.max_dimension,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Run one sampling tick against `source`
    ///
    /// # Errors
    ///
    /// Returns error if grabbing or encoding the frame fails
    pub fn tick(&mut self, source: &dyn VideoSource) -> Result<TickOutcome> {
        if !self.state.snapshot().allows_capture() {
            return Ok(TickOutcome::Skipped);
        }

        let raw = source.grab()?;
        let frame = encode(&raw, self.max_dimension, self.jpeg_quality)?;

        // Encoding takes time; the gate may have closed since
        if !self.state.snapshot().allows_capture() {
            return Ok(TickOutcome::Discarded);
        }
        if !self.detector.observe(frame.jpeg.len()) {
            return Ok(TickOutcome::Unchanged);
        }

        match self.sink.try_send(CaptureFrame::Video(frame)) {
            Ok(()) => Ok(TickOutcome::Emitted),
            Err(_) => Ok(TickOutcome::Dropped),
        }
    }
}

fn encode(raw: &RgbImage, max_dimension: u32, quality: u8) -> Result<EncodedFrame> {
    let scaled = downscale(raw, max_dimension);
    let jpeg = encode_jpeg(&scaled, quality)?;
    Ok(EncodedFrame {
        jpeg,
        width: scaled.width(),
        height: scaled.height(),
    })
}

#[derive(Debug, Default)]
struct Counters {
    skipped: AtomicU64,
    discarded: AtomicU64,
    unchanged: AtomicU64,
    emitted: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Result<TickOutcome>) {
        let counter = match outcome {
            Ok(TickOutcome::Skipped) => &self.skipped,
            Ok(TickOutcome::Discarded) => &self.discarded,
            Ok(TickOutcome::Unchanged) => &self.unchanged,
            Ok(TickOutcome::Emitted) => &self.emitted,
            Ok(TickOutcome::Dropped) => &self.dropped,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time tick counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraCounters {
    pub skipped: u64,
    pub discarded: u64,
    pub unchanged: u64,
    pub emitted: u64,
    pub dropped: u64,
    pub failed: u64,
}

struct RunningCamera {
    source: Arc<dyn VideoSource>,
    state: ConversationState,
    ticker: JoinHandle<()>,
}

impl Drop for RunningCamera {
    fn drop(&mut self) {
        self.ticker.abort();
        self.source.close();
        self.state.set_camera_active(false);
    }
}

/// Gated camera capture
pub struct CameraCaptureEngine {
    source: Arc<dyn VideoSource>,
    state: ConversationState,
    sink: FrameSink,
    config: CameraCaptureConfig,
    counters: Arc<Counters>,
    running: Option<RunningCamera>,
}

impl CameraCaptureEngine {
    /// Create an engine; the camera is not opened until [`start`](Self::start)
    #[must_use]
    pub fn new(
        source: Arc<dyn VideoSource>,
        state: ConversationState,
        sink: FrameSink,
        config: CameraCaptureConfig,
    ) -> Self {
        Self {
            source,
            state,
            sink,
            config,
            counters: Arc::new(Counters::default()),
            running: None,
        }
    }

    /// Open the camera facing `facing` and start the sampling timer
    ///
    /// # Errors
    ///
    /// `PermissionDenied` or `DeviceUnavailable` from the source
    pub async fn start(&mut self, facing: CameraFacing) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let constraints = VideoConstraints {
            facing,
            width: self.config.width,
            height: self.config.height,
        };
        self.source.open(&constraints).await?;

        let sampler = FrameSampler::new(self.state.clone(), self.sink.clone(), &self.config);
        let ticker = spawn_sampling(
            Arc::clone(&self.source),
            sampler,
            Arc::clone(&self.counters),
            self.config.sample_interval,
        );
        self.running = Some(RunningCamera {
            source: Arc::clone(&self.source),
            state: self.state.clone(),
            ticker,
        });
        self.state.set_camera_facing(facing);
        self.state.set_camera_active(true);

        tracing::info!(%facing, interval_ms = self.config.sample_interval.as_millis(), "camera capture started");
        Ok(())
    }

    /// Stop sampling and release the camera; safe to call repeatedly
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            drop(running);
            tracing::info!("camera capture stopped");
        }
    }

    /// Flip between front and back cameras
    ///
    /// The current camera is released and the platform gets a short settle
    /// period before the other one is opened. The preference flips even when
    /// reopening fails, so the next [`start`](Self::start) uses the new facing.
    /// When the camera is off only the preference changes.
    ///
    /// # Errors
    ///
    /// Returns error if the other camera cannot be opened
    pub async fn switch_camera(&mut self) -> Result<()> {
        let next = self.state.snapshot().camera_facing.flipped();
        self.state.set_camera_facing(next);
        if self.running.is_none() {
            return Ok(());
        }

        self.stop();
        tokio::time::sleep(self.config.settle_delay).await;
        self.start(next).await
    }

    /// Grab, downscale and encode one frame on demand
    ///
    /// Bypasses the gate and leaves the change-detection baseline alone.
    ///
    /// # Errors
    ///
    /// Returns error if the camera is not running or encoding fails
    pub fn capture_frame(&self) -> Result<EncodedFrame> {
        if self.running.is_none() {
            return Err(Error::Camera("camera is not running".to_string()));
        }
        let raw = self.source.grab()?;
        encode(&raw, self.config.max_dimension, self.config.jpeg_quality)
    }

    /// Whether the camera is currently held
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Tick counters since the engine was created
    #[must_use]
    pub fn counters(&self) -> CameraCounters {
        CameraCounters {
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            unchanged: self.counters.unchanged.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

fn spawn_sampling(
    source: Arc<dyn VideoSource>,
    mut sampler: FrameSampler,
    counters: Arc<Counters>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let outcome = sampler.tick(source.as_ref());
            if let Err(e) = &outcome {
                tracing::warn!(error = %e, "camera frame capture failed");
            }
            counters.record(&outcome);
        }
    })
}
