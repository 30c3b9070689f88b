//! Microphone capture engine

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{AudioConstraints, AudioSource, CaptureFrame, FrameSink, Visibility};
use crate::{ConversationState, Error, Result};

/// Gain applied to block RMS so conversational speech spans the meter
const LEVEL_GAIN: f32 = 4.0;

/// Microphone capture parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCaptureConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Samples per transmitted block
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
    /// Input amplitude publish interval
    pub amplitude_interval: Duration,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            block_size: 4096,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
            amplitude_interval: Duration::from_millis(16),
        }
    }
}

impl AudioCaptureConfig {
    /// Constraints handed to the platform source
    #[must_use]
    pub const fn constraints(&self) -> AudioConstraints {
        AudioConstraints {
            sample_rate: self.sample_rate,
            channels: 1,
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain: self.auto_gain,
        }
    }
}

/// Convert f32 samples to little-endian PCM16
///
/// Samples are clamped to [-1, 1]; negatives scale by 32768 and positives by
/// 32767 so both extremes map onto the full `i16` range.
#[must_use]
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let scaled = if clamped < 0.0 {
            clamped * 32768.0
        } else {
            clamped * 32767.0
        };
        #[allow(clippy::cast_possible_truncation)]
        let value = scaled as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Normalized loudness of a block of samples, in [0, 1]
#[must_use]
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    #[allow(clippy::cast_precision_loss)]
    let rms = (sum / samples.len() as f32).sqrt();
    (rms * LEVEL_GAIN).clamp(0.0, 1.0)
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in samples_to_pcm16(samples).chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Block counters for one engine, across runs
#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    gated: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time block counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    /// Blocks handed to the sink
    pub forwarded: u64,
    /// Blocks discarded because capture was not allowed
    pub gated: u64,
    /// Blocks discarded because the sink was full or closed
    pub dropped: u64,
}

/// Accumulates callback samples into fixed blocks and gates each one
struct BlockProcessor {
    state: ConversationState,
    sink: FrameSink,
    block: Vec<f32>,
    block_size: usize,
    level: Arc<AtomicU32>,
    counters: Arc<Counters>,
}

impl BlockProcessor {
    fn new(
        state: ConversationState,
        sink: FrameSink,
        block_size: usize,
        level: Arc<AtomicU32>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            state,
            sink,
            block: Vec::with_capacity(block_size),
            block_size,
            level,
            counters,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.level
            .store(rms_level(samples).to_bits(), Ordering::Relaxed);

        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.block_size - self.block.len()).min(rest.len());
            self.block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.block.len() == self.block_size {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        // Fresh snapshot per block: the gate may have flipped mid-callback
        if self.state.snapshot().allows_capture() {
            let frame = CaptureFrame::Audio(samples_to_pcm16(&self.block));
            match self.sink.try_send(frame) {
                Ok(()) => {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            self.counters.gated.fetch_add(1, Ordering::Relaxed);
        }
        self.block.clear();
    }
}

/// Resources held while the microphone is open
///
/// Dropping it releases everything, so an aborted start or a dropped engine
/// never leaks the device or the timers.
struct RunningCapture {
    source: Arc<dyn AudioSource>,
    state: ConversationState,
    level: Arc<AtomicU32>,
    meter: Arc<Mutex<bool>>,
    amplitude_task: JoinHandle<()>,
    lifecycle_task: Option<JoinHandle<()>>,
}

impl Drop for RunningCapture {
    fn drop(&mut self) {
        self.source.close();
        self.level.store(0, Ordering::Relaxed);
        // A tick already past its await finishes before this lock is granted
        *self.meter.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.amplitude_task.abort();
        if let Some(task) = self.lifecycle_task.take() {
            task.abort();
        }
        self.state.set_input_amplitude(0.0);
    }
}

/// Gated microphone capture
pub struct AudioCaptureEngine {
    source: Arc<dyn AudioSource>,
    state: ConversationState,
    sink: FrameSink,
    config: AudioCaptureConfig,
    lifecycle: Option<watch::Receiver<Visibility>>,
    counters: Arc<Counters>,
    running: Option<RunningCapture>,
}

impl AudioCaptureEngine {
    /// Create an engine; nothing is acquired until [`start`](Self::start)
    #[must_use]
    pub fn new(
        source: Arc<dyn AudioSource>,
        state: ConversationState,
        sink: FrameSink,
        config: AudioCaptureConfig,
    ) -> Self {
        Self {
            source,
            state,
            sink,
            config,
            lifecycle: None,
            counters: Arc::new(Counters::default()),
            running: None,
        }
    }

    /// Resume the source whenever the host returns to the foreground
    #[must_use]
    pub fn with_lifecycle(mut self, visibility: Option<watch::Receiver<Visibility>>) -> Self {
        self.lifecycle = visibility;
        self
    }

    /// Acquire the microphone and start streaming gated blocks
    ///
    /// On failure no timer is started and the conversation state is untouched.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` or `DeviceUnavailable` from the source
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let level = Arc::new(AtomicU32::new(0));
        let mut processor = BlockProcessor::new(
            self.state.clone(),
            self.sink.clone(),
            self.config.block_size,
            Arc::clone(&level),
            Arc::clone(&self.counters),
        );

        self.source
            .open(
                &self.config.constraints(),
                Box::new(move |samples: &[f32]| processor.push(samples)),
            )
            .await?;

        let meter = Arc::new(Mutex::new(true));
        let amplitude_task = spawn_amplitude_tap(
            self.state.clone(),
            Arc::clone(&level),
            Arc::clone(&meter),
            self.config.amplitude_interval,
        );
        let lifecycle_task = self
            .lifecycle
            .clone()
            .map(|rx| spawn_foreground_resume(Arc::clone(&self.source), rx));

        self.running = Some(RunningCapture {
            source: Arc::clone(&self.source),
            state: self.state.clone(),
            level,
            meter,
            amplitude_task,
            lifecycle_task,
        });

        tracing::info!(
            sample_rate = self.config.sample_rate,
            block_size = self.config.block_size,
            "microphone capture started"
        );
        Ok(())
    }

    /// Release the microphone and stop the timers; safe to call repeatedly
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            drop(running);
            tracing::info!("microphone capture stopped");
        }
    }

    /// Whether the microphone is currently held
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Block counters since the engine was created
    #[must_use]
    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            gated: self.counters.gated.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Publish the block level at a fixed rate while `meter` holds true
fn spawn_amplitude_tap(
    state: ConversationState,
    level: Arc<AtomicU32>,
    meter: Arc<Mutex<bool>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let open = meter.lock().unwrap_or_else(PoisonError::into_inner);
            if !*open {
                break;
            }
            let value = if state.snapshot().muted {
                0.0
            } else {
                f32::from_bits(level.load(Ordering::Relaxed))
            };
            state.set_input_amplitude(value);
        }
    })
}

fn spawn_foreground_resume(
    source: Arc<dyn AudioSource>,
    mut visibility: watch::Receiver<Visibility>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while visibility.changed().await.is_ok() {
            let now = *visibility.borrow_and_update();
            if now != Visibility::Foreground {
                continue;
            }
            match source.resume() {
                Ok(()) => tracing::debug!("audio context resumed after foreground"),
                Err(e) => tracing::warn!(error = %e, "failed to resume audio context"),
            }
        }
    })
}
