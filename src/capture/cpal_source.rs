//! Microphone source backed by the default cpal input device
//!
//! cpal streams are not `Send`, so each open stream lives on its own thread
//! and is driven through a command channel.

use std::sync::Mutex;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::oneshot;

use super::{AudioConstraints, AudioSource, SampleCallback};
use crate::{Error, Result};

const RESAMPLER_CHUNK: usize = 1024;

enum StreamCommand {
    Resume,
    Stop,
}

struct StreamWorker {
    commands: std_mpsc::Sender<StreamCommand>,
    thread: JoinHandle<()>,
}

/// Default system microphone
#[derive(Default)]
pub struct CpalAudioSource {
    worker: Mutex<Option<StreamWorker>>,
}

impl CpalAudioSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn take_worker(&self) -> Option<StreamWorker> {
        self.worker.lock().ok().and_then(|mut w| w.take())
    }
}

#[async_trait]
impl AudioSource for CpalAudioSource {
    async fn open(
        &self,
        constraints: &AudioConstraints,
        on_samples: SampleCallback,
    ) -> Result<()> {
        self.close();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let constraints = constraints.clone();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_stream(&constraints, on_samples, &cmd_rx, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(StreamWorker {
                        commands: cmd_tx,
                        thread,
                    });
                }
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("capture thread exited during startup".to_string()))
            }
        }
    }

    fn resume(&self) -> Result<()> {
        let guard = self
            .worker
            .lock()
            .map_err(|_| Error::Audio("capture worker lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(worker) => worker
                .commands
                .send(StreamCommand::Resume)
                .map_err(|_| Error::Audio("capture thread is gone".to_string())),
            None => Ok(()),
        }
    }

    fn close(&self) {
        if let Some(worker) = self.take_worker() {
            let _ = worker.commands.send(StreamCommand::Stop);
            if worker.thread.join().is_err() {
                tracing::error!("microphone capture thread panicked");
            }
        }
    }
}

impl Drop for CpalAudioSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_stream(
    constraints: &AudioConstraints,
    on_samples: SampleCallback,
    commands: &std_mpsc::Receiver<StreamCommand>,
    ready: oneshot::Sender<Result<()>>,
) {
    let stream = match build_stream(constraints, on_samples) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    // Exits on Stop or when the source drops the sender
    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Resume => {
                if let Err(e) = stream.play() {
                    tracing::warn!(error = %e, "failed to resume microphone stream");
                }
            }
            StreamCommand::Stop => break,
        }
    }
    drop(stream);
    tracing::debug!("microphone stream released");
}

fn build_stream(constraints: &AudioConstraints, on_samples: SampleCallback) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let target = SampleRate(constraints.sample_rate);
    let mono = device
        .supported_input_configs()
        .map_err(|e| match e {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
                Error::DeviceUnavailable(e.to_string())
            }
            other => classify_backend(other.to_string()),
        })?
        .find(|c| {
            c.channels() == 1 && c.min_sample_rate() <= target && c.max_sample_rate() >= target
        });

    let (config, native_rate): (StreamConfig, u32) = if let Some(range) = mono {
        (range.with_sample_rate(target).config(), constraints.sample_rate)
    } else {
        let fallback = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                Error::DeviceUnavailable(e.to_string())
            }
            other => classify_backend(other.to_string()),
        })?;
        let config = fallback.config();
        let rate = config.sample_rate.0;
        (config, rate)
    };

    // Voice processing is left to the host audio stack
    tracing::debug!(
        device = device.name().unwrap_or_default(),
        native_rate,
        target_rate = constraints.sample_rate,
        channels = config.channels,
        echo_cancellation = constraints.echo_cancellation,
        noise_suppression = constraints.noise_suppression,
        auto_gain = constraints.auto_gain,
        "microphone stream configured"
    );

    let mut pipeline = InputPipeline::new(
        usize::from(config.channels),
        native_rate,
        constraints.sample_rate,
        on_samples,
    )?;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| pipeline.push(data),
            |err| {
                tracing::error!(error = %err, "microphone stream error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => Error::DeviceUnavailable(e.to_string()),
            other => classify_backend(other.to_string()),
        })?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => Error::DeviceUnavailable(e.to_string()),
        other => classify_backend(other.to_string()),
    })?;

    Ok(stream)
}

/// Backends report consent failures as free text
fn classify_backend(message: String) -> Error {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "not permitted"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        Error::PermissionDenied(message)
    } else {
        Error::Audio(message)
    }
}

/// Downmix to mono and resample to the target rate
struct InputPipeline {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    mono: Vec<f32>,
    pending: Vec<f32>,
    on_samples: SampleCallback,
}

impl InputPipeline {
    #[allow(clippy::cast_possible_truncation)]
    fn new(
        channels: usize,
        from_rate: u32,
        to_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    from_rate as usize,
                    to_rate as usize,
                    RESAMPLER_CHUNK,
                    1,
                    1,
                )
                .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };

        Ok(Self {
            channels: channels.max(1),
            resampler,
            mono: Vec::new(),
            pending: Vec::with_capacity(RESAMPLER_CHUNK),
            on_samples,
        })
    }

    fn push(&mut self, data: &[f32]) {
        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend_from_slice(data);
        } else {
            #[allow(clippy::cast_precision_loss)]
            let scale = 1.0 / self.channels as f32;
            self.mono.extend(
                data.chunks_exact(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() * scale),
            );
        }

        let Some(resampler) = self.resampler.as_mut() else {
            (self.on_samples)(&self.mono);
            return;
        };

        let mut rest = self.mono.as_slice();
        while !rest.is_empty() {
            let take = (RESAMPLER_CHUNK - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == RESAMPLER_CHUNK {
                match resampler.process(&[&self.pending[..]], None) {
                    Ok(out) => (self.on_samples)(&out[0]),
                    Err(e) => tracing::warn!(error = %e, "resample failed, dropping chunk"),
                }
                self.pending.clear();
            }
        }
    }
}
