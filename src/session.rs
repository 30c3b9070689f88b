//! Host-facing voice session
//!
//! Wires the conversation state, both capture engines, the realtime connection
//! and the swap coordinator together. Resources are acquired after the state
//! they depend on and released before it changes back: `start` activates, then
//! connects, then opens the microphone; `stop` runs the same steps in reverse.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::capture::{
    AudioCaptureEngine, AudioSource, CameraCaptureEngine, EncodedFrame, VideoSource, Visibility,
};
use crate::realtime::{ConnectionEvent, Connector, RealtimeConnection, SessionConfig, SessionRelay};
use crate::swap::{SwapOutcome, VoiceSwapCoordinator};
use crate::{Config, ConversationState, Error, Result, Voice};

/// Frames buffered between the capture engines and the connection
const FRAME_QUEUE_DEPTH: usize = 32;

/// Platform capabilities a session is built from
pub struct SessionParts {
    pub audio: Arc<dyn AudioSource>,
    pub video: Arc<dyn VideoSource>,
    pub relay: Arc<dyn SessionRelay>,
    pub connector: Arc<dyn Connector>,
    /// Foreground/background signal from the host
    pub lifecycle: Option<watch::Receiver<Visibility>>,
    /// Receives response audio as little-endian PCM16
    pub playback: Option<mpsc::Sender<Vec<u8>>>,
}

/// One live voice conversation
pub struct VoiceSession {
    session: SessionConfig,
    state: ConversationState,
    connection: Arc<RealtimeConnection>,
    audio: Arc<tokio::sync::Mutex<AudioCaptureEngine>>,
    camera: Arc<tokio::sync::Mutex<CameraCaptureEngine>>,
    swap: VoiceSwapCoordinator,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSession {
    /// Assemble a session; nothing is acquired until [`start`](Self::start)
    #[must_use]
    pub fn new(config: Config, state: ConversationState, parts: SessionParts) -> Self {
        let (sink, frames) = mpsc::channel(FRAME_QUEUE_DEPTH);

        let connection = Arc::new(
            RealtimeConnection::new(state.clone(), parts.relay, parts.connector, frames)
                .with_playback(parts.playback),
        );
        let audio = AudioCaptureEngine::new(parts.audio, state.clone(), sink.clone(), config.audio)
            .with_lifecycle(parts.lifecycle);
        let camera = CameraCaptureEngine::new(parts.video, state.clone(), sink, config.camera);
        let swap = VoiceSwapCoordinator::new(state.clone(), Arc::clone(&connection), config.swap);

        Self {
            session: config.session,
            state,
            connection,
            audio: Arc::new(tokio::sync::Mutex::new(audio)),
            camera: Arc::new(tokio::sync::Mutex::new(camera)),
            swap,
            supervisor: Mutex::new(None),
        }
    }

    /// Shared conversation state
    #[must_use]
    pub const fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Subscribe to connection events (transcripts, notices, fatal errors)
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Activate the conversation, connect, and open the microphone
    ///
    /// Any failure leaves the session fully stopped and inactive.
    ///
    /// # Errors
    ///
    /// Connection errors from the relay or transport, `PermissionDenied` or
    /// `DeviceUnavailable` from the microphone
    pub async fn start(&self) -> Result<()> {
        self.state.activate();
        let session = self.session.with_voice(self.state.snapshot().selected_voice);

        if let Err(e) = self.connection.connect(&session).await {
            tracing::warn!(error = %e, "voice session failed to connect");
            self.state.deactivate();
            return Err(e);
        }
        if let Err(e) = self.audio.lock().await.start().await {
            tracing::warn!(error = %e, "voice session failed to open microphone");
            self.connection.disconnect().await;
            self.state.deactivate();
            return Err(e);
        }
        // stop() ran while the microphone was opening
        if !self.state.snapshot().active {
            self.audio.lock().await.stop();
            self.connection.disconnect().await;
            return Err(Error::Cancelled);
        }

        self.spawn_supervisor();
        tracing::info!(voice = %session.voice, "voice session started");
        Ok(())
    }

    /// Reconnect after the remote side closed the channel
    ///
    /// # Errors
    ///
    /// Connection errors from the relay or transport
    pub async fn reconnect(&self) -> Result<()> {
        let session = self.session.with_voice(self.state.snapshot().selected_voice);
        self.connection.connect(&session).await
    }

    /// Release every resource and deactivate; safe to call repeatedly
    pub async fn stop(&self) {
        if let Some(supervisor) = self.supervisor.lock().ok().and_then(|mut s| s.take()) {
            supervisor.abort();
        }
        self.camera.lock().await.stop();
        self.audio.lock().await.stop();
        self.swap.cancel();
        self.connection.disconnect().await;
        self.state.deactivate();
        tracing::info!("voice session stopped");
    }

    /// Change the assistant's voice, reconnecting if a session is active
    ///
    /// If neither voice can reconnect the whole session is stopped.
    ///
    /// # Errors
    ///
    /// See [`VoiceSwapCoordinator::swap_voice`]
    pub async fn select_voice(&self, voice: Voice) -> Result<SwapOutcome> {
        let result = self.swap.swap_voice(voice, &self.session).await;
        if matches!(result, Err(Error::VoiceSwapFailed(_) | Error::FatalProtocol(_))) {
            self.stop().await;
        }
        result
    }

    /// Send a typed turn
    ///
    /// # Errors
    ///
    /// `NotConnected` if no channel is open
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.connection.send_text(text).await
    }

    pub fn set_muted(&self, muted: bool) {
        self.state.set_muted(muted);
    }

    /// Flag image generation running elsewhere; capture pauses meanwhile
    pub fn set_generating_image(&self, busy: bool) {
        self.state.set_generating_image(busy);
    }

    /// Flag a web search running elsewhere; capture pauses meanwhile
    pub fn set_searching(&self, busy: bool) {
        self.state.set_searching(busy);
    }

    /// Open the camera with the preferred facing
    ///
    /// # Errors
    ///
    /// `PermissionDenied` or `DeviceUnavailable` from the camera
    pub async fn enable_camera(&self) -> Result<()> {
        let facing = self.state.snapshot().camera_facing;
        self.camera.lock().await.start(facing).await
    }

    pub async fn disable_camera(&self) {
        self.camera.lock().await.stop();
    }

    /// Flip between front and back cameras
    ///
    /// # Errors
    ///
    /// Returns error if the other camera cannot be opened
    pub async fn switch_camera(&self) -> Result<()> {
        self.camera.lock().await.switch_camera().await
    }

    /// Grab one frame regardless of gating, e.g. to attach to a text turn
    ///
    /// # Errors
    ///
    /// Returns error if the camera is off or encoding fails
    pub async fn capture_snapshot(&self) -> Result<EncodedFrame> {
        self.camera.lock().await.capture_frame()
    }

    fn spawn_supervisor(&self) {
        let mut events = self.connection.subscribe();
        let audio = Arc::clone(&self.audio);
        let camera = Arc::clone(&self.camera);
        let connection = Arc::clone(&self.connection);

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Fatal(message)) => {
                        tracing::error!(error = %message, "tearing down voice session after fatal error");
                        camera.lock().await.stop();
                        audio.lock().await.stop();
                        connection.disconnect().await;
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "session supervisor lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut supervisor) = self.supervisor.lock()
            && let Some(previous) = supervisor.replace(handle)
        {
            previous.abort();
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().ok().and_then(Option::take) {
            supervisor.abort();
        }
    }
}
