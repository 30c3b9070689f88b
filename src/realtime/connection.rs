//! Realtime connection: session setup, frame forwarding, inbound event handling

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::protocol::{ClientMessage, Role, ServerEvent, classify_error};
use super::relay::{SessionRelay, SessionRequest, SessionTicket};
use crate::capture::CaptureFrame;
use crate::{ConversationState, Error, Phase, Result, Voice};

/// Capacity of the connection event broadcast
const EVENT_CAPACITY: usize = 64;

/// Gain applied to playback RMS, matching the microphone meter
const OUTPUT_LEVEL_GAIN: f32 = 4.0;

/// Realtime session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Backend relay endpoint issuing session tickets
    pub relay_url: String,
    /// Realtime service websocket endpoint
    pub realtime_url: String,
    pub model: String,
    pub instructions: String,
    pub voice: Voice,
    /// Upper bound on ticket issuance plus channel setup
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:18790/api/realtime/session".to_string(),
            realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            instructions: "You are a helpful voice assistant. Keep answers short and \
                           conversational, and say so when you are unsure."
                .to_string(),
            voice: Voice::default(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl SessionConfig {
    /// Same session with a different voice
    #[must_use]
    pub fn with_voice(&self, voice: Voice) -> Self {
        Self {
            voice,
            ..self.clone()
        }
    }

    /// Relay request for this configuration
    #[must_use]
    pub fn request(&self) -> SessionRequest {
        SessionRequest {
            model: self.model.clone(),
            voice: self.voice,
            instructions: self.instructions.clone(),
        }
    }
}

/// Open message channel to the service
pub struct RealtimeChannel {
    /// Messages to the service; dropping it closes the channel
    pub outbound: mpsc::Sender<ClientMessage>,
    /// Events from the service; `None` once the remote side closed
    pub inbound: mpsc::Receiver<ServerEvent>,
}

/// Transport that turns a ticket into an open channel
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel authenticated by `ticket`
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` when the channel cannot be established
    async fn open(&self, ticket: SessionTicket, config: &SessionConfig) -> Result<RealtimeChannel>;
}

/// Transport-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Closed,
    Connecting,
    Open,
}

/// Notification for the swap coordinator and the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The service confirmed the session is usable
    Ready,
    /// The assistant finished a turn
    TurnComplete,
    /// Transcribed speech
    Transcript { role: Role, text: String },
    /// Non-fatal protocol error; the conversation continues
    Notice(String),
    /// Fatal protocol error; the conversation was deactivated
    Fatal(String),
    /// The remote side closed the channel
    Closed,
}

struct LiveLink {
    outbound: mpsc::Sender<ClientMessage>,
    shutdown: oneshot::Sender<()>,
    pump: JoinHandle<()>,
}

/// Resets status and phase if a connect attempt is abandoned midway
struct ConnectAttempt<'a> {
    status: &'a watch::Sender<LinkStatus>,
    state: &'a ConversationState,
    armed: bool,
}

impl ConnectAttempt<'_> {
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status.send_replace(LinkStatus::Closed);
            if let Err(e) = self.state.transition(Phase::Idle) {
                tracing::debug!(error = %e, "could not reset phase after failed connect");
            }
        }
    }
}

/// Connection to the realtime service
///
/// Owns the receiving half of the capture frame queue for its whole life and
/// lends it to one pump task per open channel. Connect attempts are
/// serialized; `disconnect` cancels one in flight instead of waiting for it.
pub struct RealtimeConnection {
    state: ConversationState,
    relay: Arc<dyn SessionRelay>,
    connector: Arc<dyn Connector>,
    frames: Arc<Mutex<mpsc::Receiver<CaptureFrame>>>,
    status: Arc<watch::Sender<LinkStatus>>,
    events: broadcast::Sender<ConnectionEvent>,
    playback: Option<mpsc::Sender<Vec<u8>>>,
    live: Mutex<Option<LiveLink>>,
    connecting: Mutex<()>,
    /// Bumped by every disconnect
    generation: watch::Sender<u64>,
}

impl RealtimeConnection {
    /// Create a closed connection reading capture frames from `frames`
    #[must_use]
    pub fn new(
        state: ConversationState,
        relay: Arc<dyn SessionRelay>,
        connector: Arc<dyn Connector>,
        frames: mpsc::Receiver<CaptureFrame>,
    ) -> Self {
        let (status, _) = watch::channel(LinkStatus::Closed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (generation, _) = watch::channel(0);
        Self {
            state,
            relay,
            connector,
            frames: Arc::new(Mutex::new(frames)),
            status: Arc::new(status),
            events,
            playback: None,
            live: Mutex::new(None),
            connecting: Mutex::new(()),
            generation,
        }
    }

    /// Forward decoded response audio (PCM16 LE) to a player
    #[must_use]
    pub fn with_playback(mut self, playback: Option<mpsc::Sender<Vec<u8>>>) -> Self {
        self.playback = playback;
        self
    }

    /// Subscribe to connection events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Obtain a ticket, open the channel and start forwarding
    ///
    /// Moves the phase to `connecting`, then to `listening` once the channel is
    /// open. On failure the phase falls back to `idle`. Calling this while a
    /// channel is already open is a no-op. Frames still queued from an earlier
    /// channel are discarded, never sent on the new one.
    ///
    /// # Errors
    ///
    /// `SessionCreationFailed` or `FatalProtocol` from the relay,
    /// `ConnectionFailed` from the transport or when setup exceeds
    /// `connect_timeout`, `Cancelled` if [`disconnect`](Self::disconnect) ran
    /// meanwhile
    pub async fn connect(&self, config: &SessionConfig) -> Result<()> {
        let _serial = self.connecting.lock().await;
        {
            let mut live = self.live.lock().await;
            if live.as_ref().is_some_and(|link| !link.pump.is_finished())
                && self.status() == LinkStatus::Open
            {
                return Ok(());
            }
            // A channel the remote side already closed
            if let Some(stale) = live.take() {
                reap(stale).await;
            }
        }

        let mut generation = self.generation.subscribe();
        self.state.transition(Phase::Connecting)?;
        self.status.send_replace(LinkStatus::Connecting);
        let mut attempt = ConnectAttempt {
            status: &self.status,
            state: &self.state,
            armed: true,
        };

        let opened = tokio::select! {
            opened = tokio::time::timeout(config.connect_timeout, self.open_channel(config)) => opened,
            _ = generation.changed() => {
                tracing::debug!(voice = %config.voice, "connect cancelled by disconnect");
                return Err(Error::Cancelled);
            }
        };
        let channel = opened.map_err(|_| {
            Error::ConnectionFailed(format!(
                "no channel within {}ms",
                config.connect_timeout.as_millis()
            ))
        })??;

        let mut live = self.live.lock().await;
        if generation.has_changed().unwrap_or(true) {
            return Err(Error::Cancelled);
        }

        let mut frames = Arc::clone(&self.frames).lock_owned().await;
        let discarded = discard_queued(&mut frames);
        if discarded > 0 {
            tracing::debug!(discarded, "discarded frames queued for a previous channel");
        }

        self.state.transition(Phase::Listening)?;
        attempt.disarm();
        self.status.send_replace(LinkStatus::Open);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pump = Pump {
            state: self.state.clone(),
            events: self.events.clone(),
            status: Arc::clone(&self.status),
            playback: self.playback.clone(),
            outbound: channel.outbound.clone(),
        };
        let handle = tokio::spawn(pump.run(frames, channel.inbound, shutdown_rx));

        *live = Some(LiveLink {
            outbound: channel.outbound,
            shutdown: shutdown_tx,
            pump: handle,
        });

        tracing::info!(voice = %config.voice, model = %config.model, "realtime session opened");
        Ok(())
    }

    async fn open_channel(&self, config: &SessionConfig) -> Result<RealtimeChannel> {
        let ticket = self.relay.create_session(&config.request()).await?;
        if ticket.is_expired() {
            return Err(Error::SessionCreationFailed(
                "session ticket expired before use".to_string(),
            ));
        }
        self.connector.open(ticket, config).await
    }

    /// Close the channel and release resources; safe to call from any state
    ///
    /// Frames accepted before the call are flushed to the closing channel. A
    /// connect attempt in flight is abandoned with `Cancelled`.
    pub async fn disconnect(&self) {
        self.generation.send_modify(|n| *n = n.wrapping_add(1));
        let link = self.live.lock().await.take();
        if let Some(link) = link {
            reap(link).await;
            tracing::info!("realtime session closed");
        }
        self.status.send_replace(LinkStatus::Closed);
        self.state.set_output_amplitude(0.0);
    }

    /// Send a typed user turn and request a response
    ///
    /// # Errors
    ///
    /// `NotConnected` if no channel is open
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_item(Role::User, text).await
    }

    /// Send a system instruction and request a response
    ///
    /// # Errors
    ///
    /// `NotConnected` if no channel is open
    pub async fn send_instruction(&self, text: &str) -> Result<()> {
        self.send_item(Role::System, text).await
    }

    async fn send_item(&self, role: Role, text: &str) -> Result<()> {
        let outbound = self
            .live
            .lock()
            .await
            .as_ref()
            .filter(|link| !link.pump.is_finished())
            .map(|link| link.outbound.clone())
            .ok_or(Error::NotConnected)?;

        let item = ClientMessage::ConversationItem {
            role,
            content: text.to_string(),
        };
        outbound.send(item).await.map_err(|_| Error::NotConnected)?;
        outbound
            .send(ClientMessage::ResponseCreate)
            .await
            .map_err(|_| Error::NotConnected)?;
        Ok(())
    }
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        if let Some(link) = self.live.get_mut().take() {
            let _ = link.shutdown.send(());
        }
    }
}

async fn reap(link: LiveLink) {
    let _ = link.shutdown.send(());
    drop(link.outbound);
    if let Err(e) = link.pump.await
        && e.is_panic()
    {
        tracing::error!(error = %e, "realtime pump panicked");
    }
}

/// Per-channel task moving frames out and events in
struct Pump {
    state: ConversationState,
    events: broadcast::Sender<ConnectionEvent>,
    status: Arc<watch::Sender<LinkStatus>>,
    playback: Option<mpsc::Sender<Vec<u8>>>,
    outbound: mpsc::Sender<ClientMessage>,
}

impl Pump {
    async fn run(
        self,
        mut frames: OwnedMutexGuard<mpsc::Receiver<CaptureFrame>>,
        mut inbound: mpsc::Receiver<ServerEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut frames_open = true;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    self.flush(&mut frames).await;
                    break;
                }

                event = inbound.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("realtime channel closed by remote");
                        self.lost();
                        break;
                    };
                    if self.handle_event(event).is_break() {
                        break;
                    }
                }

                frame = frames.recv(), if frames_open => {
                    let Some(frame) = frame else {
                        frames_open = false;
                        continue;
                    };
                    if self.outbound.send(frame.into()).await.is_err() {
                        tracing::warn!("realtime channel refused a frame, closing");
                        self.lost();
                        break;
                    }
                }
            }
        }

        self.status.send_replace(LinkStatus::Closed);
    }

    /// Forward frames already accepted by the capture engines
    async fn flush(&self, frames: &mut mpsc::Receiver<CaptureFrame>) {
        let mut flushed = 0_usize;
        while let Ok(frame) = frames.try_recv() {
            if self.outbound.send(frame.into()).await.is_err() {
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            tracing::debug!(flushed, "flushed pending frames before close");
        }
    }

    /// The channel is gone without a disconnect; capture stops until a reconnect
    fn lost(&self) {
        self.status.send_replace(LinkStatus::Closed);
        self.enter(Phase::Idle);
        self.state.set_output_amplitude(0.0);
        self.emit(ConnectionEvent::Closed);
    }

    fn handle_event(&self, event: ServerEvent) -> ControlFlow<()> {
        match event {
            ServerEvent::SessionReady { session_id } => {
                tracing::debug!(session_id = session_id.as_deref().unwrap_or(""), "session ready");
                self.emit(ConnectionEvent::Ready);
            }
            ServerEvent::ResponseStarted => self.enter(Phase::Thinking),
            ServerEvent::AudioDelta { audio } => {
                self.enter(Phase::Speaking);
                self.state.set_output_amplitude(pcm16_level(&audio));
                if let Some(playback) = &self.playback
                    && playback.try_send(audio).is_err()
                {
                    tracing::debug!("playback sink full, dropping audio chunk");
                }
            }
            ServerEvent::Transcript { role, text } => {
                self.emit(ConnectionEvent::Transcript { role, text });
            }
            ServerEvent::TurnComplete => {
                self.enter(Phase::Listening);
                self.state.set_output_amplitude(0.0);
                self.emit(ConnectionEvent::TurnComplete);
            }
            ServerEvent::Error {
                recoverable,
                code,
                message,
            } => match classify_error(recoverable, code.as_deref(), &message) {
                Error::RecoverableProtocol(detail) => {
                    tracing::warn!(detail = %detail, "recoverable realtime error");
                    self.emit(ConnectionEvent::Notice(detail));
                }
                other => {
                    tracing::error!(error = %other, "fatal realtime error, ending session");
                    self.state.deactivate();
                    self.emit(ConnectionEvent::Fatal(other.to_string()));
                    return ControlFlow::Break(());
                }
            },
            ServerEvent::Unknown => tracing::debug!("ignoring unknown realtime event"),
        }
        ControlFlow::Continue(())
    }

    fn enter(&self, phase: Phase) {
        if let Err(e) = self.state.transition(phase) {
            tracing::debug!(error = %e, "ignoring phase change from realtime event");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Drop everything queued without forwarding it
fn discard_queued(frames: &mut mpsc::Receiver<CaptureFrame>) -> usize {
    let mut discarded = 0;
    while frames.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

/// Normalized loudness of little-endian PCM16 audio
fn pcm16_level(bytes: &[u8]) -> f32 {
    let samples = bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0);
    let (sum, count) = samples.fold((0.0_f32, 0_u32), |(sum, count), s| {
        (sum + s * s, count + 1)
    });
    if count == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rms = (sum / count as f32).sqrt();
    (rms * OUTPUT_LEVEL_GAIN).clamp(0.0, 1.0)
}
