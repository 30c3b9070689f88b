//! Shared test fakes: synthetic capture devices and an in-memory realtime service

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_live::capture::{AudioConstraints, SampleCallback, VideoConstraints};
use beacon_live::realtime::{
    ClientMessage, Connector, RealtimeChannel, ServerEvent, SessionConfig, SessionRelay,
    SessionRequest, SessionTicket,
};
use beacon_live::{
    AudioSource, CameraFacing, Config, ConversationState, Error, Result, SessionParts,
    StateSnapshot, VideoSource, Visibility, Voice, VoiceSession,
};
use image::{Rgb, RgbImage};
use tokio::sync::{mpsc, watch};

/// How long a test waits for something asynchronous before failing
pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFailure {
    Denied,
    Missing,
}

impl DeviceFailure {
    fn error(self) -> Error {
        match self {
            Self::Denied => Error::PermissionDenied("user declined".to_string()),
            Self::Missing => Error::DeviceUnavailable("no device".to_string()),
        }
    }
}

/// Microphone whose samples come from the test
#[derive(Default)]
pub struct SyntheticMic {
    callback: Mutex<Option<SampleCallback>>,
    failure: Option<DeviceFailure>,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl SyntheticMic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(failure: DeviceFailure) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(failure),
            ..Self::default()
        })
    }

    /// Deliver samples as the platform audio thread would; false if closed
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut callback = self.callback.lock().unwrap();
        match callback.as_mut() {
            Some(on_samples) => {
                on_samples(samples);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

#[async_trait]
impl AudioSource for SyntheticMic {
    async fn open(&self, _constraints: &AudioConstraints, on_samples: SampleCallback) -> Result<()> {
        if let Some(failure) = self.failure {
            return Err(failure.error());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(on_samples);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.callback.lock().unwrap().take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Camera returning a test-controlled still image
pub struct SyntheticCamera {
    frame: Mutex<RgbImage>,
    open: AtomicBool,
    failure: Option<DeviceFailure>,
    pub opened_facings: Mutex<Vec<CameraFacing>>,
    pub grabs: AtomicUsize,
    pub closes: AtomicUsize,
}

impl SyntheticCamera {
    pub fn new(frame: RgbImage) -> Arc<Self> {
        Self::build(frame, None)
    }

    pub fn failing(failure: DeviceFailure) -> Arc<Self> {
        Self::build(gradient(8, 8), Some(failure))
    }

    fn build(frame: RgbImage, failure: Option<DeviceFailure>) -> Arc<Self> {
        Arc::new(Self {
            frame: Mutex::new(frame),
            open: AtomicBool::new(false),
            failure,
            opened_facings: Mutex::new(Vec::new()),
            grabs: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn set_frame(&self, frame: RgbImage) {
        *self.frame.lock().unwrap() = frame;
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn grab_count(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoSource for SyntheticCamera {
    async fn open(&self, constraints: &VideoConstraints) -> Result<()> {
        if let Some(failure) = self.failure {
            return Err(failure.error());
        }
        self.opened_facings.lock().unwrap().push(constraints.facing);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn grab(&self) -> Result<RgbImage> {
        if !self.is_open() {
            return Err(Error::Camera("camera closed".to_string()));
        }
        self.grabs.fetch_add(1, Ordering::SeqCst);
        Ok(self.frame.lock().unwrap().clone())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Image with enough detail that JPEG sizes differ between scenes
#[allow(clippy::cast_possible_truncation)]
pub fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    })
}

/// Relay issuing tickets unless told to fail
#[derive(Default)]
pub struct ScriptedRelay {
    failures_left: AtomicUsize,
    stalled: AtomicBool,
    refused: Mutex<Vec<Voice>>,
    pub requests: Mutex<Vec<Voice>>,
}

impl ScriptedRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` requests
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Fail every request for `voice`
    pub fn refuse(&self, voice: Voice) {
        self.refused.lock().unwrap().push(voice);
    }

    /// Never answer any further request
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn requested_voices(&self) -> Vec<Voice> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionRelay for ScriptedRelay {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionTicket> {
        self.requests.lock().unwrap().push(request.voice);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if self.refused.lock().unwrap().contains(&request.voice) {
            return Err(Error::SessionCreationFailed(format!(
                "relay refused voice {}",
                request.voice
            )));
        }
        let take_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if take_failure {
            return Err(Error::SessionCreationFailed("relay unavailable".to_string()));
        }

        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(60);
        Ok(SessionTicket::new("ek_test", expires_at))
    }
}

/// Service side of one in-memory channel
pub struct ServerEnd {
    pub voice: Voice,
    pub to_client: mpsc::Sender<ServerEvent>,
    pub from_client: mpsc::Receiver<ClientMessage>,
}

impl ServerEnd {
    pub async fn send(&self, event: ServerEvent) {
        self.to_client.send(event).await.unwrap();
    }

    /// Next client message, failing the test after [`WAIT`]
    pub async fn next_message(&mut self) -> ClientMessage {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client closed the channel")
    }

    /// Drain until the client closes its side, returning what it sent meanwhile
    pub async fn until_closed(&mut self) -> Vec<ClientMessage> {
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout(WAIT, self.from_client.recv()).await {
                Ok(Some(message)) => seen.push(message),
                Ok(None) => return seen,
                Err(_) => panic!("client never closed the channel"),
            }
        }
    }
}

/// Connector handing every opened channel's service side to the test
pub struct MemoryConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
}

pub fn memory_connector() -> (Arc<MemoryConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    let (servers, rx) = mpsc::unbounded_channel();
    (Arc::new(MemoryConnector { servers }), rx)
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _ticket: SessionTicket, config: &SessionConfig) -> Result<RealtimeChannel> {
        let (outbound, from_client) = mpsc::channel(128);
        let (to_client, inbound) = mpsc::channel(128);
        self.servers
            .send(ServerEnd {
                voice: config.voice,
                to_client,
                from_client,
            })
            .map_err(|_| Error::ConnectionFailed("service gone".to_string()))?;
        Ok(RealtimeChannel { outbound, inbound })
    }
}

/// Configuration with short swap timers
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.swap.retry.base_delay = Duration::from_millis(1);
    config.swap.retry.max_delay = Duration::from_millis(5);
    config.swap.ready_timeout = Duration::from_secs(1);
    config.swap.introduction_timeout = Duration::from_secs(1);
    config
}

/// A session wired to synthetic devices and an in-memory service
pub struct Harness {
    pub session: Arc<VoiceSession>,
    pub state: ConversationState,
    pub mic: Arc<SyntheticMic>,
    pub camera: Arc<SyntheticCamera>,
    pub relay: Arc<ScriptedRelay>,
    pub servers: mpsc::UnboundedReceiver<ServerEnd>,
    pub visibility: watch::Sender<Visibility>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_mic(config, SyntheticMic::new())
    }

    pub fn with_mic(config: Config, mic: Arc<SyntheticMic>) -> Self {
        let state = ConversationState::new();
        state.set_selected_voice(config.session.voice);

        let camera = SyntheticCamera::new(gradient(640, 480));
        let relay = ScriptedRelay::new();
        let (connector, servers) = memory_connector();
        let (visibility, lifecycle) = watch::channel(Visibility::Foreground);

        let parts = SessionParts {
            audio: mic.clone(),
            video: camera.clone(),
            relay: relay.clone(),
            connector,
            lifecycle: Some(lifecycle),
            playback: None,
        };
        let session = Arc::new(VoiceSession::new(config, state.clone(), parts));

        Self {
            session,
            state,
            mic,
            camera,
            relay,
            servers,
            visibility,
        }
    }

    /// Next channel the session opened, failing the test after [`WAIT`]
    pub async fn next_server(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Start the session and return the service side of its channel
    pub async fn start(&mut self) -> ServerEnd {
        self.session.start().await.unwrap();
        self.next_server().await
    }
}

/// Wait until the state satisfies `predicate`, failing the test after [`WAIT`]
pub async fn wait_for_state(
    state: &ConversationState,
    predicate: impl FnMut(&StateSnapshot) -> bool,
) -> StateSnapshot {
    let mut rx = state.subscribe();
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
    *snapshot
}

/// One full audio block with both extremes at the ends
pub fn speech_block(len: usize) -> Vec<f32> {
    #[allow(clippy::cast_precision_loss)]
    let mut block: Vec<f32> = (0..len)
        .map(|i| ((i as f32) * 0.05).sin() * 0.5)
        .collect();
    block[0] = -1.0;
    block[len - 1] = 1.0;
    block
}
