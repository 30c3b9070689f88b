//! Video source fed by the host application
//!
//! The host owns the platform camera. It watches for open requests, records the
//! user's consent decision, and publishes frames; the engine only ever sees the
//! latest one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::sync::watch;

use super::{VideoConstraints, VideoSource};
use crate::{Error, Result};

/// How long `open` waits for the host to answer a consent request
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Host's answer to a camera access request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessDecision {
    /// No answer yet
    #[default]
    Pending,
    Granted,
    Denied,
}

/// Create a connected publisher and source pair
#[must_use]
pub fn host_camera() -> (FramePublisher, HostVideoSource) {
    let (request_tx, request_rx) = watch::channel(None);
    let (access_tx, access_rx) = watch::channel(AccessDecision::Pending);
    let (frame_tx, frame_rx) = watch::channel(None);

    let publisher = FramePublisher {
        requests: request_rx,
        access: access_tx,
        frames: frame_tx,
    };
    let source = HostVideoSource {
        requests: request_tx,
        access: access_rx,
        frames: frame_rx,
        open: AtomicBool::new(false),
        open_timeout: DEFAULT_OPEN_TIMEOUT,
    };
    (publisher, source)
}

/// Host side: answers access requests and publishes frames
pub struct FramePublisher {
    requests: watch::Receiver<Option<VideoConstraints>>,
    access: watch::Sender<AccessDecision>,
    frames: watch::Sender<Option<RgbImage>>,
}

impl FramePublisher {
    /// Allow the camera to open
    pub fn grant(&self) {
        self.access.send_replace(AccessDecision::Granted);
    }

    /// Refuse camera access; pending and future opens fail
    pub fn deny(&self) {
        self.access.send_replace(AccessDecision::Denied);
    }

    /// Replace the latest frame
    pub fn publish(&self, frame: RgbImage) {
        self.frames.send_replace(Some(frame));
    }

    /// Constraints of the currently open camera, if any
    #[must_use]
    pub fn requested(&self) -> Option<VideoConstraints> {
        *self.requests.borrow()
    }

    /// Wait until the engine opens or closes the camera
    ///
    /// Returns `None` once the source is gone.
    pub async fn next_request(&mut self) -> Option<Option<VideoConstraints>> {
        self.requests.changed().await.ok()?;
        Some(*self.requests.borrow_and_update())
    }
}

/// Engine side of [`host_camera`]
pub struct HostVideoSource {
    requests: watch::Sender<Option<VideoConstraints>>,
    access: watch::Receiver<AccessDecision>,
    frames: watch::Receiver<Option<RgbImage>>,
    open: AtomicBool,
    open_timeout: Duration,
}

impl HostVideoSource {
    /// Override how long `open` waits for a consent decision
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[async_trait]
impl VideoSource for HostVideoSource {
    async fn open(&self, constraints: &VideoConstraints) -> Result<()> {
        self.requests.send_replace(Some(*constraints));

        let mut access = self.access.clone();
        let decision = tokio::time::timeout(
            self.open_timeout,
            access.wait_for(|d| *d != AccessDecision::Pending),
        )
        .await
        .map(|waited| waited.map(|d| *d));

        let result = match decision {
            Ok(Ok(AccessDecision::Granted)) => {
                self.open.store(true, Ordering::Release);
                tracing::debug!(facing = %constraints.facing, "host camera opened");
                return Ok(());
            }
            Ok(Ok(_)) => Err(Error::PermissionDenied("camera access denied".to_string())),
            Ok(Err(_)) => Err(Error::DeviceUnavailable("camera host went away".to_string())),
            Err(_) => Err(Error::DeviceUnavailable(
                "camera host did not answer the access request".to_string(),
            )),
        };
        self.requests.send_replace(None);
        result
    }

    fn grab(&self) -> Result<RgbImage> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::Camera("camera is closed".to_string()));
        }
        self.frames
            .borrow()
            .clone()
            .ok_or_else(|| Error::Camera("no frame available yet".to_string()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.requests.send_replace(None);
            tracing::debug!("host camera closed");
        }
    }
}
