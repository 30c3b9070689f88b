//! Conversation state shared by the capture engines, the connection and UI collaborators
//!
//! The container is an explicit handle passed to each component. Every read returns
//! a copied [`StateSnapshot`]; callers re-read right before each gating decision
//! instead of holding a snapshot across an await point.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{Error, Result};

/// Turn-taking phase of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No network session
    #[default]
    Idle,
    /// Session being established (activation or voice swap)
    Connecting,
    /// Waiting for the user to speak
    Listening,
    /// Remote service is producing a response
    Thinking,
    /// Remote service is speaking
    Speaking,
}

impl Phase {
    /// Whether the state machine permits moving from `self` to `to`
    ///
    /// Any phase may fall back to idle or begin connecting. `listening` is only
    /// reachable once a session exists, so a new session never skips `connecting`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (_, Self::Idle | Self::Connecting) => true,
            (Self::Connecting | Self::Listening | Self::Thinking | Self::Speaking, Self::Listening) => {
                true
            }
            (Self::Listening | Self::Thinking | Self::Speaking, Self::Thinking | Self::Speaking) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Listening => write!(f, "listening"),
            Self::Thinking => write!(f, "thinking"),
            Self::Speaking => write!(f, "speaking"),
        }
    }
}

/// Which camera the capture engine should open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// User-facing camera
    #[default]
    Front,
    /// Environment-facing camera
    Back,
}

impl CameraFacing {
    /// The opposite facing
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

impl fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Front => write!(f, "front"),
            Self::Back => write!(f, "back"),
        }
    }
}

/// Synthesized voice identity requested from the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    /// Every voice the service offers
    pub const ALL: [Self; 8] = [
        Self::Alloy,
        Self::Ash,
        Self::Ballad,
        Self::Coral,
        Self::Echo,
        Self::Sage,
        Self::Shimmer,
        Self::Verse,
    ];

    /// Wire name of the voice
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown voice: {s}")))
    }
}

/// Consistent copy of every conversation field
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateSnapshot {
    /// Whether a voice session exists at all
    pub active: bool,
    /// Current turn-taking phase
    pub phase: Phase,
    /// User-requested suppression, independent of phase
    pub muted: bool,
    /// Latest normalized microphone level (0..=1)
    pub input_amplitude: f32,
    /// Latest normalized playback level (0..=1)
    pub output_amplitude: f32,
    /// Image generation in progress elsewhere in the product
    pub is_generating_image: bool,
    /// Web search in progress elsewhere in the product
    pub is_searching: bool,
    /// Voice identity requested for synthesis
    pub selected_voice: Voice,
    /// True for the whole duration of a voice swap
    pub is_voice_swapping: bool,
    /// Camera facing preference
    pub camera_facing: CameraFacing,
    /// Whether the camera engine is running
    pub camera_active: bool,
}

impl StateSnapshot {
    /// The gating predicate: capture may emit data only when this holds
    #[must_use]
    pub const fn allows_capture(&self) -> bool {
        self.active
            && matches!(self.phase, Phase::Listening)
            && !self.muted
            && !self.is_generating_image
            && !self.is_searching
            && !self.is_voice_swapping
    }
}

/// Shared handle to the conversation state
///
/// Cloning the handle shares the underlying state. Each setter writes one field
/// atomically and notifies subscribers only when the value changed.
#[derive(Debug, Clone)]
pub struct ConversationState {
    tx: Arc<watch::Sender<StateSnapshot>>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    /// Create an isolated, inactive state container
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StateSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        *self.tx.borrow()
    }

    /// Receiver notified on every change, for rendering collaborators
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.tx.subscribe()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    /// Mark the voice session as existing
    pub fn activate(&self) {
        self.update(|s| s.active = true);
        tracing::debug!("conversation activated");
    }

    /// Reset to idle and clear every transient flag
    ///
    /// User preferences (voice, camera facing) survive.
    pub fn deactivate(&self) {
        self.update(|s| {
            *s = StateSnapshot {
                selected_voice: s.selected_voice,
                camera_facing: s.camera_facing,
                ..StateSnapshot::default()
            };
        });
        tracing::debug!("conversation deactivated");
    }

    /// Move to `to` if the state machine allows it
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the edge is not permitted
    pub fn transition(&self, to: Phase) -> Result<()> {
        let mut result = Ok(());
        self.tx.send_if_modified(|s| {
            let from = s.phase;
            if !from.can_transition_to(to) {
                result = Err(Error::InvalidTransition { from, to });
                return false;
            }
            if from == to {
                return false;
            }
            s.phase = to;
            tracing::debug!(%from, %to, "phase transition");
            true
        });
        result
    }

    /// Set the user-visible mute flag
    pub fn set_muted(&self, muted: bool) {
        self.update(|s| s.muted = muted);
    }

    /// Raise or clear the image-generation busy flag
    pub fn set_generating_image(&self, busy: bool) {
        self.update(|s| s.is_generating_image = busy);
    }

    /// Raise or clear the search busy flag
    pub fn set_searching(&self, busy: bool) {
        self.update(|s| s.is_searching = busy);
    }

    /// Record the requested voice identity
    pub fn set_selected_voice(&self, voice: Voice) {
        self.update(|s| s.selected_voice = voice);
    }

    /// Raise or clear the voice-swap flag
    pub fn set_voice_swapping(&self, swapping: bool) {
        self.update(|s| s.is_voice_swapping = swapping);
    }

    /// Record the camera facing preference
    pub fn set_camera_facing(&self, facing: CameraFacing) {
        self.update(|s| s.camera_facing = facing);
    }

    /// Record whether the camera engine is running
    pub fn set_camera_active(&self, active: bool) {
        self.update(|s| s.camera_active = active);
    }

    /// Publish the latest microphone level
    pub fn set_input_amplitude(&self, level: f32) {
        let level = normalize_level(level);
        self.update(|s| s.input_amplitude = level);
    }

    /// Publish the latest playback level
    pub fn set_output_amplitude(&self, level: f32) {
        let level = normalize_level(level);
        self.update(|s| s.output_amplitude = level);
    }

    fn update(&self, f: impl FnOnce(&mut StateSnapshot)) {
        self.tx.send_if_modified(|s| {
            let before = *s;
            f(s);
            *s != before
        });
    }
}

fn normalize_level(level: f32) -> f32 {
    if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) }
}
