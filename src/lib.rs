//! Beacon Live - realtime voice and camera capture for AI assistants
//!
//! This library streams microphone audio and camera frames to a realtime voice
//! service while a conversation is live:
//! - Conversation state with a single capture gate
//! - Gated microphone and camera capture engines
//! - Realtime session setup through a backend relay
//! - Voice swaps that reconnect without leaking user speech
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Host application                     │
//! │   UI  │  Camera feed  │  Lifecycle  │  Playback      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  VoiceSession                        │
//! │  ConversationState │ Audio/Camera engines │ Swap     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   RealtimeConnection  →  relay ticket  →  websocket  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;
pub mod state;
pub mod swap;

pub use capture::{
    AudioCaptureEngine, AudioSource, CameraCaptureEngine, CaptureFrame, EncodedFrame,
    VideoSource, Visibility,
};
pub use config::Config;
pub use error::{Error, Result};
pub use realtime::{ConnectionEvent, RealtimeConnection, SessionConfig};
pub use session::{SessionParts, VoiceSession};
pub use state::{CameraFacing, ConversationState, Phase, StateSnapshot, Voice};
pub use swap::{SwapConfig, SwapOutcome, VoiceSwapCoordinator};
