//! Wire messages exchanged with the realtime voice service

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::capture::CaptureFrame;

/// Speaker of a conversation item or transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Message sent to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// One block of little-endian PCM16 mono audio
    AudioAppend {
        #[serde(with = "base64_bytes")]
        audio: Vec<u8>,
    },
    /// One JPEG camera frame
    VideoFrame {
        #[serde(with = "base64_bytes")]
        image: Vec<u8>,
        mime_type: String,
    },
    /// A typed conversation turn
    ConversationItem { role: Role, content: String },
    /// Ask the service to generate a response now
    ResponseCreate,
}

impl From<CaptureFrame> for ClientMessage {
    fn from(frame: CaptureFrame) -> Self {
        match frame {
            CaptureFrame::Audio(audio) => Self::AudioAppend { audio },
            CaptureFrame::Video(frame) => Self::VideoFrame {
                image: frame.jpeg,
                mime_type: "image/jpeg".to_string(),
            },
        }
    }
}

/// Event received from the service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// The channel is configured and usable
    SessionReady {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// The assistant began working on a response
    ResponseStarted,
    /// A chunk of little-endian PCM16 response audio
    AudioDelta {
        #[serde(with = "base64_bytes")]
        audio: Vec<u8>,
    },
    /// Transcribed speech for either side
    Transcript { role: Role, text: String },
    /// The assistant finished its turn
    #[serde(alias = "response-done")]
    TurnComplete,
    /// Service-side failure
    Error {
        #[serde(default)]
        recoverable: bool,
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    /// Any event type this client does not consume
    #[serde(other)]
    Unknown,
}

/// Error codes treated as transient even when the service omits the flag
const TRANSIENT_CODES: &[&str] = &[
    "rate_limit_exceeded",
    "server_error",
    "timeout",
    "service_unavailable",
];

/// Map a service `error` event onto the crate error taxonomy
///
/// This is the single place where protocol errors are classified. An explicit
/// `recoverable` flag wins, then known transient codes; everything else
/// (malformed session, auth failure, unknown codes) is fatal.
#[must_use]
pub fn classify_error(recoverable: bool, code: Option<&str>, message: &str) -> Error {
    let transient = code.is_some_and(|c| TRANSIENT_CODES.contains(&c));
    let detail = code.map_or_else(|| message.to_string(), |c| format!("{c}: {message}"));
    if recoverable || transient {
        Error::RecoverableProtocol(detail)
    } else {
        Error::FatalProtocol(detail)
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EncodedFrame;

    #[test]
    fn audio_append_encodes_base64() {
        let msg = ClientMessage::AudioAppend {
            audio: vec![0x00, 0x80, 0xFF, 0x7F],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "audio-append");
        assert_eq!(json["audio"], "AID/fw==");
    }

    #[test]
    fn response_create_has_only_a_type() {
        let json = serde_json::to_value(ClientMessage::ResponseCreate).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "response-create" }));
    }

    #[test]
    fn conversation_item_shape() {
        let msg = ClientMessage::ConversationItem {
            role: Role::User,
            content: "hello".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "conversation-item", "role": "user", "content": "hello" })
        );
    }

    #[test]
    fn video_frames_become_video_messages() {
        let frame = CaptureFrame::Video(EncodedFrame {
            jpeg: vec![0xFF, 0xD8],
            width: 2,
            height: 2,
        });
        let json = serde_json::to_value(ClientMessage::from(frame)).unwrap();
        assert_eq!(json["type"], "video-frame");
        assert_eq!(json["mime_type"], "image/jpeg");
        assert_eq!(json["image"], "/9g=");
    }

    #[test]
    fn parses_known_events() {
        let ready: ServerEvent = serde_json::from_str(r#"{"type":"session-ready"}"#).unwrap();
        assert_eq!(ready, ServerEvent::SessionReady { session_id: None });

        let done: ServerEvent =
            serde_json::from_str(r#"{"type":"response-done","response":{"id":"r1"}}"#).unwrap();
        assert_eq!(done, ServerEvent::TurnComplete);

        let delta: ServerEvent =
            serde_json::from_str(r#"{"type":"audio-delta","audio":"AAE="}"#).unwrap();
        assert_eq!(delta, ServerEvent::AudioDelta { audio: vec![0, 1] });
    }

    #[test]
    fn unknown_events_are_tolerated() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"rate-limits-updated","limits":[]}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn error_flag_defaults_to_fatal() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"error","message":"invalid session"}"#).unwrap();
        let ServerEvent::Error {
            recoverable,
            code,
            message,
        } = event
        else {
            panic!("expected error event");
        };
        assert!(matches!(
            classify_error(recoverable, code.as_deref(), &message),
            Error::FatalProtocol(_)
        ));
    }

    #[test]
    fn transient_codes_are_recoverable() {
        assert!(matches!(
            classify_error(false, Some("rate_limit_exceeded"), "slow down"),
            Error::RecoverableProtocol(_)
        ));
        assert!(matches!(
            classify_error(true, None, "hiccup"),
            Error::RecoverableProtocol(_)
        ));
        assert!(matches!(
            classify_error(false, Some("invalid_api_key"), "bad key"),
            Error::FatalProtocol(_)
        ));
    }
}
