//! Frames exchanged with the client socket.
//!
//! ## Server → client:
//! ```json
//! {"type": "transcript", "data": "hello there"}
//! {"type": "metadata", "data": {"durations": [...], "buffer_empty": true}}
//! {"type": "error", "error": "upstream connection closed"}
//! ```
//! plus raw binary audio, passed through untouched.
//!
//! ## Client → server:
//! - `/ws/transcribe`: binary audio frames
//! - `/ws/speech`: `{"text": "...", "voice": "..."}` in a text or binary frame

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RelayKind;
use crate::error::RelayError;
use crate::upstream::UpstreamEvent;

/// JSON control frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Transcript { data: String },
    Metadata { data: Value },
    Error { error: String },
}

impl ControlFrame {
    pub fn error(err: &RelayError) -> Self {
        ControlFrame::Error {
            error: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and already-parsed JSON values inside, serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","error":"internal error"}"#.to_string())
    }
}

/// One frame on its way to the client socket.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Control(ControlFrame),
    Audio(Vec<u8>),
}

impl RelayFrame {
    /// Translate an upstream event into what the client sees.
    ///
    /// `Closed` has no direct translation; the session decides what it means.
    pub fn from_event(event: UpstreamEvent) -> Option<Self> {
        match event {
            UpstreamEvent::Transcript(data) => Some(RelayFrame::Control(ControlFrame::Transcript { data })),
            UpstreamEvent::Audio(audio) => Some(RelayFrame::Audio(audio)),
            UpstreamEvent::Metadata(data) => Some(RelayFrame::Control(ControlFrame::Metadata { data })),
            UpstreamEvent::Error(message) => {
                Some(RelayFrame::Control(ControlFrame::error(&RelayError::UpstreamReported(message))))
            }
            UpstreamEvent::Closed => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RelayFrame::Control(ControlFrame::Error { .. }))
    }
}

/// One data frame received from the client socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Body of a synthesis request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
}

/// A client frame decoded for a specific relay kind.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkInput {
    Audio(Vec<u8>),
    Speech(SpeechRequest),
}

impl LinkInput {
    pub fn decode(kind: RelayKind, frame: ClientFrame) -> Result<Self, RelayError> {
        match (kind, frame) {
            (RelayKind::Transcription, ClientFrame::Binary(audio)) => Ok(LinkInput::Audio(audio)),
            (RelayKind::Transcription, ClientFrame::Text(_)) => Err(RelayError::InvalidClientMessage(
                "expected binary audio frames".to_string(),
            )),
            (RelayKind::Synthesis, ClientFrame::Text(text)) => speech_request(text.as_bytes()),
            (RelayKind::Synthesis, ClientFrame::Binary(bytes)) => speech_request(&bytes),
        }
    }

    /// Payload size, for logging.
    pub fn payload_len(&self) -> usize {
        match self {
            LinkInput::Audio(audio) => audio.len(),
            LinkInput::Speech(request) => request.text.len(),
        }
    }
}

fn speech_request(bytes: &[u8]) -> Result<LinkInput, RelayError> {
    let request: SpeechRequest = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::InvalidClientMessage(format!("expected {{\"text\", \"voice\"?}} JSON: {}", e)))?;
    Ok(LinkInput::Speech(request))
}
