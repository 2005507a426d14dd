//! # Upstream Speech Links
//!
//! An upstream link is one WebSocket connection to an external streaming speech
//! API, owned by exactly one relay session. Two variants exist:
//! - **TranscriptionLink**: client audio in, transcript text out
//! - **SynthesisLink**: client text in, audio (plus metadata) out
//!
//! ## Lifecycle:
//! `Unconnected → Connecting → Open → Closed`. Links are created lazily by a
//! [`LinkFactory`] when a session sees its first client message, and are never
//! reused after they close.
//!
//! ## Inbound frames:
//! Whatever the upstream sends is translated into [`UpstreamEvent`]s and pushed
//! into the channel handed to [`UpstreamLink::connect`].

pub mod socket;
pub mod synthesis;
pub mod transcription;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::relay::frame::LinkInput;
use crate::relay::RelayKind;
use synthesis::{SynthesisLink, SynthesisOptions};
use transcription::TranscriptionLink;

/// Connection state of an upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Unconnected = 0,
    Connecting = 1,
    Open = 2,
    Closed = 3,
}

/// Something the upstream told us, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Recognised text from the transcription API
    Transcript(String),
    /// Synthesized audio bytes, untouched
    Audio(Vec<u8>),
    /// Any other JSON the synthesis API sends (timings, `buffer_empty`, ...)
    Metadata(serde_json::Value),
    /// Error message reported by the upstream itself
    Error(String),
    /// The upstream closed the connection on its own
    Closed,
}

/// Sending side of a session's upstream event channel.
pub type UpstreamEvents = mpsc::UnboundedSender<UpstreamEvent>;

/// A connection to one external streaming speech API.
///
/// ## Contract:
/// - `connect` registers the event sender before the socket opens, so no
///   upstream frame can be lost
/// - `forward` hands one decoded client message to the upstream
/// - `close` is idempotent and never fails
#[async_trait]
pub trait UpstreamLink: Send {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    fn state(&self) -> LinkState;

    async fn connect(&mut self, events: UpstreamEvents) -> Result<(), RelayError>;

    async fn forward(&mut self, input: LinkInput) -> Result<(), RelayError>;

    async fn close(&mut self);
}

/// Builds the link a session needs, from the first message it received.
pub trait LinkFactory: Send + Sync {
    fn create(&self, kind: RelayKind, first: &LinkInput) -> Result<Box<dyn UpstreamLink>, RelayError>;
}

/// Production factory: real WebSocket links configured from [`AppConfig`].
pub struct UpstreamConnector {
    config: AppConfig,
}

impl UpstreamConnector {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }
}

impl LinkFactory for UpstreamConnector {
    fn create(&self, kind: RelayKind, first: &LinkInput) -> Result<Box<dyn UpstreamLink>, RelayError> {
        match kind {
            RelayKind::Transcription => {
                let api_key = required_key(&self.config.transcription.api_key, "transcription")?;
                Ok(Box::new(TranscriptionLink::new(
                    self.config.transcription.url.clone(),
                    api_key,
                )))
            }
            RelayKind::Synthesis => {
                let api_key = required_key(&self.config.synthesis.api_key, "synthesis")?;
                let mut options = SynthesisOptions::from_config(&self.config.synthesis);

                // The first request may pick the voice for the whole session
                if let LinkInput::Speech(request) = first {
                    if let Some(voice) = request.voice.as_ref().filter(|v| !v.trim().is_empty()) {
                        options.voice = voice.clone();
                    }
                }

                Ok(Box::new(SynthesisLink::new(
                    self.config.synthesis.url.clone(),
                    api_key,
                    options,
                    self.config.relay.max_chunk_len,
                )))
            }
        }
    }
}

fn required_key(key: &Option<String>, service: &'static str) -> Result<String, RelayError> {
    key.as_ref()
        .filter(|k| !k.trim().is_empty())
        .cloned()
        .ok_or(RelayError::MissingApiKey { service })
}
