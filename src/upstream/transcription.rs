//! # Transcription Link
//!
//! Streams raw client audio to the speech-to-text API and reports back the
//! transcript of each result frame.
//!
//! ## Protocol:
//! - **Auth**: `Authorization: Token <api key>` header on the handshake, no payload
//! - **Client → Upstream**: binary audio frames, forwarded as-is
//! - **Upstream → Client**: JSON results; `channel.alternatives[0].transcript` is extracted

use async_trait::async_trait;
use futures_util::SinkExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::socket::{self, SharedLinkState, WsSink};
use super::{LinkState, UpstreamEvent, UpstreamEvents, UpstreamLink};
use crate::error::RelayError;
use crate::relay::frame::LinkInput;

/// Result frame as sent by the transcription API (only the parts we read).
#[derive(Debug, Deserialize)]
struct TranscriptionResult {
    channel: Option<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Link to the speech-to-text API.
pub struct TranscriptionLink {
    url: String,
    api_key: String,
    state: SharedLinkState,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
}

impl TranscriptionLink {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            url,
            api_key,
            state: SharedLinkState::new(),
            sink: None,
            reader: None,
        }
    }

    /// Forward one chunk of audio.
    ///
    /// Audio may arrive before the link opens or after it closes; those chunks
    /// are dropped quietly instead of failing the session.
    pub async fn send_audio(&mut self, audio: Vec<u8>) {
        if self.state.get() != LinkState::Open {
            debug!(bytes = audio.len(), "Transcription link not open, dropping audio");
            return;
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.send(Message::Binary(audio)).await {
                warn!(error = %e, "Failed to send audio upstream");
            }
        }
    }
}

#[async_trait]
impl UpstreamLink for TranscriptionLink {
    fn name(&self) -> &'static str {
        "transcription"
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    async fn connect(&mut self, events: UpstreamEvents) -> Result<(), RelayError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| RelayError::UpstreamConnect(format!("invalid API key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        self.state.set(LinkState::Connecting);

        match socket::open(request, "transcription", self.state.clone(), events, translate).await {
            Ok((sink, reader)) => {
                self.sink = Some(sink);
                self.reader = Some(reader);
                if !self.state.open() {
                    self.close().await;
                    return Err(RelayError::UpstreamConnect(
                        "upstream closed the connection during the handshake".to_string(),
                    ));
                }
                info!("Connected to transcription upstream");
                Ok(())
            }
            Err(e) => {
                self.state.set(LinkState::Closed);
                Err(e)
            }
        }
    }

    async fn forward(&mut self, input: LinkInput) -> Result<(), RelayError> {
        match input {
            LinkInput::Audio(audio) => {
                self.send_audio(audio).await;
                Ok(())
            }
            LinkInput::Speech(_) => Err(RelayError::UnsupportedInput { link: self.name() }),
        }
    }

    async fn close(&mut self) {
        let closed_here = self.state.close();

        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing transcription socket");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if closed_here {
            info!("Transcription link closed");
        }
    }
}

impl Drop for TranscriptionLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn translate(message: Message) -> Option<UpstreamEvent> {
    match message {
        Message::Text(text) => match extract_transcript(&text) {
            Ok(Some(transcript)) => Some(UpstreamEvent::Transcript(transcript)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Ignoring transcription frame");
                None
            }
        },
        Message::Binary(bytes) => {
            debug!(bytes = bytes.len(), "Ignoring binary frame from transcription upstream");
            None
        }
        _ => None,
    }
}

/// Pull the first alternative's transcript out of a result frame.
///
/// Frames that are valid JSON but carry no (or an empty) transcript yield `None`.
fn extract_transcript(text: &str) -> Result<Option<String>, RelayError> {
    let result: TranscriptionResult =
        serde_json::from_str(text).map_err(|e| RelayError::UpstreamProtocol(e.to_string()))?;

    Ok(result
        .channel
        .and_then(|channel| channel.alternatives.into_iter().next())
        .map(|alternative| alternative.transcript)
        .filter(|transcript| !transcript.is_empty()))
}
