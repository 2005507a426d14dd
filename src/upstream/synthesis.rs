//! # Synthesis Link
//!
//! Sends client text to the text-to-speech API and streams the generated audio back.
//!
//! ## Protocol:
//! 1. **Setup**: right after the socket opens, one JSON frame carrying the API key,
//!    voice, audio format, sample rate, speed and the `return_extras` /
//!    `conversational` flags. The upstream does not acknowledge it.
//! 2. **Text**: each sentence-aligned fragment as `{"text": "..."}`, followed by
//!    `{"flush": true}` so the upstream emits audio without waiting for more text.
//! 3. **Results**: binary frames are audio; text frames are JSON extras. An `error`
//!    field is an upstream failure, everything else is passed on as metadata.
//! 4. **Shutdown**: `{"eof": true}` then a close frame.

use async_trait::async_trait;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::socket::{self, SharedLinkState, WsSink};
use super::{LinkState, UpstreamEvent, UpstreamEvents, UpstreamLink};
use crate::config::SynthesisConfig;
use crate::error::RelayError;
use crate::relay::chunker;
use crate::relay::frame::LinkInput;

/// Voice settings sent in the setup frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub voice: String,
    pub format: String,
    pub sample_rate: u32,
    pub speed: f64,
    pub conversational: bool,
}

impl SynthesisOptions {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            format: config.format.clone(),
            sample_rate: config.sample_rate,
            speed: config.speed,
            conversational: config.conversational,
        }
    }
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            voice: "lily".to_string(),
            format: "mp3".to_string(),
            sample_rate: 24_000,
            speed: 1.0,
            conversational: true,
        }
    }
}

#[derive(Serialize)]
struct SetupFrame<'a> {
    #[serde(rename = "X-API-Key")]
    api_key: &'a str,
    voice: &'a str,
    format: &'a str,
    sample_rate: u32,
    speed: f64,
    return_extras: bool,
    conversational: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Command<'a> {
    Text { text: &'a str },
    Flush { flush: bool },
    Eof { eof: bool },
}

impl Command<'_> {
    fn to_message(&self) -> Result<Message, RelayError> {
        serde_json::to_string(self)
            .map(Message::Text)
            .map_err(|e| RelayError::UpstreamProtocol(e.to_string()))
    }
}

/// Link to the text-to-speech API.
pub struct SynthesisLink {
    url: String,
    api_key: String,
    options: SynthesisOptions,
    max_chunk_len: usize,
    state: SharedLinkState,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
}

impl SynthesisLink {
    pub fn new(url: String, api_key: String, options: SynthesisOptions, max_chunk_len: usize) -> Self {
        Self {
            url,
            api_key,
            options,
            max_chunk_len,
            state: SharedLinkState::new(),
            sink: None,
            reader: None,
        }
    }

    /// Send `text` as sentence-aligned fragments followed by a flush.
    ///
    /// Fails only when the link was never opened. If the link stops being open
    /// partway through, the remaining frames of this call are skipped.
    pub async fn synthesize(&mut self, text: &str) -> Result<(), RelayError> {
        if self.state.get() != LinkState::Open || self.sink.is_none() {
            return Err(RelayError::LinkNotOpen);
        }

        let fragments = chunker::chunk(text, self.max_chunk_len);
        debug!(fragments = fragments.len(), chars = text.chars().count(), "Sending text upstream");

        for fragment in &fragments {
            if !self.send_command(Command::Text { text: fragment }).await {
                return Ok(());
            }
        }
        self.send_command(Command::Flush { flush: true }).await;

        Ok(())
    }

    async fn send_setup(&mut self) -> Result<(), RelayError> {
        let setup = SetupFrame {
            api_key: &self.api_key,
            voice: &self.options.voice,
            format: &self.options.format,
            sample_rate: self.options.sample_rate,
            speed: self.options.speed,
            return_extras: true,
            conversational: self.options.conversational,
        };
        let setup = serde_json::to_string(&setup).map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

        match self.sink.as_mut() {
            Some(sink) => sink
                .send(Message::Text(setup))
                .await
                .map_err(|e| RelayError::UpstreamConnect(e.to_string())),
            None => Err(RelayError::LinkNotOpen),
        }
    }

    /// Send one command if the link is open. Returns false when nothing was sent.
    async fn send_command(&mut self, command: Command<'_>) -> bool {
        if self.state.get() != LinkState::Open {
            return false;
        }

        let message = match command.to_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to encode synthesis command");
                return false;
            }
        };

        match self.sink.as_mut() {
            Some(sink) => match sink.send(message).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to send synthesis command");
                    false
                }
            },
            None => false,
        }
    }
}

#[async_trait]
impl UpstreamLink for SynthesisLink {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    async fn connect(&mut self, events: UpstreamEvents) -> Result<(), RelayError> {
        self.state.set(LinkState::Connecting);

        let (sink, reader) =
            match socket::open(self.url.as_str(), "synthesis", self.state.clone(), events, translate).await {
                Ok(opened) => opened,
                Err(e) => {
                    self.state.set(LinkState::Closed);
                    return Err(e);
                }
            };
        // Stored before the setup send: a cancelled connect is cleaned up by `close` or `Drop`
        self.sink = Some(sink);
        self.reader = Some(reader);

        if let Err(e) = self.send_setup().await {
            self.close().await;
            return Err(e);
        }

        if !self.state.open() {
            self.close().await;
            return Err(RelayError::UpstreamConnect(
                "upstream closed the connection during setup".to_string(),
            ));
        }

        info!(voice = %self.options.voice, format = %self.options.format, "Connected to synthesis upstream");
        Ok(())
    }

    async fn forward(&mut self, input: LinkInput) -> Result<(), RelayError> {
        match input {
            LinkInput::Speech(request) => self.synthesize(&request.text).await,
            LinkInput::Audio(_) => Err(RelayError::UnsupportedInput { link: self.name() }),
        }
    }

    async fn close(&mut self) {
        if self.state.get() == LinkState::Open && !self.send_command(Command::Eof { eof: true }).await {
            debug!("Could not send eof to synthesis upstream");
        }

        let closed_here = self.state.close();

        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing synthesis socket");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if closed_here {
            info!("Synthesis link closed");
        }
    }
}

impl Drop for SynthesisLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn translate(message: Message) -> Option<UpstreamEvent> {
    match message {
        Message::Binary(audio) => Some(UpstreamEvent::Audio(audio)),
        Message::Text(text) => {
            let extras: serde_json::Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %RelayError::UpstreamProtocol(e.to_string()), "Ignoring synthesis frame");
                    return None;
                }
            };

            if let Some(error) = extras.get("error") {
                let message = error
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Some(UpstreamEvent::Error(message));
            }

            Some(UpstreamEvent::Metadata(extras))
        }
        _ => None,
    }
}
