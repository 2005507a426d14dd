//! # Relay Session
//!
//! One `RelaySession` per accepted client socket. It owns at most one upstream
//! link, created lazily from the first valid client message, and moves frames
//! between the two sides.
//!
//! ## States:
//! ```text
//!   Idle ──first message──▶ Linking ──connect ok──▶ Active
//!     │                        │                      │
//!     └──────client gone───────┴─connect failed/──────┴──client gone──▶ Closed
//!                                timeout/client gone
//! ```
//!
//! ## Ordering:
//! Messages that arrive while the link is connecting are queued and flushed in
//! arrival order as soon as it opens, so the upstream sees exactly the client's
//! sequence.
//!
//! ## Failure policy:
//! - Connect failure, connect timeout or missing API key: one error frame, then
//!   the session closes (the client reconnects to retry)
//! - Upstream-reported errors and bad client messages: one error frame, the
//!   session keeps running

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::frame::{ClientFrame, ControlFrame, LinkInput, RelayFrame};
use super::{RelayKind, RelayStats};
use crate::error::RelayError;
use crate::upstream::{LinkFactory, LinkState, UpstreamEvent, UpstreamEvents, UpstreamLink};

/// Lifecycle state of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No upstream link yet
    Idle,
    /// Upstream link is connecting; client messages are queued
    Linking,
    /// Link open, frames flow both ways
    Active,
    /// Terminal
    Closed,
}

/// Things that move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ClientMessage,
    LinkReady,
    LinkFailed,
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub trigger: Trigger,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not valid in state {}", self.trigger, self.from)
    }
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Linking => "linking",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }

    /// The single transition function of the session.
    pub fn on(self, trigger: Trigger) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;

        match (self, trigger) {
            (Idle, Trigger::ClientMessage) | (Linking, Trigger::ClientMessage) => Ok(Linking),
            (Active, Trigger::ClientMessage) => Ok(Active),
            (Linking, Trigger::LinkReady) => Ok(Active),
            (Linking, Trigger::LinkFailed) => Ok(Closed),
            (Idle, Trigger::ClientGone) | (Linking, Trigger::ClientGone) | (Active, Trigger::ClientGone) => {
                Ok(Closed)
            }
            (from, trigger) => Err(InvalidTransition { from, trigger }),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client socket tells its session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(ClientFrame),
    /// Socket closed or errored; always terminal
    Disconnected,
}

/// State for one client connection.
pub struct RelaySession {
    id: Uuid,
    kind: RelayKind,
    started_at: DateTime<Utc>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    link: Option<Box<dyn UpstreamLink>>,
    pending: VecDeque<LinkInput>,
    factory: Arc<dyn LinkFactory>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
    connect_timeout: Duration,
    stats: Arc<RelayStats>,
}

impl RelaySession {
    pub fn new(
        kind: RelayKind,
        factory: Arc<dyn LinkFactory>,
        outbound: mpsc::UnboundedSender<RelayFrame>,
        connect_timeout: Duration,
        stats: Arc<RelayStats>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            state: SessionState::Idle,
            state_tx,
            link: None,
            pending: VecDeque::new(),
            factory,
            outbound,
            connect_timeout,
            stats,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> RelayKind {
        self.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Follow this session's state from elsewhere (registry, tests).
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Process client and upstream events until the session closes.
    ///
    /// Events are handled one at a time, so no locking is needed inside a
    /// session. Returns the final state, which is always `Closed`.
    pub async fn run(mut self, mut client: mpsc::UnboundedReceiver<SessionEvent>) -> SessionState {
        RelayStats::incr(&self.stats.sessions_opened);
        info!(session_id = %self.id, kind = %self.kind, "Relay session started");

        let (upstream_tx, mut upstream_rx) = mpsc::unbounded_channel();

        while self.state != SessionState::Closed {
            tokio::select! {
                event = client.recv() => match event {
                    Some(SessionEvent::Message(frame)) => {
                        self.on_client_frame(frame, &upstream_tx, &mut client).await;
                    }
                    Some(SessionEvent::Disconnected) | None => self.on_client_gone().await,
                },
                Some(event) = upstream_rx.recv() => self.on_upstream_event(event),
            }
        }

        let lifetime = Utc::now().signed_duration_since(self.started_at);
        info!(
            session_id = %self.id,
            kind = %self.kind,
            duration_ms = lifetime.num_milliseconds(),
            "Relay session closed"
        );
        self.state
    }

    async fn on_client_frame(
        &mut self,
        frame: ClientFrame,
        upstream_tx: &UpstreamEvents,
        client: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let input = match LinkInput::decode(self.kind, frame) {
            Ok(input) => input,
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "Rejected client message");
                self.send_error(&e);
                return;
            }
        };

        match self.state {
            SessionState::Idle => self.establish(input, upstream_tx, client).await,
            SessionState::Active => {
                self.transition(Trigger::ClientMessage);
                self.forward(input).await;
            }
            // Linking is handled inside `establish`, Closed ends the loop
            SessionState::Linking | SessionState::Closed => self.transition(Trigger::ClientMessage),
        }
    }

    /// Idle → Linking → Active (or Closed), with the triggering message queued first.
    async fn establish(
        &mut self,
        first: LinkInput,
        upstream_tx: &UpstreamEvents,
        client: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        self.transition(Trigger::ClientMessage);

        let mut link = match self.factory.create(self.kind, &first) {
            Ok(link) => link,
            Err(e) => {
                self.fail_link(&e);
                return;
            }
        };
        debug!(session_id = %self.id, link = link.name(), "Connecting upstream link");
        self.pending.push_back(first);

        let outcome = {
            let connect = tokio::time::timeout(self.connect_timeout, link.connect(upstream_tx.clone()));
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    event = client.recv() => match event {
                        Some(SessionEvent::Message(frame)) => match LinkInput::decode(self.kind, frame) {
                            Ok(input) => {
                                self.transition(Trigger::ClientMessage);
                                self.pending.push_back(input);
                            }
                            Err(e) => self.send_error(&e),
                        },
                        Some(SessionEvent::Disconnected) | None => break None,
                    },
                }
            }
        };

        match outcome {
            Some(Ok(Ok(()))) => {
                self.link = Some(link);
                self.transition(Trigger::LinkReady);
                debug!(session_id = %self.id, queued = self.pending.len(), "Upstream link open, flushing queue");

                while let Some(input) = self.pending.pop_front() {
                    self.forward(input).await;
                }
            }
            Some(Ok(Err(e))) => {
                link.close().await;
                self.fail_link(&e);
            }
            Some(Err(_)) => {
                link.close().await;
                let timeout_ms = self.connect_timeout.as_millis() as u64;
                self.fail_link(&RelayError::ConnectTimeout { timeout_ms });
            }
            None => {
                debug!(session_id = %self.id, "Client left while upstream was connecting");
                link.close().await;
                self.pending.clear();
                self.transition(Trigger::ClientGone);
            }
        }
    }

    async fn forward(&mut self, input: LinkInput) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let bytes = input.payload_len();
        let was_open = link.state() == LinkState::Open;

        match link.forward(input).await {
            Ok(()) if was_open => {
                RelayStats::incr(&self.stats.frames_to_upstream);
                debug!(session_id = %self.id, bytes, "Forwarded client message upstream");
            }
            Ok(()) => {}
            Err(e) => self.send_error(&e),
        }
    }

    fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Closed => {
                if self.state == SessionState::Active {
                    warn!(session_id = %self.id, kind = %self.kind, "Upstream closed the link");
                    self.send_error(&RelayError::UpstreamClosed);
                }
            }
            event => {
                if let Some(frame) = RelayFrame::from_event(event) {
                    if frame.is_error() {
                        RelayStats::incr(&self.stats.error_frames);
                        warn!(session_id = %self.id, "Upstream reported an error");
                    }
                    self.send(frame);
                }
            }
        }
    }

    async fn on_client_gone(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.pending.clear();
        self.transition(Trigger::ClientGone);
    }

    /// Connect-phase failure: one error frame, then Closed.
    fn fail_link(&mut self, err: &RelayError) {
        RelayStats::incr(&self.stats.connect_failures);
        warn!(session_id = %self.id, kind = %self.kind, error = %err, "Upstream link failed");
        self.send_error(err);
        self.pending.clear();
        self.transition(Trigger::LinkFailed);
    }

    fn send_error(&self, err: &RelayError) {
        RelayStats::incr(&self.stats.error_frames);
        self.send(RelayFrame::Control(ControlFrame::error(err)));
    }

    fn send(&self, frame: RelayFrame) {
        if self.outbound.send(frame).is_ok() {
            RelayStats::incr(&self.stats.frames_to_client);
        } else {
            debug!(session_id = %self.id, "Client socket gone, dropping frame");
        }
    }

    fn transition(&mut self, trigger: Trigger) {
        match self.state.on(trigger) {
            Ok(next) if next != self.state => {
                debug!(session_id = %self.id, from = %self.state, to = %next, "Session state change");
                self.state = next;
                self.state_tx.send_replace(next);
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %self.id, "Ignoring event: {}", e),
        }
    }
}
