//! # WebSocket Relay Endpoints
//!
//! Accepts client sockets on the relay paths and binds each one to a
//! [`RelaySession`] running in its own task.
//!
//! ## Endpoints:
//! - `/ws/speech`: synthesis relay (JSON text requests in, binary audio out)
//! - `/ws/transcribe`: transcription relay (binary audio in, JSON transcripts out)
//! - anything else carrying `Upgrade: websocket` is answered 404 with
//!   `Connection: close`. actix gives handlers no raw socket to destroy, so this
//!   response stands in for dropping the connection; no handshake ever completes
//!
//! ## Actor Model:
//! Each connection is one `RelaySocket` actor. The actor only moves frames:
//! client frames go into the session's event channel, and the session's
//! outbound frames come back as a stream the actor writes to the socket. When
//! that stream ends the session is over and the actor closes the socket.

use crate::error::{AppError, AppResult};
use crate::relay::frame::{ClientFrame, RelayFrame};
use crate::relay::registry::SessionRegistry;
use crate::relay::session::{RelaySession, SessionEvent};
use crate::relay::{RelayKind, RelayStats};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::http::header::{HeaderMap, UPGRADE};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one relay connection.
pub struct RelaySocket {
    session_id: Uuid,
    kind: RelayKind,

    /// Handed to a task in `started`
    session: Option<RelaySession>,
    client_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    outbound: Option<mpsc::UnboundedReceiver<RelayFrame>>,

    /// Client events into the session
    client: mpsc::UnboundedSender<SessionEvent>,

    registry: Arc<SessionRegistry>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(
        session: RelaySession,
        client: mpsc::UnboundedSender<SessionEvent>,
        client_rx: mpsc::UnboundedReceiver<SessionEvent>,
        outbound: mpsc::UnboundedReceiver<RelayFrame>,
        registry: Arc<SessionRegistry>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            session_id: session.id(),
            kind: session.kind(),
            session: Some(session),
            client_rx: Some(client_rx),
            outbound: Some(outbound),
            client,
            registry,
            heartbeat_interval,
            client_timeout,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward_to_session(&self, frame: ClientFrame) {
        if self.client.send(SessionEvent::Message(frame)).is_err() {
            debug!(session_id = %self.session_id, "Session already finished, dropping client frame");
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, kind = %self.kind, "WebSocket connection started");

        if let (Some(session), Some(client_rx)) = (self.session.take(), self.client_rx.take()) {
            tokio::spawn(session.run(client_rx));
        }
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // No-op if the session already ended on its own
        let _ = self.client.send(SessionEvent::Disconnected);
        self.registry.remove(&self.session_id);
        info!(
            session_id = %self.session_id,
            kind = %self.kind,
            active_sessions = self.registry.active_count(),
            "WebSocket connection stopped"
        );
    }
}

/// Frames from the client socket.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.forward_to_session(ClientFrame::Text(text.to_string())),
            Ok(ws::Message::Binary(data)) => self.forward_to_session(ClientFrame::Binary(data.to_vec())),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Frames from the session, on their way to the client.
impl StreamHandler<RelayFrame> for RelaySocket {
    fn handle(&mut self, frame: RelayFrame, ctx: &mut Self::Context) {
        match frame {
            RelayFrame::Control(control) => ctx.text(control.to_json()),
            RelayFrame::Audio(audio) => ctx.binary(audio),
        }
    }

    /// The session ended: close the client socket.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Session finished, closing client socket");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// `GET /ws/speech`
pub async fn speech_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    start_relay(RelayKind::Synthesis, &req, stream, &state)
}

/// `GET /ws/transcribe`
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    start_relay(RelayKind::Transcription, &req, stream, &state)
}

/// Upgrade the request and start a relay session of the given kind.
///
/// The session is registered before the handshake, so a full registry answers
/// 503 and never switches protocols.
fn start_relay(kind: RelayKind, req: &HttpRequest, stream: web::Payload, state: &AppState) -> AppResult<HttpResponse> {
    info!(kind = %kind, peer = ?req.connection_info().peer_addr(), "New relay connection request");

    let relay = &state.config().relay;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (client_tx, client_rx) = mpsc::unbounded_channel();

    let session = RelaySession::new(
        kind,
        state.links.clone(),
        outbound_tx,
        relay.connect_timeout(),
        state.relay_stats.clone(),
    );
    let session_id = session.id();

    if let Err(message) = state
        .sessions
        .try_register(session_id, kind, session.started_at(), session.subscribe())
    {
        RelayStats::incr(&state.relay_stats.rejected_upgrades);
        warn!(kind = %kind, "Refusing relay connection: {}", message);
        return Err(AppError::ServiceUnavailable(message));
    }

    let socket = RelaySocket::new(
        session,
        client_tx,
        client_rx,
        outbound_rx,
        state.sessions.clone(),
        relay.heartbeat_interval(),
        relay.client_timeout(),
    );

    ws::start(socket, req, stream).map_err(|e| {
        state.sessions.remove(&session_id);
        AppError::BadRequest(e.to_string())
    })
}

/// Fallback for every unrouted request.
///
/// Upgrade attempts get a bare 404 with `Connection: close`; plain requests
/// get the usual JSON error body.
pub async fn reject_unknown(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if is_websocket_upgrade(req.headers()) {
        RelayStats::incr(&state.relay_stats.rejected_upgrades);
        warn!(path = %req.path(), "Refusing WebSocket upgrade on unknown path");
        return HttpResponse::NotFound().force_close().finish();
    }

    HttpResponse::NotFound().json(json!({
        "error": {
            "type": "not_found",
            "message": format!("No route for {} {}", req.method(), req.path()),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}
