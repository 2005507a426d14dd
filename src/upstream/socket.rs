//! Shared WebSocket plumbing for upstream links.
//!
//! Each link owns the write half of its socket; the read half runs in a spawned
//! task that turns upstream messages into [`UpstreamEvent`]s and pushes them into
//! the owning session's channel.

use futures_util::stream::{SplitSink, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{LinkState, UpstreamEvent, UpstreamEvents};
use crate::error::RelayError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;

/// Link state readable by both the link and its reader task.
#[derive(Debug, Clone)]
pub(crate) struct SharedLinkState(Arc<AtomicU8>);

impl SharedLinkState {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(LinkState::Unconnected as u8)))
    }

    pub(crate) fn get(&self) -> LinkState {
        match self.0.load(Ordering::SeqCst) {
            0 => LinkState::Unconnected,
            1 => LinkState::Connecting,
            2 => LinkState::Open,
            _ => LinkState::Closed,
        }
    }

    pub(crate) fn set(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `Connecting` to `Open`.
    ///
    /// Fails when the reader task already saw the upstream go away.
    pub(crate) fn open(&self) -> bool {
        self.0
            .compare_exchange(
                LinkState::Connecting as u8,
                LinkState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Closed`, returning whether this call did the transition.
    pub(crate) fn close(&self) -> bool {
        self.0.swap(LinkState::Closed as u8, Ordering::SeqCst) != LinkState::Closed as u8
    }
}

/// Open a socket and start its reader task.
///
/// `translate` maps each upstream data frame to at most one event. When the
/// upstream goes away on its own, a single [`UpstreamEvent::Closed`] is sent.
pub(crate) async fn open<R, F>(
    request: R,
    label: &'static str,
    state: SharedLinkState,
    events: UpstreamEvents,
    mut translate: F,
) -> Result<(WsSink, JoinHandle<()>), RelayError>
where
    R: IntoClientRequest + Unpin,
    F: FnMut(Message) -> Option<UpstreamEvent> + Send + 'static,
{
    let (socket, response) = connect_async(request)
        .await
        .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

    debug!(link = label, status = %response.status(), "Upstream handshake complete");

    let (sink, mut stream) = socket.split();

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(frame)) => {
                    debug!(link = label, ?frame, "Upstream sent close frame");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(message) => {
                    if let Some(event) = translate(message) {
                        if events.send(event).is_err() {
                            // Session is gone, nobody left to read
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(link = label, error = %e, "Upstream socket error");
                    break;
                }
            }
        }

        if state.close() {
            debug!(link = label, "Upstream connection closed by remote");
            let _ = events.send(UpstreamEvent::Closed);
        }
    });

    Ok((sink, reader))
}
