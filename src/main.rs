//! # Speech Relay Backend - Main Application Entry Point
//!
//! Actix-web server that relays browser WebSocket sessions to external
//! streaming speech APIs.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared state (config, metrics, session registry)
//! - **relay**: Per-connection session state machine, frames, text chunking
//! - **upstream**: WebSocket links to the transcription and synthesis APIs
//! - **websocket**: Relay endpoints (`/ws/speech`, `/ws/transcribe`) and socket actors
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Diagnostics endpoints (config, sessions)
//! - **error**: Error types and HTTP error responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers; polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state**
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.transcription.api_key.is_none() {
        warn!("No transcription API key configured; /ws/transcribe sessions will fail on first use");
    }
    if config.synthesis.api_key.is_none() {
        warn!("No synthesis API key configured; /ws/speech sessions will fail on first use");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(routes)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Every route of the service.
///
/// Relay paths are matched exactly; everything else falls through to
/// `reject_unknown`, which never completes a WebSocket handshake.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/sessions", web::get().to(handlers::list_sessions)),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/ws/speech", web::get().to(websocket::speech_websocket))
    .route("/ws/transcribe", web::get().to(websocket::transcribe_websocket))
    .default_service(web::to(websocket::reject_unknown));
}

/// Initialize tracing.
///
/// `RUST_LOG` controls what gets logged; if not set, defaults to
/// "speech_relay_backend=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and set the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::relay::frame::LinkInput;
    use crate::relay::RelayKind;
    use crate::upstream::testing::spawn_mock_upstream;
    use crate::upstream::{LinkFactory, LinkState, UpstreamEvent, UpstreamEvents, UpstreamLink};
    use async_trait::async_trait;
    use actix_web::http::StatusCode;
    use actix_web::test::{self, TestRequest};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{self as tungstenite, Message};

    const WAIT: Duration = Duration::from_secs(5);

    fn upgrade_request(path: &str) -> TestRequest {
        TestRequest::get()
            .uri(path)
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    /// Run the full app on an ephemeral port.
    fn serve(state: AppState) -> SocketAddr {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(middleware::MetricsMiddleware)
                .wrap(middleware::RequestLogging)
                .configure(routes)
        })
        .workers(1)
        .bind("127.0.0.1:0")
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        addr
    }

    /// Link that answers every speech request with its text as "audio".
    struct EchoLink {
        events: Option<UpstreamEvents>,
        state: LinkState,
    }

    #[async_trait]
    impl UpstreamLink for EchoLink {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn state(&self) -> LinkState {
            self.state
        }

        async fn connect(&mut self, events: UpstreamEvents) -> Result<(), RelayError> {
            self.events = Some(events);
            self.state = LinkState::Open;
            Ok(())
        }

        async fn forward(&mut self, input: LinkInput) -> Result<(), RelayError> {
            match (input, self.events.as_ref()) {
                (LinkInput::Speech(request), Some(events)) => {
                    let _ = events.send(UpstreamEvent::Audio(request.text.into_bytes()));
                    Ok(())
                }
                _ => Err(RelayError::LinkNotOpen),
            }
        }

        async fn close(&mut self) {
            self.events = None;
            self.state = LinkState::Closed;
        }
    }

    struct EchoFactory;

    impl LinkFactory for EchoFactory {
        fn create(&self, _kind: RelayKind, _first: &LinkInput) -> Result<Box<dyn UpstreamLink>, RelayError> {
            Ok(Box::new(EchoLink {
                events: None,
                state: LinkState::Unconnected,
            }))
        }
    }

    #[actix_web::test]
    async fn test_relay_paths_switch_protocols() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .configure(routes),
        )
        .await;

        for path in ["/ws/speech", "/ws/transcribe"] {
            let response = test::call_service(&app, upgrade_request(path).to_request()).await;
            assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS, "{}", path);
        }
    }

    #[actix_web::test]
    async fn test_unknown_upgrade_path_never_switches_protocols() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .configure(routes),
        )
        .await;

        for path in ["/ws/other", "/ws/speech/extra", "/", "/ws"] {
            let response = test::call_service(&app, upgrade_request(path).to_request()).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
            assert!(!response.response().head().keep_alive());
        }
    }

    #[actix_web::test]
    async fn test_plain_request_to_relay_path_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .configure(routes),
        )
        .await;

        let response = test::call_service(&app, TestRequest::get().uri("/ws/speech").to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_session_cap_refuses_upgrade() {
        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = 1;
        let state = AppState::new(config);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let first = test::call_service(&app, upgrade_request("/ws/transcribe").to_request()).await;
        assert_eq!(first.status(), StatusCode::SWITCHING_PROTOCOLS);

        let second = test::call_service(&app, upgrade_request("/ws/transcribe").to_request()).await;
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.relay_stats.snapshot().rejected_upgrades, 1);
    }

    #[actix_web::test]
    async fn test_diagnostics_routes() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .configure(routes),
        )
        .await;

        for path in ["/health", "/api/v1/health", "/api/v1/metrics", "/api/v1/config", "/api/v1/sessions"] {
            let response = test::call_service(&app, TestRequest::get().uri(path).to_request()).await;
            assert!(response.status().is_success(), "{}", path);
        }

        let response = test::call_service(&app, TestRequest::get().uri("/nope").to_request()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_unknown_path_handshake_fails_over_tcp() {
        let addr = serve(AppState::new(AppConfig::default()));

        let err = connect_async_err(&format!("ws://{}/ws/unknown", addr)).await;
        match err {
            tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 404),
            other => panic!("expected an HTTP error, got {:?}", other),
        }
    }

    async fn connect_async_err(url: &str) -> tungstenite::Error {
        match timeout(WAIT, tokio_tungstenite::connect_async(url)).await.unwrap() {
            Ok(_) => panic!("handshake unexpectedly succeeded for {}", url),
            Err(e) => e,
        }
    }

    #[actix_web::test]
    async fn test_transcription_relay_end_to_end() {
        let result_frame = serde_json::json!({
            "channel": { "alternatives": [{ "transcript": "hello world" }] }
        })
        .to_string();
        let mut mock = spawn_mock_upstream(move |message| match message {
            Message::Binary(_) => vec![Message::Text(result_frame.clone())],
            _ => Vec::new(),
        })
        .await;

        let mut config = AppConfig::default();
        config.transcription.url = mock.url.clone();
        config.transcription.api_key = Some("dg-key".to_string());
        let state = AppState::new(config);
        let addr = serve(state.clone());

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/transcribe", addr))
            .await
            .unwrap();

        let audio = vec![0u8, 1, 2, 3, 250, 251];
        client.send(Message::Binary(audio.clone())).await.unwrap();

        // Upstream got the bytes untouched, with the key in the header
        let forwarded = timeout(WAIT, mock.received.recv()).await.unwrap().unwrap();
        assert_eq!(forwarded, Message::Binary(audio));
        assert_eq!(mock.authorization.await.unwrap(), Some("Token dg-key".to_string()));

        let reply = loop {
            match timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap() {
                Message::Text(text) => break text,
                _ => continue,
            }
        };
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply, serde_json::json!({"type": "transcript", "data": "hello world"}));
        assert_eq!(state.sessions.active_count(), 1);

        client.close(None).await.unwrap();
        let closed = timeout(WAIT, async {
            while state.sessions.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(closed.is_ok(), "session was not unregistered");
    }

    #[actix_web::test]
    async fn test_synthesis_without_key_reports_error_and_closes() {
        let addr = serve(AppState::new(AppConfig::default()));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/speech", addr))
            .await
            .unwrap();
        client
            .send(Message::Text(r#"{"text":"Hello there."}"#.to_string()))
            .await
            .unwrap();

        let mut error_frames = Vec::new();
        let mut closed = false;
        while let Ok(Some(message)) = timeout(WAIT, client.next()).await {
            match message {
                Ok(Message::Text(text)) => error_frames.push(serde_json::from_str::<serde_json::Value>(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
            }
        }

        assert!(closed, "server did not close the socket");
        assert_eq!(error_frames.len(), 1);
        assert_eq!(error_frames[0]["type"], "error");
        assert_eq!(error_frames[0]["error"], "No API key configured for the synthesis service");
    }

    #[actix_web::test]
    async fn test_speech_relay_uses_configured_link_factory() {
        let state = AppState::with_link_factory(AppConfig::default(), Arc::new(EchoFactory));
        let addr = serve(state.clone());

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/speech", addr))
            .await
            .unwrap();
        client
            .send(Message::Text(r#"{"text":"Hi there."}"#.to_string()))
            .await
            .unwrap();

        let audio = loop {
            match timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap() {
                Message::Binary(audio) => break audio,
                _ => continue,
            }
        };
        assert_eq!(audio, b"Hi there.".to_vec());
        assert_eq!(state.relay_stats.snapshot().frames_to_client, 1);
    }

    #[actix_web::test]
    async fn test_silent_client_is_dropped_after_timeout() {
        let mut config = AppConfig::default();
        config.relay.heartbeat_interval_secs = 1;
        config.relay.client_timeout_secs = 2;
        let state = AppState::with_link_factory(config, Arc::new(EchoFactory));
        let addr = serve(state.clone());

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/speech", addr))
            .await
            .unwrap();
        assert_eq!(state.sessions.active_count(), 1);

        // Reading would answer the server's pings, so stay silent past the timeout
        tokio::time::sleep(Duration::from_secs(4)).await;

        let mut closed = false;
        while let Ok(next) = timeout(WAIT, client.next()).await {
            match next {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    closed = true;
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
        assert!(closed, "server kept a silent client open");

        let unregistered = timeout(WAIT, async {
            while state.sessions.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(unregistered.is_ok(), "session was not unregistered");
    }
}
