//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Option<T>**: API keys may legitimately be missing at startup
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, TRANSCRIPTION_API_KEY, SYNTHESIS_API_KEY, ...)
//! 2. Environment variables (APP_SERVER__PORT, APP_RELAY__CONNECT_TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## API keys:
//! Missing API keys do NOT stop the server from starting. The relay reports a
//! descriptive error to the client the first time a session needs that upstream.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::relay::chunker::DEFAULT_MAX_CHUNK_LEN;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each upstream service gets its own section so the two relays can be tuned
/// (or pointed at a test server) independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub transcription: TranscriptionConfig,
    pub synthesis: SynthesisConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Relay session tuning.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Upgrades beyond this many live sessions are refused with 503
/// - `connect_timeout_ms`: Upper bound on the upstream handshake; on expiry the session closes
/// - `heartbeat_interval_secs`: How often the server pings each client socket
/// - `client_timeout_secs`: Silence after which a client socket is considered dead
/// - `max_chunk_len`: Fragment bound (characters) used when splitting text for synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_chunk_len: usize,
}

/// Speech-to-text upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Text-to-speech upstream settings.
///
/// `voice`, `format`, `sample_rate` and `speed` are the defaults written into the
/// configuration frame; a client may override `voice` with its first message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub voice: String,
    pub format: String,
    pub sample_rate: u32,
    pub speed: f64,
    pub conversational: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            relay: RelayConfig {
                max_concurrent_sessions: 100,
                connect_timeout_ms: 10_000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_chunk_len: DEFAULT_MAX_CHUNK_LEN,
            },
            transcription: TranscriptionConfig {
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                api_key: None,
            },
            synthesis: SynthesisConfig {
                url: "wss://api.lmnt.com/v1/ai/speech/stream".to_string(),
                api_key: None,
                voice: "lily".to_string(),
                format: "mp3".to_string(),
                sample_rate: 24_000,
                speed: 1.0,
                conversational: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_RELAY__CONNECT_TIMEOUT_MS=5000`: Override the upstream connect timeout
    /// - `HOST=0.0.0.0`, `PORT=3000`: Special cases for deployment platforms
    /// - `TRANSCRIPTION_API_KEY` / `DEEPGRAM_API_KEY`: speech-to-text key
    /// - `SYNTHESIS_API_KEY` / `LMNT_API_KEY`: text-to-speech key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = first_env(&["TRANSCRIPTION_API_KEY", "DEEPGRAM_API_KEY"]) {
            settings = settings.set_override("transcription.api_key", key)?;
        }

        if let Some(key) = first_env(&["SYNTHESIS_API_KEY", "LMNT_API_KEY"]) {
            settings = settings.set_override("synthesis.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup gives a clear message instead of
    /// a session that can never connect.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.relay.max_chunk_len == 0 {
            return Err(anyhow::anyhow!("Max chunk length must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.synthesis.sample_rate == 0 {
            return Err(anyhow::anyhow!("Synthesis sample rate must be greater than 0"));
        }

        if self.synthesis.speed.is_nan() || self.synthesis.speed <= 0.0 {
            return Err(anyhow::anyhow!("Synthesis speed must be positive"));
        }

        Ok(())
    }

    /// A copy safe to show over HTTP: API keys are replaced by a presence marker.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        copy.transcription.api_key = redact(&copy.transcription.api_key);
        copy.synthesis.api_key = redact(&copy.synthesis.api_key);
        copy
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// First non-empty value among the given environment variables.
fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

fn redact(key: &Option<String>) -> Option<String> {
    key.as_ref().map(|_| "***".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.synthesis.voice, "lily");
        assert_eq!(config.synthesis.format, "mp3");
        assert_eq!(config.synthesis.sample_rate, 24_000);
        assert_eq!(config.synthesis.speed, 1.0);
        assert_eq!(config.relay.max_chunk_len, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.client_timeout_secs = config.relay.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.synthesis.speed = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_api_keys_are_valid_at_startup() {
        let config = AppConfig::default();
        assert!(config.transcription.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redacted_hides_keys() {
        let mut config = AppConfig::default();
        config.synthesis.api_key = Some("secret".to_string());

        let redacted = config.redacted();
        assert_eq!(redacted.synthesis.api_key.as_deref(), Some("***"));
        assert!(redacted.transcription.api_key.is_none());
        // Source config keeps the key
        assert_eq!(config.synthesis.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_defaults_round_trip_through_config_builder() {
        let built: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(built.relay.connect_timeout_ms, 10_000);
        assert!(built.synthesis.api_key.is_none());
    }
}
