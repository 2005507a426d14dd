//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every actix worker thread holds a clone of `AppState`; the `Arc`s inside
//!   make those clones point at the same data
//!
//! ### RwLock (Reader-Writer Lock)
//! - Many readers OR one writer; used for the HTTP metrics map, which every
//!   request updates
//! - Locks are only held for a few field updates and never across `.await`
//!
//! ### Atomics
//! - Relay counters are bumped from session tasks on every frame, so they are
//!   plain `AtomicU64`s instead of fields behind a lock
//!
//! ## What is NOT shared:
//! Relay sessions themselves. Each session's link and frame queue are owned by
//! its own task; only bookkeeping (registry, counters) lives here.

use crate::config::AppConfig;
use crate::relay::registry::SessionRegistry;
use crate::relay::RelayStats;
use crate::upstream::{LinkFactory, UpstreamConnector};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all request handlers.
///
/// ## Fields:
/// - `config`: read-only after startup, so a plain `Arc`
/// - `metrics`: HTTP request metrics, updated by `MetricsMiddleware`
/// - `relay_stats`: frame and session counters, updated by relay sessions
/// - `sessions`: live session registry (cap enforcement, diagnostics)
/// - `links`: builds upstream links; `with_link_factory` swaps in another one
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub relay_stats: Arc<RelayStats>,
    pub sessions: Arc<SessionRegistry>,
    pub links: Arc<dyn LinkFactory>,
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Upgrade requests (`Upgrade: websocket`) seen, accepted or not
    pub upgrade_requests: u64,

    /// Key: endpoint (e.g. "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one endpoint.
///
/// ## Calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
///
/// For WebSocket endpoints the duration is the upgrade only, not the session.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// State wired to the real upstream speech APIs.
    pub fn new(config: AppConfig) -> Self {
        let links = Arc::new(UpstreamConnector::new(config.clone()));
        Self::with_link_factory(config, links)
    }

    /// State with a custom link factory.
    pub fn with_link_factory(config: AppConfig, links: Arc<dyn LinkFactory>) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new(config.relay.max_concurrent_sessions)),
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay_stats: Arc::new(RelayStats::default()),
            links,
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.update_metrics(|metrics| metrics.request_count += 1);
    }

    /// Increment the total error counter (any 4xx or 5xx response).
    pub fn increment_error_count(&self) {
        self.update_metrics(|metrics| metrics.error_count += 1);
    }

    pub fn increment_upgrade_requests(&self) {
        self.update_metrics(|metrics| metrics.upgrade_requests += 1);
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time we see an endpoint a new `EndpointMetric` is created with
    /// default values; later requests update it.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.update_metrics(|metrics| {
            let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;

            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning releases the lock before the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn update_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);
        state.increment_request_count();
        state.increment_upgrade_requests();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 1);
        assert_eq!(metrics.upgrade_requests, 1);

        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_registry_uses_configured_cap() {
        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = 3;
        let state = AppState::new(config);
        assert_eq!(state.sessions.max_sessions(), 3);
        assert_eq!(state.sessions.active_count(), 0);
    }
}
