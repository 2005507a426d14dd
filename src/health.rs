use crate::config::AppConfig;
use crate::relay::registry::RegistrySummary;
use crate::relay::RelayKind;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.config();
    let uptime_seconds = state.get_uptime_seconds();
    let sessions = state.sessions.summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "speech-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_sessions": sessions.active_sessions
        },
        "sessions": {
            "transcription": sessions.by_kind.get(&RelayKind::Transcription).copied().unwrap_or(0),
            "synthesis": sessions.by_kind.get(&RelayKind::Synthesis).copied().unwrap_or(0)
        },
        "upstreams": {
            "transcription": upstream_status(config.transcription.api_key.as_deref()),
            "synthesis": upstream_status(config.synthesis.api_key.as_deref())
        },
        "memory": get_memory_info(),
        "system": get_system_status(&sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let sessions = state.sessions.summary();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "upgrade_requests": metrics.upgrade_requests,
            "error_rate": error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "relay": state.relay_stats.snapshot(),
        "sessions": sessions,
        "memory": get_memory_info(),
        "limits": relay_limits(state.config())
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

/// Missing keys are not fatal, but sessions of that kind will fail on first use.
fn upstream_status(api_key: Option<&str>) -> serde_json::Value {
    let configured = api_key.map(|key| !key.trim().is_empty()).unwrap_or(false);
    json!({
        "api_key_configured": configured,
        "status": if configured { "ready" } else { "missing_api_key" }
    })
}

fn relay_limits(config: &AppConfig) -> serde_json::Value {
    json!({
        "max_concurrent_sessions": config.relay.max_concurrent_sessions,
        "connect_timeout_ms": config.relay.connect_timeout_ms,
        "max_chunk_len": config.relay.max_chunk_len
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available (pid {})", process::id())
    })
}

fn get_system_status(sessions: &RegistrySummary) -> serde_json::Value {
    let session_usage = if sessions.max_sessions > 0 {
        sessions.active_sessions as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": sessions.max_sessions,
        "current_sessions": sessions.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing relay.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_health_reports_missing_keys_and_sessions() {
        let mut config = AppConfig::default();
        config.synthesis.api_key = Some("key".to_string());
        let state = web::Data::new(AppState::new(config));

        let response = health_check(state).await;
        assert!(response.status().is_success());

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["upstreams"]["synthesis"]["status"], "ready");
        assert_eq!(value["upstreams"]["transcription"]["status"], "missing_api_key");
        assert_eq!(value["sessions"]["transcription"], 0);
        assert_eq!(value["system"]["status"], "normal");
    }

    #[actix_web::test]
    async fn test_metrics_include_relay_counters() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        crate::relay::RelayStats::incr(&state.relay_stats.sessions_opened);

        let response = detailed_metrics(state).await;
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["relay"]["sessions_opened"], 1);
        assert_eq!(value["limits"]["connect_timeout_ms"], 10_000);
        assert_eq!(value["sessions"]["active_sessions"], 0);
    }
}
