use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the running configuration with API keys redacted.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config().redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_config_never_exposes_keys() {
        let mut config = AppConfig::default();
        config.transcription.api_key = Some("dg-secret".to_string());
        let state = web::Data::new(AppState::new(config));

        let response = get_config(state).await.unwrap();
        let body = to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("dg-secret"));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["config"]["transcription"]["api_key"], "***");
        assert!(value["config"]["synthesis"]["api_key"].is_null());
        assert_eq!(value["config"]["relay"]["connect_timeout_ms"], 10_000);
    }
}
