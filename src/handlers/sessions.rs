use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`: live relay sessions, oldest first.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.sessions.list();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_sessions": state.sessions.max_sessions(),
        "sessions": sessions
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::session::SessionState;
    use crate::relay::RelayKind;
    use actix_web::body::to_bytes;
    use tokio::sync::watch;
    use uuid::Uuid;

    #[actix_web::test]
    async fn test_list_sessions() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let id = Uuid::new_v4();
        let (_tx, rx) = watch::channel(SessionState::Linking);
        state
            .sessions
            .try_register(id, RelayKind::Synthesis, chrono::Utc::now(), rx)
            .unwrap();

        let response = list_sessions(state).await.unwrap();
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["count"], 1);
        assert_eq!(value["sessions"][0]["id"], id.to_string());
        assert_eq!(value["sessions"][0]["kind"], "synthesis");
        assert_eq!(value["sessions"][0]["state"], "linking");
    }
}
