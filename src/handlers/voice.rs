//! Voice session control for the host panel.
//!
//! `open` answers only once the session is streaming (or has failed), so
//! the panel can flip its button straight from the response.

use crate::error::{AppError, AppResult};
use crate::live::session::{SessionConfig, SessionStatus};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Per-session overrides of the configured voice and behaviour.
#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    pub voice_name: Option<String>,
    pub system_instruction: Option<String>,
}

fn session_config(state: &AppState, overrides: Option<OpenSessionRequest>) -> Result<SessionConfig, AppError> {
    let mut config = SessionConfig::from(&state.get_config());
    let overrides = overrides.unwrap_or_default();

    if let Some(voice) = overrides.voice_name {
        if voice.trim().is_empty() {
            return Err(AppError::ValidationError("voice_name cannot be empty".to_string()));
        }
        config.setup.voice_name = voice;
    }
    if let Some(instruction) = overrides.system_instruction {
        config.setup.system_instruction = instruction;
    }
    Ok(config)
}

fn status_json(status: &SessionStatus) -> serde_json::Value {
    json!({
        "state": status.state,
        "session_id": status.session_id,
        "opened_at": status.opened_at.map(|t| t.to_rfc3339()),
        "last_error": status.last_error.as_ref().map(|e| e.to_string())
    })
}

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": status_json(&state.voice.status())
    }))
}

pub async fn open_session(
    state: web::Data<AppState>,
    body: Option<web::Json<OpenSessionRequest>>,
) -> AppResult<HttpResponse> {
    let config = session_config(&state, body.map(web::Json::into_inner))?;
    let session_id = state.voice.open(config).await?;
    info!(session_id = %session_id, "Voice session opened from control API");

    Ok(HttpResponse::Ok().json(json!({
        "status": "streaming",
        "session_id": session_id,
        "session": status_json(&state.voice.status())
    })))
}

pub async fn close_session(state: web::Data<AppState>) -> HttpResponse {
    state.voice.close().await;

    HttpResponse::Ok().json(json!({
        "status": "closed",
        "session": status_json(&state.voice.status())
    }))
}

/// One button: close a live session, otherwise open one.
pub async fn toggle_session(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = session_config(&state, None)?;
    let session_id = state.voice.toggle(config).await?;

    Ok(HttpResponse::Ok().json(json!({
        "active": session_id.is_some(),
        "session_id": session_id,
        "session": status_json(&state.voice.status())
    })))
}
