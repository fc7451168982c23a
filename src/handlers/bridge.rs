use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "bridge": state.bridge.status()
    })))
}

/// Pair the hardware and open the AI session using the current configuration.
///
/// Waits for the whole workflow. A failure leaves the link states as the
/// workflow left them (visible through `/bridge/status`).
pub async fn connect(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    info!("Connect requested over HTTP");
    let status = state.bridge.connect(state.get_config()).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": status.status_line,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "bridge": status
    })))
}

pub async fn disconnect(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    info!("Disconnect requested over HTTP");
    let status = state.bridge.disconnect().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": status.status_line,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "bridge": status
    })))
}

/// Finalized records plus the ghost text of the turn in progress.
pub async fn get_transcript(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let status = state.bridge.status();
    let messages = state.bridge.history();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": messages.len(),
        "messages": messages,
        "pending": status.transcript,
        "ai_speaking": status.ai_speaking
    })))
}
