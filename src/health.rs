use crate::controller::LinkStatus;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let status = state.bridge.status();

    // The service is healthy as long as it answers; link errors are reported, not fatal.
    let degraded = status.hardware == LinkStatus::Error || status.ai == LinkStatus::Error;

    HttpResponse::Ok().json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-bridge",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "bridge": {
            "hardware": status.hardware,
            "ai": status.ai,
            "device": status.device,
            "ai_speaking": status.ai_speaking
        },
        "capabilities": {
            "ble": cfg!(feature = "ble"),
            "speaker": cfg!(feature = "speaker"),
            "replay": !config.device.replay_file.is_empty(),
            "playback_backend": config.playback.backend,
            "api_key_configured": !config.session.api_key.is_empty()
        },
        "metrics": status.metrics
    }))
}
