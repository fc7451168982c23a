pub mod bridge;
pub mod config;

pub use bridge::*;
pub use config::*;

use crate::health;
use actix_web::web;

/// Routes under `/api/v1`.
pub fn api_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/bridge/status", web::get().to(get_status))
        .route("/bridge/connect", web::post().to(connect))
        .route("/bridge/disconnect", web::post().to(disconnect))
        .route("/bridge/transcript", web::get().to(get_transcript))
        .route("/config", web::get().to(get_config))
        .route("/config", web::put().to(update_config));
}
