//! # Voice Bridge - Main Application Entry Point
//!
//! Bridges a BLE microphone peripheral to a realtime AI voice session and plays
//! the AI's speech back locally.
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, `config.toml`, environment variables)
//! - **audio**: PCM codec, inbound relay, playback scheduler and outputs
//! - **hardware**: the microphone link (BLE, replay file)
//! - **session**: the realtime AI session capability and its Gemini Live adapter
//! - **controller**: connect/disconnect workflow, transcripts, event fan-out
//! - **bridge**: the single task that owns the controller
//! - **handlers / websocket / health**: HTTP and WebSocket surface
//! - **error**: domain and HTTP error types

mod audio;
mod bridge;
mod config;
mod controller;
mod error;
mod handlers;
mod hardware;
mod health;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use session::GeminiConnector;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.session.api_key.is_empty() {
        warn!("No API key configured; connecting will fail until GEMINI_API_KEY is set");
    }
    if !config.device.replay_file.is_empty() {
        info!(file = %config.device.replay_file, "Hardware link will replay a recording");
    }

    let (bridge, bridge_task) = bridge::spawn_bridge(
        hardware::default_link_factory(),
        Arc::new(GeminiConnector::new()),
        audio::output::default_output_factory(),
    );

    let app_state = AppState::new(config.clone(), bridge.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(web::scope("/api/v1").configure(handlers::api_routes))
            .route("/ws/events", web::get().to(websocket::events_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Release the peripheral and close the AI session before exiting
    if let Err(e) = bridge.shutdown().await {
        warn!("Bridge shutdown: {}", e);
    }
    if let Err(e) = bridge_task.await {
        error!("Bridge task error: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` overrides the default `voice_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C only on non-unix targets).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, falling back to Ctrl+C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
