//! # Voice Live Backend - Main Application Entry Point
//!
//! Local service that owns the realtime voice session for the host panel:
//! the panel toggles the session over HTTP, this process captures the
//! microphone, streams it to the live model and plays the spoken answer back.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state, request metrics and stream counters
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request metrics
//! - **handlers**: Config and voice session endpoints
//! - **error**: Streaming error taxonomy and HTTP error responses
//! - **audio**: Wire codec, capture pipeline, playback scheduler, mixer
//! - **device**: Microphone and speaker access
//! - **live**: Live endpoint protocol, transport and session lifecycle

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod live;
mod middleware;
mod state;

use actix_cors::Cors;
use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use device::SystemAudio;
use live::session::SessionManager;
use live::transport::GeminiLiveTransport;
use state::{AppState, StreamStats};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates the voice service** and the shared application state
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Shuts down gracefully** on SIGINT/SIGTERM, closing any live voice session
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        "Live model {} with voice {}, capture {}Hz / playback {}Hz",
        config.live.model,
        config.live.voice_name,
        config.audio.capture_sample_rate,
        config.audio.playback_sample_rate
    );
    if config.live.api_key.is_empty() {
        warn!("No API key configured (API_KEY / GEMINI_API_KEY); the live endpoint will reject sessions");
    }
    if !cfg!(feature = "device") {
        warn!("Built without the `device` feature; voice sessions cannot open audio devices");
    }

    let stream_stats = Arc::new(StreamStats::default());
    let voice = Arc::new(SessionManager::new(
        Arc::new(GeminiLiveTransport::new(
            config.live.endpoint.clone(),
            config.live.api_key.clone(),
        )),
        Arc::new(SystemAudio),
        stream_stats.clone(),
    ));
    let app_state = AppState::new(config.clone(), voice.clone(), stream_stats);
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
            .wrap(from_fn(middleware::track_metrics))
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/voice/session", web::get().to(handlers::get_session))
                    .route("/voice/session", web::post().to(handlers::open_session))
                    .route("/voice/session", web::delete().to(handlers::close_session))
                    .route("/voice/toggle", web::post().to(handlers::toggle_session)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    voice.close().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// - `RUST_LOG` controls what gets logged
/// - If not set, defaults to "voice_live_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_live_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for shutdown signals: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
