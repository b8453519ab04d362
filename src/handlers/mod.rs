pub mod config;
pub mod voice;

pub use config::*;
pub use voice::*;

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::device::SystemAudio;
    use crate::live::session::SessionManager;
    use crate::live::transport::GeminiLiveTransport;
    use crate::state::{AppState, StreamStats};
    use actix_web::{http::StatusCode, test, web, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn app_state() -> AppState {
        app_state_with(AppConfig::default())
    }

    /// State whose microphone can never be opened, with or without device support.
    fn app_state_without_microphone() -> AppState {
        let mut config = AppConfig::default();
        config.audio.input_device = Some("no such microphone".to_string());
        app_state_with(config)
    }

    fn app_state_with(mut config: AppConfig) -> AppState {
        config.live.api_key = "secret".to_string();
        let stats = Arc::new(StreamStats::default());
        let voice = SessionManager::new(
            Arc::new(GeminiLiveTransport::new(config.live.endpoint.clone(), config.live.api_key.clone())),
            Arc::new(SystemAudio),
            stats.clone(),
        );
        AppState::new(config, Arc::new(voice), stats)
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .wrap(actix_web::middleware::from_fn(crate::middleware::track_metrics))
                    .route("/health", web::get().to(crate::health::health_check))
                    .service(
                        web::scope("/api/v1")
                            .route("/metrics", web::get().to(crate::health::detailed_metrics))
                            .route("/config", web::get().to(super::get_config))
                            .route("/config", web::put().to(super::update_config))
                            .route("/voice/session", web::get().to(super::get_session))
                            .route("/voice/session", web::post().to(super::open_session))
                            .route("/voice/session", web::delete().to(super::close_session))
                            .route("/voice/toggle", web::post().to(super::toggle_session)),
                    ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_config_hides_api_key() {
        let app = test_app!(app_state());

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["live"]["api_key"], "********");
        assert_eq!(body["config"]["audio"]["capture_sample_rate"], 16000);
    }

    #[actix_web::test]
    async fn test_config_update_applies_and_validates() {
        let state = app_state();
        let app = test_app!(state.clone());

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"live": {"voice_name": "Puck"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().live.voice_name, "Puck");
        assert_eq!(state.get_config().live.api_key, "secret");

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"live": {"voice_name": ""}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().live.voice_name, "Puck");
    }

    #[actix_web::test]
    async fn test_idle_session_and_idempotent_close() {
        let app = test_app!(app_state());

        let req = test::TestRequest::get().uri("/api/v1/voice/session").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "idle");

        for _ in 0..2 {
            let req = test::TestRequest::delete().uri("/api/v1/voice/session").to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[actix_web::test]
    async fn test_open_without_devices_is_unavailable() {
        let state = app_state_without_microphone();
        let app = test_app!(state.clone());

        let req = test::TestRequest::post().uri("/api/v1/voice/session").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "device_unavailable");
        assert_eq!(state.voice.status().state.as_str(), "idle");
        assert_eq!(state.stream_stats.snapshot().session_errors, 1);
    }

    #[actix_web::test]
    async fn test_toggle_while_idle_tries_to_open() {
        let state = app_state_without_microphone();
        let app = test_app!(state.clone());

        let req = test::TestRequest::post().uri("/api/v1/voice/toggle").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "device_unavailable");

        let req = test::TestRequest::get().uri("/api/v1/voice/session").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "idle");
        assert!(body["session"]["last_error"].is_string());
        assert_eq!(state.stream_stats.snapshot().session_errors, 1);
    }

    #[actix_web::test]
    async fn test_empty_voice_override_is_rejected() {
        let app = test_app!(app_state());

        let req = test::TestRequest::post()
            .uri("/api/v1/voice/session")
            .set_json(json!({"voice_name": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_metrics_track_endpoints_and_stream() {
        let state = app_state();
        let app = test_app!(state.clone());

        let req = test::TestRequest::get().uri("/health").to_request();
        let health: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["voice"]["state"], "idle");
        assert_eq!(health["voice"]["api_key_configured"], true);

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let metrics: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(metrics["voice"]["stream"]["chunks_sent"], 0);
        let endpoints = metrics["endpoints"].as_array().unwrap();
        assert!(endpoints.iter().any(|e| e["endpoint"] == "GET /health"));
        assert!(state.get_metrics_snapshot().request_count >= 2);
    }
}
