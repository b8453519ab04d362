//! Per-endpoint request counting.
//!
//! Endpoints are keyed by their route pattern (`POST /api/v1/voice/session`),
//! falling back to the raw path for unmatched requests.

use crate::state::AppState;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use std::time::Instant;

pub async fn track_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let path = req.match_pattern().unwrap_or_else(|| req.path().to_string());
    let endpoint = format!("{} {}", req.method(), path);
    let state = req.app_data::<web::Data<AppState>>().cloned();

    if let Some(state) = &state {
        state.increment_request_count();
    }

    let result = next.call(req).await;

    if let Some(state) = &state {
        let is_error = match &result {
            Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
            Err(_) => true,
        };
        state.record_endpoint_request(&endpoint, start_time.elapsed().as_millis() as u64, is_error);
        if is_error {
            state.increment_error_count();
        }
    }

    result
}
