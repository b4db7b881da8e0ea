//! Route handlers.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::ratelimit::{AdmissionBackend, Decision};

/// Header carrying the already-authenticated caller identity.
///
/// Header names are case-insensitive, so this matches `userId` as sent by clients.
pub const USER_ID_HEADER: &str = "userid";

const DENIED_BODY: &str = "Rate limit exceeded. Try again later.";
const UNAVAILABLE_BODY: &str = "Rate limiter unavailable. Try again later.";

/// Build the service router around an admission backend.
pub fn router<R: AdmissionBackend + 'static>(backend: Arc<R>) -> Router {
    Router::new()
        .route("/traffic/api1", get(handle_api1::<R>))
        .route("/traffic/api2", post(handle_api2::<R>))
        .route("/traffic/api3", put(handle_api3::<R>))
        .route("/health", get(health))
        .with_state(backend)
}

async fn handle_api1<R: AdmissionBackend + 'static>(
    State(backend): State<Arc<R>>,
    headers: HeaderMap,
) -> Response {
    process_request(backend.as_ref(), &headers, "api1").await
}

async fn handle_api2<R: AdmissionBackend + 'static>(
    State(backend): State<Arc<R>>,
    headers: HeaderMap,
) -> Response {
    process_request(backend.as_ref(), &headers, "api2").await
}

async fn handle_api3<R: AdmissionBackend + 'static>(
    State(backend): State<Arc<R>>,
    headers: HeaderMap,
) -> Response {
    process_request(backend.as_ref(), &headers, "api3").await
}

/// Decide admission for one call and map the outcome to a response.
///
/// Denial and store failure get different statuses so callers can tell
/// throttling apart from an infrastructure fault.
#[instrument(skip_all, fields(resource = resource))]
async fn process_request<R: AdmissionBackend + ?Sized>(
    backend: &R,
    headers: &HeaderMap,
    resource: &'static str,
) -> Response {
    let Some(subject) = user_id(headers) else {
        warn!("Received request without a userId header");
        return (StatusCode::BAD_REQUEST, "userId header is required").into_response();
    };

    match backend.decide(subject, resource).await {
        Ok(Decision::Admitted) => {
            debug!(subject, "Request admitted");
            (
                StatusCode::OK,
                format!("{} request processed successfully!", resource),
            )
                .into_response()
        }
        Ok(Decision::Denied) => {
            info!(subject, "Request rate limited");
            (StatusCode::TOO_MANY_REQUESTS, DENIED_BODY).into_response()
        }
        Err(e) => {
            error!(subject, error = %e, "Admission decision failed");
            (StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY).into_response()
        }
    }
}

fn user_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_ID_HEADER)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
