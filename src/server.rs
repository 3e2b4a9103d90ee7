//! HTTP surface used by the login flow and by operators.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bootstrap::{BootstrapCoordinator, CredentialProvider, Identity};
use crate::status::collect_status;

#[derive(Clone)]
pub struct AppState {
    pub provider: CredentialProvider,
    pub coordinator: BootstrapCoordinator,
    pub bearer_secret: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
pub struct FirstAdminRequest {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub initial: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bootstrap/first-admin", post(first_admin))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = collect_status(&state.provider).await;
    Json(serde_json::json!({
        "status": if report.is_ready() { "ready" } else { "degraded" },
        "service": "asset-bootstrap",
        "report": report,
    }))
}

async fn first_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FirstAdminRequest>,
) -> Response {
    if !authorized(&headers, state.bearer_secret.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    let Some(user_id) = request.user_id.filter(|id| !id.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "userId required" })),
        )
            .into_response();
    };

    let identity = Identity::new(user_id, request.email);
    let restricted = state.provider.restricted(&identity);
    let elevated = state.provider.elevated();

    let outcome = state
        .coordinator
        .maybe_promote_first_admin(&identity, &restricted, elevated.as_ref(), request.initial)
        .await;
    info!("First-admin bootstrap for {}: {:?}", identity.id, outcome);

    Json(outcome).into_response()
}

fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return false;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token, secret))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}
