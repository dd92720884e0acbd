//! HTTP handlers for billing-service.

pub mod admin;
pub mod blobs;
pub mod connect;
pub mod extract;
pub mod invoices;
pub mod mollie;
pub mod payment_methods;
pub mod paypal;
pub mod stripe;

use crate::error::BillingError;
use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use validator::Validate;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "billing-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Ready once the store answers.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Run the payload's validation rules, reporting failures as a bad request.
pub(crate) fn validated<T: Validate>(payload: T) -> Result<T, BillingError> {
    payload
        .validate()
        .map_err(|e| BillingError::Validation(e.to_string()))?;
    Ok(payload)
}
