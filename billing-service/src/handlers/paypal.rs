//! PayPal order checkout for invoices.

use super::extract::OptionalJson;
use super::validated;
use crate::services::paypal_billing::{PaypalCaptureOutcome, PaypalOrderOutcome};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 64))]
    pub invoice_id: Option<String>,
    #[validate(url)]
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    #[validate(length(min = 1, max = 64))]
    pub order_id: String,
    #[validate(length(min = 1, max = 64))]
    pub invoice_id: Option<String>,
}

pub async fn create_order(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<CreateOrderRequest>,
) -> Result<(StatusCode, Json<PaypalOrderOutcome>), AppError> {
    let payload = validated(payload)?;
    let order = state
        .paypal
        .create_order(
            &tenant_id,
            payload.invoice_id.as_deref(),
            payload.return_url.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Called after the payer approved the order and came back.
pub async fn capture(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<CaptureRequest>,
) -> Result<Json<PaypalCaptureOutcome>, AppError> {
    let payload = validated(payload)?;
    let outcome = state
        .paypal
        .capture(
            &tenant_id,
            &payload.order_id,
            payload.invoice_id.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(Json(outcome))
}
