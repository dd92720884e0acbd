//! Mollie mandate, charge and webhook handlers for the platform account.

use super::extract::{lossy_body, OptionalJson};
use super::validated;
use crate::models::{BillingReport, PaymentStatus, TenantBillingAccount};
use crate::services::mandate::{CustomerStatus, FirstPaymentOutcome};
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FirstPaymentRequest {
    #[validate(url)]
    pub redirect_url: Option<String>,
    pub amount: Option<Decimal>,
}

/// `description` may be sent but the charge text is always derived from the invoice.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ManualChargeRequest {
    pub amount: Option<Decimal>,
    #[validate(length(min = 1, max = 64))]
    pub invoice_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResponse {
    pub success: bool,
    pub payment_id: String,
    pub invoice_id: String,
    pub invoice_number: String,
    pub amount: Decimal,
    pub status: PaymentStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerResponse {
    pub customer_id: String,
}

/// Mollie posts `id=tr_…`. Receipt is always acknowledged; the outcome is informational.
pub async fn webhook(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let outcome = state
        .reconciler
        .handle_mollie(&lossy_body(&body), Utc::now())
        .await;
    Json(json!({ "received": true, "outcome": outcome.to_string() }))
}

pub async fn create_customer(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<CustomerResponse>, AppError> {
    let customer_id = state.mandates.ensure_customer(&tenant_id, Utc::now()).await?;
    Ok(Json(CustomerResponse { customer_id }))
}

pub async fn customer_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<CustomerStatus>, AppError> {
    Ok(Json(state.mandates.customer_status(&tenant_id).await?))
}

pub async fn create_first_payment(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<FirstPaymentRequest>,
) -> Result<(StatusCode, Json<FirstPaymentOutcome>), AppError> {
    let payload = validated(payload)?;
    let outcome = state
        .mandates
        .create_first_payment(
            &tenant_id,
            payload.redirect_url.as_deref(),
            payload.amount,
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Manual recurring charge against the stored mandate.
pub async fn charge(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<ManualChargeRequest>,
) -> Result<Json<ChargeResponse>, AppError> {
    let payload = validated(payload)?;

    let (invoice, result) = state
        .engine
        .charge_tenant(
            &tenant_id,
            payload.amount,
            payload.invoice_id.as_deref(),
            Utc::now(),
        )
        .await?;

    Ok(Json(ChargeResponse {
        success: true,
        payment_id: result.external_id,
        invoice_id: invoice.invoice_id,
        invoice_number: invoice.invoice_number,
        amount: invoice.amount,
        status: result.status,
    }))
}

pub async fn revoke_mandate(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantBillingAccount>, AppError> {
    Ok(Json(state.mandates.revoke(&tenant_id, Utc::now()).await?))
}

pub async fn payment_history(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let payments = state.mandates.payment_history(&tenant_id).await?;
    Ok(Json(json!({ "payments": payments })))
}

/// Cron entry point. Per-tenant failures end up in the report, never in the status code.
pub async fn process_monthly(State(state): State<AppState>) -> Json<BillingReport> {
    Json(state.batch.run_monthly_billing(Utc::now()).await)
}
