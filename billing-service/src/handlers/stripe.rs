//! Stripe card payments for the platform account.

use super::extract::OptionalJson;
use super::validated;
use crate::services::stripe_billing::{
    InvoicePaymentIntent, PaymentMethodStatus, SetupIntentOutcome, SubscriptionCancelled, SubscriptionCreated,
    SubscriptionStatusView, UsageCharged,
};
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use validator::Validate;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentRequest {
    #[validate(length(min = 1, max = 64))]
    pub invoice_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    #[validate(length(min = 1, max = 255))]
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSubscriptionRequest {
    #[serde(default)]
    pub immediately: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddPaymentMethodRequest {
    #[validate(length(min = 1, max = 255))]
    pub payment_method_id: String,
    #[serde(default = "default_true")]
    pub set_as_default: bool,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeletePaymentMethodRequest {
    #[validate(length(min = 1, max = 255))]
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddUsageRequest {
    pub amount: Decimal,
    #[validate(length(max = 500))]
    pub description: Option<String>,
    #[validate(length(max = 500))]
    pub invoice_item_description: Option<String>,
}

pub async fn setup_intent(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<(StatusCode, Json<SetupIntentOutcome>), AppError> {
    let outcome = state.stripe.setup_intent(&tenant_id, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn payment_method(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<PaymentMethodStatus>, AppError> {
    Ok(Json(
        state.stripe.payment_method_status(&tenant_id, Utc::now()).await?,
    ))
}

pub async fn payment_intent(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<PaymentIntentRequest>,
) -> Result<Json<InvoicePaymentIntent>, AppError> {
    let payload = validated(payload)?;
    let intent = state
        .stripe
        .invoice_payment_intent(&tenant_id, payload.invoice_id.as_deref(), Utc::now())
        .await?;
    Ok(Json(intent))
}

pub async fn subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<SubscriptionStatusView>, AppError> {
    Ok(Json(state.stripe.subscription(&tenant_id).await?))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionCreated>), AppError> {
    let payload = validated(payload)?;
    let created = state
        .stripe
        .create_subscription(&tenant_id, payload.payment_method_id.as_deref(), Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<CancelSubscriptionRequest>,
) -> Result<Json<SubscriptionCancelled>, AppError> {
    Ok(Json(
        state
            .stripe
            .cancel_subscription(&tenant_id, payload.immediately, Utc::now())
            .await?,
    ))
}

pub async fn add_payment_method(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<AddPaymentMethodRequest>,
) -> Result<Json<Value>, AppError> {
    let payload = validated(payload)?;
    let method = state
        .stripe
        .add_payment_method(&tenant_id, &payload.payment_method_id, payload.set_as_default, Utc::now())
        .await?;
    Ok(Json(json!({ "success": true, "paymentMethod": method })))
}

pub async fn delete_payment_method(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<DeletePaymentMethodRequest>,
) -> Result<Json<Value>, AppError> {
    let payload = validated(payload)?;
    state
        .stripe
        .delete_payment_method(&tenant_id, payload.payment_method_id.as_deref(), Utc::now())
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn add_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<AddUsageRequest>,
) -> Result<Json<Value>, AppError> {
    let payload = validated(payload)?;
    // The invoice item text wins over the short description.
    let description = payload
        .invoice_item_description
        .as_deref()
        .or(payload.description.as_deref());
    let usage: UsageCharged = state
        .stripe
        .add_usage(&tenant_id, payload.amount, description)
        .await?;
    Ok(Json(json!({
        "success": true,
        "invoiceItemId": usage.invoice_item_id,
        "amount": usage.amount,
        "description": usage.description,
    })))
}

pub async fn invoices(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let invoices = state.stripe.stripe_invoices(&tenant_id).await?;
    Ok(Json(json!({ "invoices": invoices })))
}

/// The signature covers the raw body, so it is taken as bytes and parsed only after verification.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = state
        .reconciler
        .handle_stripe(signature, &body, Utc::now())
        .await?;
    Ok(Json(json!({ "received": true, "outcome": outcome.to_string() })))
}
