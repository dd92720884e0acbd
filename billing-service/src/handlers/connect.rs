//! Mollie Connect: creator OAuth and member subscriptions on the creator's organization.

use super::extract::{lossy_body, OptionalJson};
use super::validated;
use crate::models::{MemberSubscription, MemberSubscriptionView};
use crate::services::members::{MemberMandateOutcome, MemberSubscriptionOutcome, SubscriptionRequest};
use crate::services::oauth_bridge::{AuthorizeUrl, CallbackParams, ConnectResult, ConnectStatusView};
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    #[validate(url)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemberRequest {
    #[validate(length(min = 1, max = 128))]
    pub member_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MemberMandateRequest {
    #[validate(length(min = 1, max = 128))]
    pub member_id: String,
    pub customer_id: Option<String>,
    pub amount: Option<Decimal>,
    #[validate(url)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MemberSubscriptionRequest {
    #[validate(length(min = 1, max = 128))]
    pub member_id: String,
    pub customer_id: Option<String>,
    pub amount: Decimal,
    #[validate(length(min = 1, max = 32))]
    pub interval: Option<String>,
    #[validate(length(max = 255))]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelMemberRequest {
    pub customer_id: Option<String>,
}

pub async fn authorize(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    OptionalJson(payload): OptionalJson<AuthorizeRequest>,
) -> Result<Json<AuthorizeUrl>, AppError> {
    let payload = validated(payload)?;
    let url = state
        .connect
        .build_authorize_url(&tenant_id, payload.redirect_url.as_deref(), Utc::now())
        .await?;
    Ok(Json(url))
}

/// OAuth redirect target. The tenant comes from the signed `state`, not from the path.
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<ConnectResult>, AppError> {
    let result = state.connect.handle_callback(&params, Utc::now()).await?;
    Ok(Json(result))
}

pub async fn status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<ConnectStatusView>, AppError> {
    Ok(Json(state.connect.status(&tenant_id, Utc::now()).await?))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.connect.disconnect(&tenant_id, Utc::now()).await?;
    Ok(Json(json!({ "success": true })))
}

/// Member payments on connected organizations. Always acknowledged.
pub async fn webhook(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let outcome = state
        .reconciler
        .handle_connect(&lossy_body(&body), Utc::now())
        .await;
    Json(json!({ "received": true, "outcome": outcome.to_string() }))
}

pub async fn member_subscriptions(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let subscriptions: Vec<MemberSubscriptionView> = state.members.subscriptions(&tenant_id).await?;
    Ok(Json(json!({ "subscriptions": subscriptions })))
}

pub async fn create_member_customer(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<CreateMemberRequest>,
) -> Result<(StatusCode, Json<MemberSubscription>), AppError> {
    let payload = validated(payload)?;
    let member = state
        .members
        .create_customer(
            &tenant_id,
            &payload.member_id,
            &payload.name,
            payload.email.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn create_member_mandate(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<MemberMandateRequest>,
) -> Result<(StatusCode, Json<MemberMandateOutcome>), AppError> {
    let payload = validated(payload)?;
    let outcome = state
        .members
        .create_mandate(
            &tenant_id,
            &payload.member_id,
            payload.customer_id.as_deref(),
            payload.amount,
            payload.redirect_url.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Responds with `needsMandate: true` instead of an error while the member has no valid mandate.
pub async fn create_member_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<MemberSubscriptionRequest>,
) -> Result<Json<MemberSubscriptionOutcome>, AppError> {
    let payload = validated(payload)?;
    let request = SubscriptionRequest {
        customer_id: payload.customer_id,
        amount: payload.amount,
        interval: payload.interval,
        description: payload.description,
    };
    let outcome = state
        .members
        .create_subscription(&tenant_id, &payload.member_id, &request, Utc::now())
        .await?;
    Ok(Json(outcome))
}

pub async fn cancel_member_subscription(
    State(state): State<AppState>,
    Path((tenant_id, subscription_id)): Path<(String, String)>,
    OptionalJson(payload): OptionalJson<CancelMemberRequest>,
) -> Result<Json<MemberSubscription>, AppError> {
    let member = state
        .members
        .cancel_subscription(&tenant_id, &subscription_id, payload.customer_id.as_deref(), Utc::now())
        .await?;
    Ok(Json(member))
}
