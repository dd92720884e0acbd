//! Operator views across all tenants.

use super::validated;
use crate::error::BillingError;
use crate::models::{BillingReport, TenantStatus};
use crate::services::admin::{InvoiceListing, TenantsOverview};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct TenantStatusRequest {
    pub status: String,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

pub async fn tenants_overview(State(state): State<AppState>) -> Result<Json<TenantsOverview>, AppError> {
    Ok(Json(state.admin.tenants_overview(Utc::now()).await?))
}

pub async fn invoices(State(state): State<AppState>) -> Result<Json<InvoiceListing>, AppError> {
    Ok(Json(state.admin.all_invoices().await?))
}

pub async fn set_tenant_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<TenantStatusRequest>,
) -> Result<Json<Value>, AppError> {
    let payload = validated(payload)?;
    let status = TenantStatus::parse(&payload.status).ok_or_else(|| {
        BillingError::Validation(format!(
            "Ungültiger Status '{}', erlaubt: active, suspended, pending",
            payload.status
        ))
    })?;
    state
        .admin
        .set_tenant_status(&tenant_id, status, payload.reason.as_deref(), Utc::now())
        .await?;
    Ok(Json(json!({
        "success": true,
        "tenant_id": tenant_id,
        "status": status.as_str(),
        "reason": payload.reason,
    })))
}

/// Runs the same monthly batch as the scheduled job.
pub async fn generate_invoices(State(state): State<AppState>) -> Json<BillingReport> {
    Json(state.batch.run_monthly_billing(Utc::now()).await)
}
