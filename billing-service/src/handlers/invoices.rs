//! Invoice, estimate and PDF handlers.

use crate::models::{BillingPeriod, Estimate, Invoice};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

#[derive(Debug, Default, Deserialize)]
pub struct EstimateQuery {
    /// `YYYY-MM`; the running month when absent.
    pub month: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceListResponse {
    pub invoices: Vec<Invoice>,
    pub current_month: Estimate,
}

#[derive(Debug, Serialize)]
pub struct DownloadUrl {
    pub url: String,
}

/// Invoices newest first, plus the running month's estimate.
pub async fn list_invoices(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<InvoiceListResponse>, AppError> {
    let now = Utc::now();
    let invoices = state.engine.list_invoices(&tenant_id).await?;
    let current_month = state.engine.estimate_current_period(&tenant_id, now).await;
    Ok(Json(InvoiceListResponse {
        invoices,
        current_month,
    }))
}

pub async fn estimate(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<EstimateQuery>,
) -> Result<Json<Estimate>, AppError> {
    let period = match query.month.as_deref() {
        Some(month) => BillingPeriod::from_key(month).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Ungültiger Monat '{}', erwartet YYYY-MM", month))
        })?,
        None => BillingPeriod::containing(Utc::now()),
    };
    Ok(Json(state.engine.estimate_period(&tenant_id, period).await))
}

/// Drop the cached usage for the running month and estimate again.
pub async fn refresh_estimate(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Json<Estimate> {
    let now = Utc::now();
    state.costs.invalidate(&tenant_id, &BillingPeriod::containing(now));
    tracing::info!(tenant_id = %tenant_id, "Usage estimate cache invalidated");
    Json(state.engine.estimate_current_period(&tenant_id, now).await)
}

/// Create the running month's invoice from the estimate, or return the existing one.
pub async fn create_invoice(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<(StatusCode, Json<Invoice>), AppError> {
    let invoice = state
        .engine
        .current_period_invoice(&tenant_id, Utc::now())
        .await?;
    tracing::info!(
        tenant_id = %tenant_id,
        invoice_id = %invoice.invoice_id,
        amount = %invoice.amount,
        "Current period invoice ready"
    );
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn invoice_pdf(
    State(state): State<AppState>,
    Path((tenant_id, invoice_id)): Path<(String, String)>,
) -> Result<Json<DownloadUrl>, AppError> {
    let url = state
        .pdfs
        .get_or_create_invoice_pdf(&tenant_id, &invoice_id)
        .await?;
    Ok(Json(DownloadUrl { url }))
}
