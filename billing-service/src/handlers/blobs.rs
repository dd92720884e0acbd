use crate::error::BillingError;
use crate::services::blob::content_type_for;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use service_core::error::AppError;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub filename: String,
    pub signature: String,
}

/// Serve a blob behind a signed url. Expired or tampered links get 403.
pub async fn download(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<impl IntoResponse, AppError> {
    if !state
        .signer
        .verify(&key, query.expires, &query.filename, &query.signature, Utc::now())
    {
        tracing::warn!(key = %key, "Rejected blob download with invalid or expired signature");
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Download link is invalid or expired"
        )));
    }

    let bytes = state
        .blobs
        .get(&key)
        .await
        .map_err(BillingError::from)?
        .ok_or_else(|| BillingError::NotFound(format!("blob {} not found", key)))?;

    let filename = query.filename.replace(['"', '\\', '\r', '\n'], "_");
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&key).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}
