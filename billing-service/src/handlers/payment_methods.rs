//! Which payment providers a tenant can pay with.

use crate::error::BillingError;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use service_core::error::AppError;

pub async fn available(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut methods = json!({
        "paypal": {
            "enabled": state.config.paypal.is_configured(),
            "name": "PayPal",
            "description": "Bezahlen Sie sicher mit PayPal",
        },
        "stripe": {
            "enabled": state.config.stripe.is_configured(),
            "name": "Kreditkarte / SEPA",
            "description": "Bezahlen Sie mit Karte oder Lastschrift",
        },
    });

    let saved = state
        .store
        .get_account(&tenant_id)
        .await
        .map_err(BillingError::from)?
        .and_then(|account| account.payment_method);
    if let Some(saved) = saved {
        methods["savedPaymentMethod"] = json!({
            "type": saved.method_type,
            "last4": saved.last4,
            "brand": saved.brand,
        });
    }
    Ok(Json(methods))
}
