//! Payment provider clients.
//!
//! Each provider speaks its own API; [`PaymentProvider`] is the normalized surface the
//! invoice engine and the reconciler work against.

pub mod credentials;
pub mod mollie;
pub mod mollie_connect;
pub mod paypal;
pub mod stripe;

pub use credentials::{ConfigCredentialSource, CredentialCache, CredentialSource, ProviderCredentials};
pub use mollie::{MollieApi, MollieClient};
pub use mollie_connect::MollieOAuthClient;
pub use paypal::PaypalClient;
pub use stripe::StripeClient;

use crate::models::{MetadataError, PaymentMetadata, PaymentStatus, ProviderKind};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::retry::Retryable;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network failure, timeout, 429 or 5xx. Safe to retry.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Credentials missing at the provider or expired. Not retried.
    #[error("provider authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Business rejection (4xx), e.g. an invalid mandate.
    #[error("provider rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("provider resource not found: {0}")]
    NotFound(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Classify a non-success HTTP answer.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let (code, message) = error_detail(body);
        let message = message.unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        match status {
            StatusCode::UNAUTHORIZED => ProviderError::AuthenticationFailed(message),
            StatusCode::NOT_FOUND => ProviderError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => ProviderError::Unavailable(message),
            s if s.is_server_error() => ProviderError::Unavailable(message),
            s => ProviderError::Rejected {
                status: s.as_u16(),
                code,
                message,
            },
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::AuthenticationFailed(_))
    }

    /// OAuth `invalid_grant`: the refresh token was already used or revoked.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, ProviderError::Rejected { code: Some(code), .. } if code == "invalid_grant")
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Pull an error code and a human readable message out of the error bodies of
/// Mollie (`detail`), Stripe (`error.message`), PayPal (`details[].description`) and
/// OAuth token endpoints (`error`, `error_description`).
fn error_detail(body: &str) -> (Option<String>, Option<String>) {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return (None, None);
    };
    let str_at = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

    if let Some(err) = json.get("error") {
        if let Some(code) = err.as_str() {
            let message = str_at(&json, "error_description").or_else(|| Some(code.to_string()));
            return (Some(code.to_string()), message);
        }
        return (
            str_at(err, "code").or_else(|| str_at(err, "type")),
            str_at(err, "message"),
        );
    }

    let paypal_detail = json
        .get("details")
        .and_then(Value::as_array)
        .and_then(|d| d.first())
        .and_then(|d| str_at(d, "description"));

    (
        str_at(&json, "name").or_else(|| str_at(&json, "title")),
        str_at(&json, "detail").or(paypal_detail).or_else(|| str_at(&json, "message")),
    )
}

/// Read a provider answer as JSON, classifying failures. Error bodies are logged, never returned.
pub(crate) async fn read_json(
    provider: ProviderKind,
    operation: &str,
    response: reqwest::Response,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response.text().await?;

    tracing::debug!(
        provider = %provider,
        operation = operation,
        status = %status,
        "Provider response received"
    );

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()));
    }

    tracing::error!(
        provider = %provider,
        operation = operation,
        status = %status,
        body = %body,
        "Provider request failed"
    );
    Err(ProviderError::from_status(status, &body))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// Charge to create at a provider.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub currency: String,
    /// Prevents a duplicate charge when the same request is retried.
    pub idempotency_key: String,
    pub description: String,
    pub metadata: PaymentMetadata,
    pub customer_id: Option<String>,
    /// Set for off-session charges against a stored mandate or payment method.
    pub mandate_id: Option<String>,
    pub redirect_url: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeResult {
    pub external_id: String,
    pub redirect_url: Option<String>,
    pub status: PaymentStatus,
}

/// Canonical payment state, always re-fetched from the provider.
#[derive(Debug, Clone)]
pub struct ProviderPayment {
    pub id: String,
    pub status: PaymentStatus,
    /// Status string as the provider reports it.
    pub provider_status: String,
    pub amount: Option<Decimal>,
    pub metadata: Result<PaymentMetadata, MetadataError>,
    pub customer_id: Option<String>,
    pub mandate_id: Option<String>,
    pub subscription_id: Option<String>,
    pub method: Option<String>,
    pub consumer_name: Option<String>,
    pub capture_id: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub status: PaymentStatus,
    pub capture_id: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ProviderError>;

    async fn get_status(&self, external_id: &str) -> Result<ProviderPayment, ProviderError>;

    /// Second step for two-phase providers.
    async fn capture(&self, external_id: &str) -> Result<CaptureResult, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} payments {} need no capture",
            self.kind(),
            external_id
        )))
    }
}
