//! Domain error for billing operations and its mapping onto HTTP responses.

use crate::providers::ProviderError;
use crate::services::blob::BlobError;
use crate::services::email::EmailError;
use crate::store::StoreError;
use service_core::error::AppError;
use service_core::retry::Retryable;
use thiserror::Error;

/// Seconds a caller should wait before retrying after a provider outage.
const PROVIDER_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("no active payment mandate for tenant {0}")]
    MandateMissing(String),

    #[error("tenant {0} has no connected Mollie account")]
    NotConnected(String),

    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Business rejection from the provider; the message is shown to the caller.
    #[error("{0}")]
    ProviderRejected(String),

    /// Another writer got there first. Callers treat this as already applied.
    #[error("conditional update did not apply: {0}")]
    ConditionalUpdateFailure(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BillingError {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation",
            BillingError::NotFound(_) => "not_found",
            BillingError::MandateMissing(_) => "mandate_missing",
            BillingError::NotConnected(_) => "not_connected",
            BillingError::ProviderUnavailable(_) => "provider_unavailable",
            BillingError::ProviderRejected(_) => "provider_rejected",
            BillingError::ConditionalUpdateFailure(_) => "conditional_update_failure",
            BillingError::Configuration(_) => "configuration",
            BillingError::Internal(_) => "internal",
        }
    }
}

impl Retryable for BillingError {
    fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ProviderUnavailable(_))
    }
}

impl From<ProviderError> for BillingError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => BillingError::ProviderUnavailable(msg),
            ProviderError::Rejected { message, .. } => BillingError::ProviderRejected(message),
            ProviderError::NotFound(msg) => BillingError::NotFound(msg),
            ProviderError::AuthenticationFailed(msg) => {
                BillingError::Configuration(format!("provider credentials rejected: {}", msg))
            }
            ProviderError::NotConfigured(msg) => BillingError::Configuration(msg),
            ProviderError::Unsupported(msg) => BillingError::Validation(msg),
            ProviderError::Decode(msg) => {
                BillingError::Internal(anyhow::anyhow!("unexpected provider response: {}", msg))
            }
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(key) => BillingError::ConditionalUpdateFailure(key),
            StoreError::Backend(e) => BillingError::Internal(e),
        }
    }
}

impl From<BlobError> for BillingError {
    fn from(err: BlobError) -> Self {
        BillingError::Internal(anyhow::Error::new(err))
    }
}

impl From<EmailError> for BillingError {
    fn from(err: EmailError) -> Self {
        BillingError::Internal(anyhow::Error::new(err))
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            BillingError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            BillingError::MandateMissing(tenant_id) => {
                tracing::info!(tenant_id = %tenant_id, "Charge refused, no active mandate");
                AppError::BadRequest(anyhow::anyhow!(
                    "Keine aktive Zahlungsmethode hinterlegt. Bitte richten Sie zuerst ein SEPA-Mandat ein."
                ))
            }
            BillingError::NotConnected(tenant_id) => {
                tracing::info!(tenant_id = %tenant_id, "Mollie account not connected");
                AppError::BadRequest(anyhow::anyhow!(
                    "Kein Mollie-Konto verbunden. Bitte verbinden Sie Ihr Mollie-Konto."
                ))
            }
            BillingError::ProviderUnavailable(msg) => {
                tracing::warn!(error = %msg, "Payment provider unavailable");
                AppError::ServiceUnavailable(
                    "Zahlungsanbieter nicht erreichbar. Bitte später erneut versuchen.".to_string(),
                    Some(PROVIDER_RETRY_AFTER_SECS),
                )
            }
            BillingError::ProviderRejected(msg) => AppError::BadGateway(msg),
            BillingError::ConditionalUpdateFailure(msg) => {
                AppError::Conflict(anyhow::anyhow!("already applied: {}", msg))
            }
            BillingError::Configuration(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
            BillingError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_mapping() {
        let cases = [
            (BillingError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (BillingError::NotFound("missing".into()), StatusCode::NOT_FOUND),
            (BillingError::MandateMissing("t1".into()), StatusCode::BAD_REQUEST),
            (BillingError::NotConnected("t1".into()), StatusCode::BAD_REQUEST),
            (
                BillingError::ProviderUnavailable("timeout".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (BillingError::ProviderRejected("invalid mandate".into()), StatusCode::BAD_GATEWAY),
            (
                BillingError::Configuration("MOLLIE_API_KEY".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let kind = err.kind();
            assert_eq!(AppError::from(err).status_code(), expected, "kind {}", kind);
        }
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(BillingError::ProviderUnavailable("503".into()).is_retryable());
        assert!(!BillingError::ProviderRejected("declined".into()).is_retryable());
        assert!(!BillingError::MandateMissing("t1".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_mapping() {
        let err: BillingError = ProviderError::AuthenticationFailed("401".into()).into();
        assert!(matches!(err, BillingError::Configuration(_)));

        let err: BillingError = ProviderError::Rejected {
            status: 422,
            code: None,
            message: "The mandate is invalid".into(),
        }
        .into();
        assert!(matches!(err, BillingError::ProviderRejected(ref m) if m == "The mandate is invalid"));
    }
}
