//! Request extractors shared by the billing handlers.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;
use service_core::error::AppError;

/// JSON body that may be left out entirely.
///
/// An empty body yields `T::default()`. Anything else must parse as `T`, otherwise the request
/// is rejected with 400 before the handler runs.
#[derive(Debug, Clone, Default)]
pub struct OptionalJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for OptionalJson<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;
        parse_optional(&body).map(OptionalJson)
    }
}

pub(crate) fn parse_optional<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid JSON body: {}", e)))
}

/// Webhook bodies are decoded leniently so an unreadable payload is still acknowledged.
pub(crate) fn lossy_body(body: &Bytes) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Charge {
        amount: Option<Decimal>,
        invoice_id: Option<String>,
    }

    #[test]
    fn test_empty_body_is_default() {
        assert_eq!(parse_optional::<Charge>(b"").unwrap(), Charge::default());
        assert_eq!(parse_optional::<Charge>(b"  \n").unwrap(), Charge::default());
    }

    #[test]
    fn test_object_body_is_parsed() {
        let charge = parse_optional::<Charge>(br#"{"amount":"32.34","invoiceId":"inv_1"}"#).unwrap();
        assert_eq!(charge.amount, Some(Decimal::new(3234, 2)));
        assert_eq!(charge.invoice_id.as_deref(), Some("inv_1"));
    }

    #[test]
    fn test_malformed_body_is_bad_request() {
        for body in [
            &br#"{"amount":"one euro","invoiceId":"inv_x"}"#[..],
            b"{not json",
            b"null",
        ] {
            assert!(matches!(
                parse_optional::<Charge>(body),
                Err(AppError::BadRequest(_))
            ));
        }
    }

    #[test]
    fn test_lossy_body_keeps_valid_text() {
        assert_eq!(lossy_body(&Bytes::from_static(b"id=tr_1")), "id=tr_1");
        assert_eq!(lossy_body(&Bytes::from_static(b"id=\xff")), "id=\u{fffd}");
    }
}
