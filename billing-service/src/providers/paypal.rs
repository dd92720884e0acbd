//! PayPal Orders v2 client. Orders are created, approved by the payer, then captured.

use super::{
    decode, read_json, CaptureResult, ChargeRequest, ChargeResult, CredentialCache,
    PaymentProvider, ProviderError, ProviderPayment,
};
use crate::models::{format_amount, MetadataError, PaymentMetadata, PaymentStatus, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::retry::{retry_async, RetryConfig};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Tokens are renewed this long before PayPal would expire them.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: Secret<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAmount {
    pub currency_code: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderCapture {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderPayments {
    #[serde(default)]
    pub captures: Vec<OrderCapture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseUnit {
    pub reference_id: Option<String>,
    pub custom_id: Option<String>,
    pub amount: Option<OrderAmount>,
    #[serde(default)]
    pub payments: Option<OrderPayments>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderLink {
    pub href: String,
    pub rel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub purchase_units: Vec<PurchaseUnit>,
    #[serde(default)]
    pub links: Vec<OrderLink>,
}

impl Order {
    pub fn approval_url(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone())
    }

    pub fn capture(&self) -> Option<&OrderCapture> {
        self.purchase_units
            .first()?
            .payments
            .as_ref()?
            .captures
            .first()
    }

    /// Orders are only paid once their capture completed.
    pub fn payment_status(&self) -> PaymentStatus {
        match self.capture() {
            Some(capture) => PaymentStatus::from_paypal(&capture.status),
            None => PaymentStatus::from_paypal(&self.status),
        }
    }

    pub fn amount(&self) -> Option<Decimal> {
        let amount = self.purchase_units.first()?.amount.as_ref()?;
        Decimal::from_str(&amount.value).ok()
    }

    /// PayPal has no free-form metadata: `custom_id` carries the tenant id and
    /// `reference_id` the invoice id.
    fn metadata(&self) -> Result<PaymentMetadata, MetadataError> {
        let unit = self.purchase_units.first().ok_or(MetadataError::Missing)?;
        let tenant_id = unit
            .custom_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(MetadataError::MissingField("tenantId"))?;
        let invoice_id = unit
            .reference_id
            .as_deref()
            .filter(|r| r.starts_with("inv_"))
            .ok_or(MetadataError::MissingField("invoiceId"))?;
        Ok(PaymentMetadata::invoice_payment(tenant_id, invoice_id))
    }
}

#[derive(Clone)]
pub struct PaypalClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
    credentials: Arc<CredentialCache>,
    token: Arc<Mutex<Option<CachedToken>>>,
    cancel_url: Option<String>,
}

impl PaypalClient {
    pub fn new(client: Client, base_url: &str, retry: RetryConfig, credentials: Arc<CredentialCache>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            credentials,
            token: Arc::new(Mutex::new(None)),
            cancel_url: None,
        }
    }

    /// Where the payer lands after aborting at PayPal.
    pub fn with_cancel_url(mut self, cancel_url: &str) -> Self {
        if !cancel_url.is_empty() {
            self.cancel_url = Some(cancel_url.to_string());
        }
        self
    }

    async fn access_token(&self) -> Result<Secret<String>, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let credentials = self.credentials.get(ProviderKind::Paypal).await?;
        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(
                credentials.client_id.clone().unwrap_or_default(),
                Some(credentials.secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let value = match read_json(ProviderKind::Paypal, "paypal.token", response).await {
            Ok(value) => value,
            Err(e) => {
                if e.is_auth_failure() {
                    self.credentials.invalidate(ProviderKind::Paypal);
                }
                return Err(e);
            }
        };
        let issued: AccessTokenResponse = decode(value)?;
        let token = Secret::new(issued.access_token);
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Utc::now() + Duration::seconds(issued.expires_in - TOKEN_EXPIRY_MARGIN_SECS),
        });
        tracing::debug!(expires_in = issued.expires_in, "PayPal access token issued");
        Ok(token)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        request_id: Option<&str>,
        operation: &str,
    ) -> Result<Value, ProviderError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let result = retry_async(&self.retry, operation, || async {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(token.expose_secret())
                .header("Content-Type", "application/json");
            if let Some(request_id) = request_id {
                request = request.header("PayPal-Request-Id", request_id);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            read_json(ProviderKind::Paypal, operation, response).await
        })
        .await;

        if matches!(&result, Err(e) if e.is_auth_failure()) {
            *self.token.lock().await = None;
        }
        result
    }

    pub async fn create_order(&self, request: &ChargeRequest) -> Result<Order, ProviderError> {
        let mut purchase_unit = json!({
            "custom_id": request.metadata.tenant_id,
            "description": request.description,
            "amount": {
                "currency_code": request.currency,
                "value": format_amount(request.amount),
            },
        });
        if let Some(invoice_id) = &request.metadata.invoice_id {
            purchase_unit["reference_id"] = Value::String(invoice_id.clone());
        }
        let mut body = json!({
            "intent": "CAPTURE",
            "purchase_units": [purchase_unit],
        });
        if let Some(return_url) = &request.redirect_url {
            body["application_context"] = json!({
                "return_url": return_url,
                "cancel_url": self.cancel_url.as_deref().unwrap_or(return_url),
                "user_action": "PAY_NOW",
            });
        }

        let value = self
            .send(
                Method::POST,
                "/v2/checkout/orders",
                Some(&body),
                Some(request.idempotency_key.as_str()),
                "paypal.create_order",
            )
            .await?;
        let order: Order = decode(value)?;
        tracing::info!(
            order_id = %order.id,
            tenant_id = %request.metadata.tenant_id,
            amount = %format_amount(request.amount),
            "PayPal order created"
        );
        Ok(order)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<(Order, Value), ProviderError> {
        let path = format!("/v2/checkout/orders/{}", order_id);
        let raw = self
            .send(Method::GET, &path, None, None, "paypal.get_order")
            .await?;
        Ok((decode(raw.clone())?, raw))
    }
}

#[async_trait]
impl PaymentProvider for PaypalClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Paypal
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ProviderError> {
        let order = self.create_order(request).await?;
        Ok(ChargeResult {
            redirect_url: order.approval_url(),
            status: order.payment_status(),
            external_id: order.id,
        })
    }

    async fn get_status(&self, external_id: &str) -> Result<ProviderPayment, ProviderError> {
        let (order, raw) = self.get_order(external_id).await?;
        Ok(ProviderPayment {
            status: order.payment_status(),
            amount: order.amount(),
            metadata: order.metadata(),
            capture_id: order.capture().map(|c| c.id.clone()),
            provider_status: order.status.clone(),
            id: order.id,
            customer_id: None,
            mandate_id: None,
            subscription_id: None,
            method: Some("paypal".to_string()),
            consumer_name: None,
            raw,
        })
    }

    async fn capture(&self, external_id: &str) -> Result<CaptureResult, ProviderError> {
        let path = format!("/v2/checkout/orders/{}/capture", external_id);
        let request_id = format!("capture-{}", external_id);
        let body = json!({});
        let value = self
            .send(
                Method::POST,
                &path,
                Some(&body),
                Some(request_id.as_str()),
                "paypal.capture",
            )
            .await?;
        let order: Order = decode(value)?;
        let capture_id = order.capture().map(|c| c.id.clone());
        tracing::info!(order_id = %external_id, capture_id = ?capture_id, status = %order.status, "PayPal order captured");
        Ok(CaptureResult {
            status: order.payment_status(),
            capture_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CredentialSource, ProviderCredentials};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct AppCredentials;

    #[async_trait]
    impl CredentialSource for AppCredentials {
        async fn load(&self, _provider: ProviderKind) -> Result<ProviderCredentials, ProviderError> {
            Ok(ProviderCredentials {
                client_id: Some("client".to_string()),
                secret: Secret::new("secret".to_string()),
            })
        }
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A21AA",
                "token_type": "Bearer",
                "expires_in": 32400
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn paypal(server: &MockServer) -> PaypalClient {
        PaypalClient::new(
            Client::new(),
            &server.uri(),
            RetryConfig::no_retry(),
            Arc::new(CredentialCache::new(Arc::new(AppCredentials))),
        )
    }

    fn charge() -> ChargeRequest {
        ChargeRequest {
            amount: Decimal::new(3000, 2),
            currency: "EUR".to_string(),
            idempotency_key: "inv_1".to_string(),
            description: "Viral Tenant 2026-03".to_string(),
            metadata: PaymentMetadata::invoice_payment("t1", "inv_1"),
            customer_id: None,
            mandate_id: None,
            redirect_url: Some("https://t1.example.com/billing/paypal/return".to_string()),
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn test_order_creation_reuses_token() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .and(header("PayPal-Request-Id", "inv_1"))
            .and(header("Authorization", "Bearer A21AA"))
            .and(body_partial_json(json!({"intent": "CAPTURE"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "ORDER-1",
                "status": "CREATED",
                "links": [
                    {"href": "https://api.paypal.com/v2/checkout/orders/ORDER-1", "rel": "self"},
                    {"href": "https://www.paypal.com/checkoutnow?token=ORDER-1", "rel": "approve"}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = paypal(&server);
        let first = client.create_charge(&charge()).await.unwrap();
        let second = client.create_charge(&charge()).await.unwrap();

        assert_eq!(first.external_id, "ORDER-1");
        assert_eq!(
            first.redirect_url.as_deref(),
            Some("https://www.paypal.com/checkoutnow?token=ORDER-1")
        );
        assert_eq!(first.status, PaymentStatus::Pending);
        assert_eq!(second.external_id, "ORDER-1");
    }

    #[tokio::test]
    async fn test_capture_and_status() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        let captured = json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "purchase_units": [{
                "reference_id": "inv_1",
                "custom_id": "t1",
                "amount": {"currency_code": "EUR", "value": "30.00"},
                "payments": {"captures": [{"id": "CAP-1", "status": "COMPLETED"}]}
            }]
        });
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders/ORDER-1/capture"))
            .respond_with(ResponseTemplate::new(201).set_body_json(captured.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/checkout/orders/ORDER-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(captured))
            .mount(&server)
            .await;

        let client = paypal(&server);
        let capture = client.capture("ORDER-1").await.unwrap();
        assert_eq!(capture.status, PaymentStatus::Succeeded);
        assert_eq!(capture.capture_id.as_deref(), Some("CAP-1"));

        let payment = client.get_status("ORDER-1").await.unwrap();
        assert_eq!(payment.amount, Some(Decimal::new(3000, 2)));
        assert_eq!(payment.metadata.unwrap().invoice_id.as_deref(), Some("inv_1"));
    }
}
