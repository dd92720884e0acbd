//! Stripe REST client (form-encoded v1 API) and webhook signature verification.

use super::{
    decode, read_json, CaptureResult, ChargeRequest, ChargeResult, CredentialCache,
    PaymentProvider, ProviderError, ProviderPayment,
};
use crate::models::{round_money, PaymentMetadata, PaymentStatus, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::retry::{retry_async, RetryConfig};
use service_core::utils::verify_hmac_sha256_hex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetupIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CardDetails {
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<u32>,
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct SepaDetails {
    pub last4: Option<String>,
    pub bank_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct StripePaymentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub card: Option<CardDetails>,
    pub sepa_debit: Option<SepaDetails>,
}

impl StripePaymentMethod {
    pub fn last4(&self) -> Option<String> {
        self.card
            .as_ref()
            .and_then(|c| c.last4.clone())
            .or_else(|| self.sepa_debit.as_ref().and_then(|s| s.last4.clone()))
    }

    /// Card brand, or `sepa` for a SEPA debit.
    pub fn brand(&self) -> Option<String> {
        match (&self.card, &self.sepa_debit) {
            (Some(card), _) => card.brand.clone(),
            (None, Some(_)) => Some("sepa".to_string()),
            (None, None) => None,
        }
    }
}

/// Unix seconds as returned by Stripe.
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<i64>,
    /// Expanded only on creation.
    #[serde(default)]
    pub latest_invoice: Option<Value>,
}

impl StripeSubscription {
    /// Secret of the first invoice's PaymentIntent, for confirming it in the browser.
    pub fn client_secret(&self) -> Option<String> {
        self.latest_invoice
            .as_ref()?
            .get("payment_intent")?
            .get("client_secret")?
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceItem {
    pub id: String,
    pub amount: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusTransitions {
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: String,
    pub period_start: i64,
    pub period_end: i64,
    pub created: i64,
    #[serde(default)]
    pub status_transitions: StatusTransitions,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub customer: Option<String>,
    pub payment_method: Option<String>,
    pub latest_charge: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub next_action: Option<Value>,
}

impl PaymentIntent {
    fn redirect_url(&self) -> Option<String> {
        self.next_action
            .as_ref()?
            .get("redirect_to_url")?
            .get("url")?
            .as_str()
            .map(str::to_string)
    }

    fn into_provider_payment(self, raw: Value) -> ProviderPayment {
        ProviderPayment {
            status: PaymentStatus::from_stripe(&self.status),
            amount: Some(Decimal::new(self.amount, 2)),
            metadata: PaymentMetadata::from_string_map(&self.metadata),
            id: self.id,
            provider_status: self.status,
            customer_id: self.customer,
            mandate_id: self.payment_method,
            subscription_id: None,
            method: None,
            consumer_name: None,
            capture_id: self.latest_charge,
            raw,
        }
    }
}

fn to_minor_units(amount: Decimal) -> Result<i64, ProviderError> {
    (round_money(amount) * Decimal::from(100))
        .to_i64()
        .ok_or_else(|| ProviderError::Decode(format!("amount {} out of range", amount)))
}

fn metadata_fields(metadata: &PaymentMetadata, form: &mut Vec<(String, String)>) {
    let mut entries: Vec<_> = metadata.to_string_map().into_iter().collect();
    entries.sort();
    for (key, value) in entries {
        form.push((format!("metadata[{}]", key), value));
    }
}

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
    credentials: Arc<CredentialCache>,
}

impl StripeClient {
    pub fn new(client: Client, base_url: &str, retry: RetryConfig, credentials: Arc<CredentialCache>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            credentials,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
        idempotency_key: Option<&str>,
        operation: &str,
    ) -> Result<Value, ProviderError> {
        let credentials = self.credentials.get(ProviderKind::Stripe).await?;
        let url = format!("{}{}", self.base_url, path);
        let generated_key;
        let idempotency_key = match (idempotency_key, method == Method::POST) {
            (Some(key), _) => Some(key),
            (None, true) => {
                generated_key = Uuid::new_v4().to_string();
                Some(generated_key.as_str())
            }
            (None, false) => None,
        };

        let result = retry_async(&self.retry, operation, || async {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(credentials.secret.expose_secret());
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }
            if let Some(form) = form {
                request = request.form(form);
            }
            let response = request.send().await?;
            read_json(ProviderKind::Stripe, operation, response).await
        })
        .await;

        if matches!(&result, Err(e) if e.is_auth_failure()) {
            self.credentials.invalidate(ProviderKind::Stripe);
        }
        result
    }

    pub async fn create_customer(
        &self,
        email: &str,
        name: &str,
        metadata: &PaymentMetadata,
    ) -> Result<StripeCustomer, ProviderError> {
        let mut form = vec![
            ("email".to_string(), email.to_string()),
            ("name".to_string(), name.to_string()),
        ];
        metadata_fields(metadata, &mut form);
        let value = self
            .send(Method::POST, "/v1/customers", Some(form.as_slice()), None, "stripe.create_customer")
            .await?;
        let customer: StripeCustomer = decode(value)?;
        tracing::info!(customer_id = %customer.id, tenant_id = %metadata.tenant_id, "Stripe customer created");
        Ok(customer)
    }

    pub async fn create_setup_intent(
        &self,
        customer_id: &str,
        metadata: &PaymentMetadata,
    ) -> Result<SetupIntent, ProviderError> {
        let mut form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("payment_method_types[]".to_string(), "card".to_string()),
            ("payment_method_types[]".to_string(), "sepa_debit".to_string()),
            ("usage".to_string(), "off_session".to_string()),
        ];
        metadata_fields(metadata, &mut form);
        decode(
            self.send(Method::POST, "/v1/setup_intents", Some(form.as_slice()), None, "stripe.create_setup_intent")
                .await?,
        )
    }

    pub async fn list_payment_methods(&self, customer_id: &str) -> Result<Vec<StripePaymentMethod>, ProviderError> {
        let path = format!("/v1/customers/{}/payment_methods", customer_id);
        let value = self
            .send(Method::GET, &path, None, None, "stripe.list_payment_methods")
            .await?;
        match value.get("data") {
            Some(data) => decode(data.clone()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<StripePaymentMethod, ProviderError> {
        let path = format!("/v1/payment_methods/{}/attach", payment_method_id);
        let form = vec![("customer".to_string(), customer_id.to_string())];
        decode(
            self.send(Method::POST, &path, Some(form.as_slice()), None, "stripe.attach_payment_method")
                .await?,
        )
    }

    pub async fn detach_payment_method(&self, payment_method_id: &str) -> Result<(), ProviderError> {
        let path = format!("/v1/payment_methods/{}/detach", payment_method_id);
        let form: Vec<(String, String)> = Vec::new();
        self.send(Method::POST, &path, Some(form.as_slice()), None, "stripe.detach_payment_method")
            .await?;
        Ok(())
    }

    pub async fn get_payment_method(&self, payment_method_id: &str) -> Result<StripePaymentMethod, ProviderError> {
        let path = format!("/v1/payment_methods/{}", payment_method_id);
        decode(
            self.send(Method::GET, &path, None, None, "stripe.get_payment_method")
                .await?,
        )
    }

    /// Make the method the default for the customer's invoices.
    pub async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), ProviderError> {
        let path = format!("/v1/customers/{}", customer_id);
        let form = vec![(
            "invoice_settings[default_payment_method]".to_string(),
            payment_method_id.to_string(),
        )];
        self.send(Method::POST, &path, Some(form.as_slice()), None, "stripe.set_default_payment_method")
            .await?;
        Ok(())
    }

    /// Subscription on `price_id` that starts incomplete until its first invoice is paid.
    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &PaymentMetadata,
    ) -> Result<StripeSubscription, ProviderError> {
        let mut form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("payment_behavior".to_string(), "default_incomplete".to_string()),
            (
                "payment_settings[save_default_payment_method]".to_string(),
                "on_subscription".to_string(),
            ),
            ("expand[]".to_string(), "latest_invoice.payment_intent".to_string()),
        ];
        metadata_fields(metadata, &mut form);
        let subscription: StripeSubscription = decode(
            self.send(Method::POST, "/v1/subscriptions", Some(form.as_slice()), None, "stripe.create_subscription")
                .await?,
        )?;
        tracing::info!(
            subscription_id = %subscription.id,
            tenant_id = %metadata.tenant_id,
            status = %subscription.status,
            "Stripe subscription created"
        );
        Ok(subscription)
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> Result<StripeSubscription, ProviderError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);
        decode(
            self.send(Method::GET, &path, None, None, "stripe.get_subscription")
                .await?,
        )
    }

    /// End the subscription now, or flag it to end with the current period.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediately: bool,
    ) -> Result<StripeSubscription, ProviderError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);
        let value = if immediately {
            self.send(Method::DELETE, &path, None, None, "stripe.cancel_subscription")
                .await?
        } else {
            let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
            self.send(Method::POST, &path, Some(form.as_slice()), None, "stripe.cancel_subscription")
                .await?
        };
        decode(value)
    }

    /// Pending item that lands on the customer's next invoice.
    pub async fn create_invoice_item(
        &self,
        customer_id: &str,
        amount: Decimal,
        currency: &str,
        description: &str,
    ) -> Result<InvoiceItem, ProviderError> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("amount".to_string(), to_minor_units(amount)?.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("description".to_string(), description.to_string()),
        ];
        decode(
            self.send(Method::POST, "/v1/invoiceitems", Some(form.as_slice()), None, "stripe.create_invoice_item")
                .await?,
        )
    }

    pub async fn list_invoices(&self, customer_id: &str, limit: u32) -> Result<Vec<StripeInvoice>, ProviderError> {
        let path = format!("/v1/invoices?customer={}&limit={}", customer_id, limit);
        let value = self
            .send(Method::GET, &path, None, None, "stripe.list_invoices")
            .await?;
        match value.get("data") {
            Some(data) => decode(data.clone()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_payment_intent(&self, payment_intent_id: &str) -> Result<(PaymentIntent, Value), ProviderError> {
        let path = format!("/v1/payment_intents/{}", payment_intent_id);
        let raw = self
            .send(Method::GET, &path, None, None, "stripe.get_payment_intent")
            .await?;
        Ok((decode(raw.clone())?, raw))
    }

    /// PaymentIntent for the request, keyed by its idempotency key. The client secret lets
    /// a browser confirm an on-session payment.
    pub async fn create_payment_intent(&self, request: &ChargeRequest) -> Result<PaymentIntent, ProviderError> {
        let mut form = vec![
            ("amount".to_string(), to_minor_units(request.amount)?.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("description".to_string(), request.description.clone()),
        ];
        if let Some(customer_id) = &request.customer_id {
            form.push(("customer".to_string(), customer_id.clone()));
        }
        match &request.mandate_id {
            Some(payment_method) => {
                form.push(("payment_method".to_string(), payment_method.clone()));
                form.push(("confirm".to_string(), "true".to_string()));
                form.push(("off_session".to_string(), "true".to_string()));
            }
            None => form.push((
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            )),
        }
        metadata_fields(&request.metadata, &mut form);

        let value = self
            .send(
                Method::POST,
                "/v1/payment_intents",
                Some(form.as_slice()),
                Some(request.idempotency_key.as_str()),
                "stripe.create_payment_intent",
            )
            .await?;
        let intent: PaymentIntent = decode(value)?;
        tracing::info!(
            payment_id = %intent.id,
            tenant_id = %request.metadata.tenant_id,
            status = %intent.status,
            "Stripe payment intent created"
        );
        Ok(intent)
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ProviderError> {
        let intent = self.create_payment_intent(request).await?;
        Ok(ChargeResult {
            redirect_url: intent.redirect_url(),
            status: PaymentStatus::from_stripe(&intent.status),
            external_id: intent.id,
        })
    }

    async fn get_status(&self, external_id: &str) -> Result<ProviderPayment, ProviderError> {
        let (intent, raw) = self.get_payment_intent(external_id).await?;
        Ok(intent.into_provider_payment(raw))
    }

    async fn capture(&self, external_id: &str) -> Result<CaptureResult, ProviderError> {
        let path = format!("/v1/payment_intents/{}/capture", external_id);
        let key = format!("capture-{}", external_id);
        let form: Vec<(String, String)> = Vec::new();
        let value = self
            .send(Method::POST, &path, Some(form.as_slice()), Some(key.as_str()), "stripe.capture")
            .await?;
        let intent: PaymentIntent = decode(value)?;
        Ok(CaptureResult {
            status: PaymentStatus::from_stripe(&intent.status),
            capture_id: intent.latest_charge,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing Stripe-Signature header")]
    Missing,

    #[error("malformed Stripe-Signature header")]
    Malformed,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("no matching signature")]
    Mismatch,
}

/// Verifies `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]` headers.
#[derive(Clone)]
pub struct StripeWebhookVerifier {
    secret: Secret<String>,
    tolerance_secs: i64,
}

impl StripeWebhookVerifier {
    pub fn new(secret: Secret<String>, tolerance_secs: i64) -> Self {
        Self {
            secret,
            tolerance_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.secret.expose_secret().is_empty()
    }

    pub fn verify(&self, header: Option<&str>, body: &[u8], now: DateTime<Utc>) -> Result<(), SignatureError> {
        let header = header.ok_or(SignatureError::Missing)?;
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed);
        }
        if (now.timestamp() - timestamp).abs() > self.tolerance_secs {
            return Err(SignatureError::Expired);
        }

        let mut signed_payload = format!("{}.", timestamp).into_bytes();
        signed_payload.extend_from_slice(body);
        let secret = self.secret.expose_secret().as_bytes();
        for signature in signatures {
            if verify_hmac_sha256_hex(secret, &signed_payload, signature).unwrap_or(false) {
                return Ok(());
            }
        }
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CredentialSource, ProviderCredentials};
    use serde_json::json;
    use service_core::utils::hmac_sha256_hex;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct SecretKey;

    #[async_trait]
    impl CredentialSource for SecretKey {
        async fn load(&self, _provider: ProviderKind) -> Result<ProviderCredentials, ProviderError> {
            Ok(ProviderCredentials {
                client_id: None,
                secret: Secret::new("sk_test_1".to_string()),
            })
        }
    }

    fn stripe(server: &MockServer) -> StripeClient {
        StripeClient::new(
            Client::new(),
            &server.uri(),
            RetryConfig::no_retry(),
            Arc::new(CredentialCache::new(Arc::new(SecretKey))),
        )
    }

    fn intent_json(status: &str) -> Value {
        json!({
            "id": "pi_1",
            "object": "payment_intent",
            "status": status,
            "amount": 3234,
            "currency": "eur",
            "customer": "cus_1",
            "payment_method": "pm_1",
            "latest_charge": "ch_1",
            "metadata": {"version": "1", "tenantId": "t1", "purpose": "invoice_payment", "invoiceId": "inv_1"}
        })
    }

    #[tokio::test]
    async fn test_payment_intent_is_form_encoded_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("Idempotency-Key", "inv_1"))
            .and(body_string_contains("amount=3234"))
            .and(body_string_contains("currency=eur"))
            .and(body_string_contains("metadata%5BinvoiceId%5D=inv_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(intent_json("requires_action")))
            .expect(1)
            .mount(&server)
            .await;

        let request = ChargeRequest {
            amount: Decimal::new(3234, 2),
            currency: "EUR".to_string(),
            idempotency_key: "inv_1".to_string(),
            description: "Invoice INV-202603-0000AAAA".to_string(),
            metadata: PaymentMetadata::invoice_payment("t1", "inv_1"),
            customer_id: Some("cus_1".to_string()),
            mandate_id: None,
            redirect_url: None,
            webhook_url: None,
        };
        let result = stripe(&server).create_charge(&request).await.unwrap();
        assert_eq!(result.external_id, "pi_1");
        assert_eq!(result.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_status_reads_string_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(intent_json("succeeded")))
            .mount(&server)
            .await;

        let payment = stripe(&server).get_status("pi_1").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.amount, Some(Decimal::new(3234, 2)));
        assert_eq!(payment.capture_id.as_deref(), Some("ch_1"));
        let metadata = payment.metadata.unwrap();
        assert_eq!(metadata.tenant_id, "t1");
        assert_eq!(metadata.invoice_id.as_deref(), Some("inv_1"));
    }

    #[tokio::test]
    async fn test_capture() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents/pi_1/capture"))
            .respond_with(ResponseTemplate::new(200).set_body_json(intent_json("succeeded")))
            .mount(&server)
            .await;

        let capture = stripe(&server).capture("pi_1").await.unwrap();
        assert_eq!(capture.status, PaymentStatus::Succeeded);
        assert_eq!(capture.capture_id.as_deref(), Some("ch_1"));
    }

    #[tokio::test]
    async fn test_subscription_is_created_incomplete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions"))
            .and(body_string_contains("items%5B0%5D%5Bprice%5D=price_base"))
            .and(body_string_contains("payment_behavior=default_incomplete"))
            .and(body_string_contains("expand%5B%5D=latest_invoice.payment_intent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1",
                "status": "incomplete",
                "current_period_start": 1767225600,
                "current_period_end": 1769904000,
                "cancel_at_period_end": false,
                "latest_invoice": {"id": "in_1", "payment_intent": {"id": "pi_1", "client_secret": "pi_1_secret"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let subscription = stripe(&server)
            .create_subscription("cus_1", "price_base", &PaymentMetadata::mandate_setup("t1"))
            .await
            .unwrap();
        assert_eq!(subscription.status, "incomplete");
        assert_eq!(subscription.client_secret().as_deref(), Some("pi_1_secret"));
        assert_eq!(
            subscription.current_period_start.and_then(from_unix),
            Some(chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_updates_instead_of_deleting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions/sub_1"))
            .and(body_string_contains("cancel_at_period_end=true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1", "status": "active", "cancel_at_period_end": true
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/subscriptions/sub_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1", "status": "canceled", "cancel_at_period_end": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = stripe(&server);
        let later = client.cancel_subscription("sub_1", false).await.unwrap();
        assert!(later.cancel_at_period_end);
        let now = client.cancel_subscription("sub_1", true).await.unwrap();
        assert_eq!(now.status, "canceled");
    }

    #[tokio::test]
    async fn test_invoice_item_in_minor_units() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoiceitems"))
            .and(body_string_contains("amount=1250"))
            .and(body_string_contains("currency=eur"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ii_1", "amount": 1250, "description": "Infrastrukturkosten"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let item = stripe(&server)
            .create_invoice_item("cus_1", Decimal::new(125, 1), "EUR", "Infrastrukturkosten")
            .await
            .unwrap();
        assert_eq!(item.id, "ii_1");
        assert_eq!(item.amount, 1250);
    }

    #[test]
    fn test_sepa_method_reports_sepa_brand() {
        let method: StripePaymentMethod = serde_json::from_value(json!({
            "id": "pm_2", "type": "sepa_debit", "sepa_debit": {"last4": "3000", "bank_code": "37040044"}
        }))
        .unwrap();
        assert_eq!(method.brand().as_deref(), Some("sepa"));
        assert_eq!(method.last4().as_deref(), Some("3000"));
        let view = serde_json::to_value(&method).unwrap();
        assert_eq!(view["sepaDebit"]["bankCode"], "37040044");
    }

    fn signed_header(secret: &str, timestamp: i64, body: &str) -> String {
        let payload = format!("{}.{}", timestamp, body);
        let signature = hmac_sha256_hex(secret.as_bytes(), payload.as_bytes()).unwrap();
        format!("t={},v1={}", timestamp, signature)
    }

    #[test]
    fn test_signature_verification() {
        let verifier = StripeWebhookVerifier::new(Secret::new("whsec_test".to_string()), 300);
        let now = Utc::now();
        let body = r#"{"type":"payment_intent.succeeded"}"#;

        let valid = signed_header("whsec_test", now.timestamp(), body);
        assert_eq!(verifier.verify(Some(valid.as_str()), body.as_bytes(), now), Ok(()));

        let wrong_secret = signed_header("whsec_other", now.timestamp(), body);
        assert_eq!(
            verifier.verify(Some(wrong_secret.as_str()), body.as_bytes(), now),
            Err(SignatureError::Mismatch)
        );

        let stale = signed_header("whsec_test", now.timestamp() - 301, body);
        assert_eq!(
            verifier.verify(Some(stale.as_str()), body.as_bytes(), now),
            Err(SignatureError::Expired)
        );

        assert_eq!(verifier.verify(None, body.as_bytes(), now), Err(SignatureError::Missing));
        assert_eq!(
            verifier.verify(Some("v1=abc"), body.as_bytes(), now),
            Err(SignatureError::Malformed)
        );
    }
}
