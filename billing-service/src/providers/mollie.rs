//! Mollie API v2 client.
//!
//! [`MollieApi`] is the raw HTTP surface and takes the bearer token per call, so the same
//! code serves the platform account (API key) and creator accounts reached through
//! Mollie Connect (OAuth access token).

use super::{
    decode, read_json, ChargeRequest, ChargeResult, CredentialCache, PaymentProvider,
    ProviderError, ProviderPayment,
};
use crate::models::{format_amount, PaymentMetadata, PaymentStatus, ProviderKind};
use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_core::retry::{retry_async, RetryConfig};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MollieAmount {
    pub currency: String,
    pub value: String,
}

impl MollieAmount {
    pub fn new(currency: &str, amount: Decimal) -> Self {
        Self {
            currency: currency.to_string(),
            value: format_amount(amount),
        }
    }

    pub fn to_decimal(&self) -> Option<Decimal> {
        Decimal::from_str(&self.value).ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MolliePayment {
    pub id: String,
    pub status: String,
    pub amount: Option<MollieAmount>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub customer_id: Option<String>,
    pub mandate_id: Option<String>,
    pub subscription_id: Option<String>,
    pub method: Option<String>,
    pub sequence_type: Option<String>,
    pub created_at: Option<String>,
    pub paid_at: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(rename = "_links", default)]
    pub links: Option<Value>,
}

impl MolliePayment {
    pub fn checkout_url(&self) -> Option<String> {
        self.links
            .as_ref()?
            .get("checkout")?
            .get("href")?
            .as_str()
            .map(str::to_string)
    }

    pub fn consumer_name(&self) -> Option<String> {
        self.details
            .as_ref()?
            .get("consumerName")?
            .as_str()
            .map(str::to_string)
    }

    fn into_provider_payment(self, raw: Value) -> ProviderPayment {
        ProviderPayment {
            status: PaymentStatus::from_mollie(&self.status),
            amount: self.amount.as_ref().and_then(MollieAmount::to_decimal),
            metadata: PaymentMetadata::from_value(&self.metadata),
            consumer_name: self.consumer_name(),
            id: self.id,
            provider_status: self.status,
            customer_id: self.customer_id,
            mandate_id: self.mandate_id,
            subscription_id: self.subscription_id,
            method: self.method,
            capture_id: None,
            raw,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MollieCustomer {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MollieMandate {
    pub id: String,
    pub status: String,
    pub method: Option<String>,
    pub created_at: Option<String>,
}

impl MollieMandate {
    pub fn is_valid(&self) -> bool {
        self.status == "valid"
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MollieSubscription {
    pub id: String,
    pub status: String,
    pub interval: Option<String>,
    pub next_payment_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MollieOrganization {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MollieProfile {
    pub id: String,
    pub status: Option<String>,
    pub name: Option<String>,
}

/// Payment to create. `sequenceType` follows from the fields: a mandate means a
/// recurring charge, a customer without a mandate means the first payment of a new mandate.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: MollieAmount,
    pub description: String,
    pub metadata: PaymentMetadata,
    pub customer_id: Option<String>,
    pub mandate_id: Option<String>,
    pub redirect_url: Option<String>,
    pub webhook_url: Option<String>,
    pub profile_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl NewPayment {
    fn body(&self) -> Value {
        let mut body = json!({
            "amount": self.amount,
            "description": self.description,
            "metadata": self.metadata.to_value(),
        });
        let sequence_type = match (&self.mandate_id, &self.customer_id) {
            (Some(_), _) => Some("recurring"),
            (None, Some(_)) => Some("first"),
            (None, None) => None,
        };
        let fields = [
            ("customerId", self.customer_id.as_deref()),
            ("mandateId", self.mandate_id.as_deref()),
            ("sequenceType", sequence_type),
            ("redirectUrl", self.redirect_url.as_deref()),
            ("webhookUrl", self.webhook_url.as_deref()),
            ("profileId", self.profile_id.as_deref()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                body[key] = Value::String(value.to_string());
            }
        }
        body
    }
}

fn embedded<T: serde::de::DeserializeOwned>(value: Value, key: &str) -> Result<Vec<T>, ProviderError> {
    match value.get("_embedded").and_then(|e| e.get(key)) {
        Some(items) => decode(items.clone()),
        None => Ok(Vec::new()),
    }
}

/// Raw Mollie v2 HTTP surface.
#[derive(Clone)]
pub struct MollieApi {
    client: Client,
    base_url: String,
    retry: RetryConfig,
    kind: ProviderKind,
}

impl MollieApi {
    pub fn new(client: Client, base_url: &str, retry: RetryConfig, kind: ProviderKind) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            kind,
        }
    }

    /// Every POST carries an idempotency key so that retries never create twice.
    async fn send(
        &self,
        token: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
        operation: &str,
    ) -> Result<Value, ProviderError> {
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

        retry_async(&self.retry, operation, || async {
            let mut request = self.client.request(method.clone(), &url).bearer_auth(token);
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            read_json(self.kind, operation, response).await
        })
        .await
    }

    pub async fn create_customer(
        &self,
        token: &str,
        name: &str,
        email: &str,
        metadata: &PaymentMetadata,
    ) -> Result<MollieCustomer, ProviderError> {
        let body = json!({ "name": name, "email": email, "metadata": metadata.to_value() });
        let value = self
            .send(token, Method::POST, "/customers", Some(&body), None, "mollie.create_customer")
            .await?;
        let customer: MollieCustomer = decode(value)?;
        tracing::info!(customer_id = %customer.id, tenant_id = %metadata.tenant_id, "Mollie customer created");
        Ok(customer)
    }

    pub async fn get_customer(&self, token: &str, customer_id: &str) -> Result<MollieCustomer, ProviderError> {
        let path = format!("/customers/{}", customer_id);
        decode(self.send(token, Method::GET, &path, None, None, "mollie.get_customer").await?)
    }

    pub async fn list_mandates(&self, token: &str, customer_id: &str) -> Result<Vec<MollieMandate>, ProviderError> {
        let path = format!("/customers/{}/mandates", customer_id);
        let value = self
            .send(token, Method::GET, &path, None, None, "mollie.list_mandates")
            .await?;
        embedded(value, "mandates")
    }

    pub async fn revoke_mandate(&self, token: &str, customer_id: &str, mandate_id: &str) -> Result<(), ProviderError> {
        let path = format!("/customers/{}/mandates/{}", customer_id, mandate_id);
        self.send(token, Method::DELETE, &path, None, None, "mollie.revoke_mandate")
            .await?;
        tracing::info!(customer_id = %customer_id, mandate_id = %mandate_id, "Mollie mandate revoked");
        Ok(())
    }

    pub async fn create_payment(&self, token: &str, payment: &NewPayment) -> Result<MolliePayment, ProviderError> {
        let body = payment.body();
        let value = self
            .send(
                token,
                Method::POST,
                "/payments",
                Some(&body),
                payment.idempotency_key.as_deref(),
                "mollie.create_payment",
            )
            .await?;
        let created: MolliePayment = decode(value)?;
        tracing::info!(
            payment_id = %created.id,
            tenant_id = %payment.metadata.tenant_id,
            amount = %payment.amount.value,
            sequence_type = created.sequence_type.as_deref().unwrap_or("oneoff"),
            "Mollie payment created"
        );
        Ok(created)
    }

    pub async fn get_payment(&self, token: &str, payment_id: &str) -> Result<(MolliePayment, Value), ProviderError> {
        let path = format!("/payments/{}", payment_id);
        let raw = self
            .send(token, Method::GET, &path, None, None, "mollie.get_payment")
            .await?;
        Ok((decode(raw.clone())?, raw))
    }

    pub async fn list_customer_payments(
        &self,
        token: &str,
        customer_id: &str,
        limit: u32,
    ) -> Result<Vec<Value>, ProviderError> {
        let path = format!("/customers/{}/payments?limit={}", customer_id, limit);
        let value = self
            .send(token, Method::GET, &path, None, None, "mollie.list_payments")
            .await?;
        embedded(value, "payments")
    }

    pub async fn create_subscription(
        &self,
        token: &str,
        customer_id: &str,
        body: &Value,
    ) -> Result<MollieSubscription, ProviderError> {
        let path = format!("/customers/{}/subscriptions", customer_id);
        let value = self
            .send(token, Method::POST, &path, Some(body), None, "mollie.create_subscription")
            .await?;
        decode(value)
    }

    pub async fn cancel_subscription(
        &self,
        token: &str,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<(), ProviderError> {
        let path = format!("/customers/{}/subscriptions/{}", customer_id, subscription_id);
        self.send(token, Method::DELETE, &path, None, None, "mollie.cancel_subscription")
            .await?;
        Ok(())
    }

    pub async fn current_organization(&self, token: &str) -> Result<MollieOrganization, ProviderError> {
        decode(
            self.send(token, Method::GET, "/organizations/me", None, None, "mollie.organization")
                .await?,
        )
    }

    pub async fn list_profiles(&self, token: &str) -> Result<Vec<MollieProfile>, ProviderError> {
        let value = self
            .send(token, Method::GET, "/profiles", None, None, "mollie.list_profiles")
            .await?;
        embedded(value, "profiles")
    }
}

fn new_payment_from(request: &ChargeRequest, profile_id: Option<String>) -> NewPayment {
    NewPayment {
        amount: MollieAmount::new(&request.currency, request.amount),
        description: request.description.clone(),
        metadata: request.metadata.clone(),
        customer_id: request.customer_id.clone(),
        mandate_id: request.mandate_id.clone(),
        redirect_url: request.redirect_url.clone(),
        webhook_url: request.webhook_url.clone(),
        profile_id,
        idempotency_key: Some(request.idempotency_key.clone()),
    }
}

/// Platform account, authenticated with the API key from the credential cache.
#[derive(Clone)]
pub struct MollieClient {
    api: MollieApi,
    credentials: Arc<CredentialCache>,
}

impl MollieClient {
    pub fn new(client: Client, base_url: &str, retry: RetryConfig, credentials: Arc<CredentialCache>) -> Self {
        Self {
            api: MollieApi::new(client, base_url, retry, ProviderKind::Mollie),
            credentials,
        }
    }

    async fn api_key(&self) -> Result<String, ProviderError> {
        let credentials = self.credentials.get(ProviderKind::Mollie).await?;
        Ok(credentials.secret.expose_secret().clone())
    }

    /// A 401 means the cached key is stale; drop it so the next call reloads.
    fn observe<T>(&self, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
        if matches!(&result, Err(e) if e.is_auth_failure()) {
            self.credentials.invalidate(ProviderKind::Mollie);
        }
        result
    }

    pub async fn create_customer(
        &self,
        name: &str,
        email: &str,
        metadata: &PaymentMetadata,
    ) -> Result<MollieCustomer, ProviderError> {
        let key = self.api_key().await?;
        self.observe(self.api.create_customer(&key, name, email, metadata).await)
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<MollieCustomer, ProviderError> {
        let key = self.api_key().await?;
        self.observe(self.api.get_customer(&key, customer_id).await)
    }

    pub async fn list_mandates(&self, customer_id: &str) -> Result<Vec<MollieMandate>, ProviderError> {
        let key = self.api_key().await?;
        self.observe(self.api.list_mandates(&key, customer_id).await)
    }

    pub async fn revoke_mandate(&self, customer_id: &str, mandate_id: &str) -> Result<(), ProviderError> {
        let key = self.api_key().await?;
        self.observe(self.api.revoke_mandate(&key, customer_id, mandate_id).await)
    }

    pub async fn create_payment(&self, payment: &NewPayment) -> Result<MolliePayment, ProviderError> {
        let key = self.api_key().await?;
        self.observe(self.api.create_payment(&key, payment).await)
    }

    pub async fn list_customer_payments(&self, customer_id: &str, limit: u32) -> Result<Vec<Value>, ProviderError> {
        let key = self.api_key().await?;
        self.observe(self.api.list_customer_payments(&key, customer_id, limit).await)
    }
}

#[async_trait]
impl PaymentProvider for MollieClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mollie
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ProviderError> {
        let payment = self.create_payment(&new_payment_from(request, None)).await?;
        Ok(ChargeResult {
            redirect_url: payment.checkout_url(),
            status: PaymentStatus::from_mollie(&payment.status),
            external_id: payment.id,
        })
    }

    async fn get_status(&self, external_id: &str) -> Result<ProviderPayment, ProviderError> {
        let key = self.api_key().await?;
        let (payment, raw) = self.observe(self.api.get_payment(&key, external_id).await)?;
        Ok(payment.into_provider_payment(raw))
    }
}

/// A creator's Mollie organization, reached with a delegated access token.
pub struct ConnectedMollie {
    api: MollieApi,
    access_token: Secret<String>,
    profile_id: Option<String>,
}

impl ConnectedMollie {
    pub fn new(api: MollieApi, access_token: Secret<String>, profile_id: Option<String>) -> Self {
        Self {
            api,
            access_token,
            profile_id,
        }
    }

    fn token(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub async fn create_customer(
        &self,
        name: &str,
        email: &str,
        metadata: &PaymentMetadata,
    ) -> Result<MollieCustomer, ProviderError> {
        self.api.create_customer(self.token(), name, email, metadata).await
    }

    pub async fn list_mandates(&self, customer_id: &str) -> Result<Vec<MollieMandate>, ProviderError> {
        self.api.list_mandates(self.token(), customer_id).await
    }

    pub async fn create_payment(&self, payment: NewPayment) -> Result<MolliePayment, ProviderError> {
        let payment = NewPayment {
            profile_id: payment.profile_id.or_else(|| self.profile_id.clone()),
            ..payment
        };
        self.api.create_payment(self.token(), &payment).await
    }

    pub async fn create_subscription(&self, customer_id: &str, body: Value) -> Result<MollieSubscription, ProviderError> {
        let mut body = body;
        if let Some(profile_id) = &self.profile_id {
            body["profileId"] = Value::String(profile_id.clone());
        }
        self.api.create_subscription(self.token(), customer_id, &body).await
    }

    pub async fn cancel_subscription(&self, customer_id: &str, subscription_id: &str) -> Result<(), ProviderError> {
        self.api
            .cancel_subscription(self.token(), customer_id, subscription_id)
            .await
    }
}

#[async_trait]
impl PaymentProvider for ConnectedMollie {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MollieConnect
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ProviderError> {
        let payment = self
            .create_payment(new_payment_from(request, self.profile_id.clone()))
            .await?;
        Ok(ChargeResult {
            redirect_url: payment.checkout_url(),
            status: PaymentStatus::from_mollie(&payment.status),
            external_id: payment.id,
        })
    }

    async fn get_status(&self, external_id: &str) -> Result<ProviderPayment, ProviderError> {
        let (payment, raw) = self.api.get_payment(self.token(), external_id).await?;
        Ok(payment.into_provider_payment(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CredentialSource, ProviderCredentials};
    use std::sync::atomic::{AtomicU64, Ordering};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticKey(AtomicU64);

    #[async_trait]
    impl CredentialSource for StaticKey {
        async fn load(&self, _provider: ProviderKind) -> Result<ProviderCredentials, ProviderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderCredentials {
                client_id: None,
                secret: Secret::new("test_key".to_string()),
            })
        }
    }

    fn client(server: &MockServer, retry: RetryConfig) -> (MollieClient, Arc<CredentialCache>) {
        let credentials = Arc::new(CredentialCache::new(Arc::new(StaticKey(AtomicU64::new(0)))));
        (
            MollieClient::new(Client::new(), &server.uri(), retry, credentials.clone()),
            credentials,
        )
    }

    fn payment_json(id: &str, status: &str) -> Value {
        json!({
            "resource": "payment",
            "id": id,
            "status": status,
            "amount": {"currency": "EUR", "value": "32.34"},
            "sequenceType": "recurring",
            "customerId": "cst_1",
            "mandateId": "mdt_1",
            "method": "directdebit",
            "metadata": {"version": 1, "tenantId": "t1", "purpose": "monthly_billing", "invoiceId": "inv_1"},
            "details": {"consumerName": "Ada Lovelace"},
            "_links": {"checkout": {"href": "https://pay.mollie.com/checkout/abc"}}
        })
    }

    fn recurring_request() -> ChargeRequest {
        ChargeRequest {
            amount: Decimal::from_str("32.34").unwrap(),
            currency: "EUR".to_string(),
            idempotency_key: "inv_1".to_string(),
            description: "Viral Tenant 2026-03 - Grundgebühr + Nutzung".to_string(),
            metadata: PaymentMetadata::monthly_billing("t1", "inv_1"),
            customer_id: Some("cst_1".to_string()),
            mandate_id: Some("mdt_1".to_string()),
            redirect_url: None,
            webhook_url: Some("https://api.example.com/billing/mollie/webhook".to_string()),
        }
    }

    #[tokio::test]
    async fn test_recurring_charge_uses_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(header("Idempotency-Key", "inv_1"))
            .and(header("Authorization", "Bearer test_key"))
            .and(body_partial_json(json!({
                "sequenceType": "recurring",
                "mandateId": "mdt_1",
                "amount": {"currency": "EUR", "value": "32.34"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(payment_json("tr_1", "pending")))
            .expect(1)
            .mount(&server)
            .await;

        let (mollie, _) = client(&server, RetryConfig::no_retry());
        let result = mollie.create_charge(&recurring_request()).await.unwrap();

        assert_eq!(result.external_id, "tr_1");
        assert_eq!(result.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_status_normalizes_payment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/tr_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payment_json("tr_1", "paid")))
            .mount(&server)
            .await;

        let (mollie, _) = client(&server, RetryConfig::no_retry());
        let payment = mollie.get_status("tr_1").await.unwrap();

        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.amount, Some(Decimal::from_str("32.34").unwrap()));
        assert_eq!(payment.mandate_id.as_deref(), Some("mdt_1"));
        assert_eq!(payment.consumer_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(payment.metadata.unwrap().invoice_id.as_deref(), Some("inv_1"));
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/tr_1"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "status": 401, "title": "Unauthorized Request", "detail": "Missing authentication"
            })))
            .mount(&server)
            .await;

        let (mollie, credentials) = client(&server, RetryConfig::no_retry());
        let err = mollie.get_status("tr_1").await.unwrap_err();
        assert!(err.is_auth_failure());

        let _ = mollie.get_status("tr_1").await;
        assert_eq!(credentials.load_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/tr_1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/payments/tr_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payment_json("tr_1", "open")))
            .mount(&server)
            .await;

        let retry = RetryConfig {
            max_retries: 2,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        };
        let (mollie, _) = client(&server, retry);
        let payment = mollie.get_status("tr_1").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "status": 422, "title": "Unprocessable Entity", "detail": "The mandate is invalid"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (mollie, _) = client(&server, RetryConfig::with_max_retries(3));
        let err = mollie.create_charge(&recurring_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { ref message, .. } if message == "The mandate is invalid"));
    }

    #[test]
    fn test_first_payment_body() {
        let payment = NewPayment {
            amount: MollieAmount::new("EUR", Decimal::new(1, 2)),
            description: "setup".to_string(),
            metadata: PaymentMetadata::mandate_setup("t1"),
            customer_id: Some("cst_1".to_string()),
            mandate_id: None,
            redirect_url: Some("https://t1.example.com/tenant?tenantId=t1".to_string()),
            webhook_url: None,
            profile_id: None,
            idempotency_key: None,
        };
        let body = payment.body();
        assert_eq!(body["sequenceType"], "first");
        assert_eq!(body["amount"]["value"], "0.01");
        assert_eq!(body["metadata"]["purpose"], "mandate_setup");
        assert!(body.get("mandateId").is_none());
    }
}
