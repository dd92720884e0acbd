//! Shared fakes for service unit tests.

use crate::config::{BillingSettings, MollieConnectConfig};
use crate::models::{PaymentMetadata, PaymentStatus, ProviderKind};
use crate::providers::{
    ChargeRequest, ChargeResult, CredentialCache, CredentialSource, MollieApi, MollieClient, MollieOAuthClient,
    PaymentProvider, ProviderCredentials, ProviderError, ProviderPayment,
};
use crate::services::oauth_bridge::ConnectBridge;
use crate::store::BillingStore;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::Value;
use service_core::retry::RetryConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn settings() -> BillingSettings {
    BillingSettings {
        base_fee: Decimal::from(30),
        currency: "EUR".to_string(),
        vat_rate: Decimal::new(77, 1),
        verification_amount: Decimal::new(1, 2),
        api_base_url: "https://api.example.com".to_string(),
        brand_name: "Viral Tenant".to_string(),
        tenant_redirect_template: "https://{tenantId}.example.com/tenant".to_string(),
        estimate_cache_ttl_secs: 3600,
        provider_max_retries: 0,
    }
}

/// Records charge requests and answers status lookups from a fixed table.
pub struct FakeProvider {
    kind: ProviderKind,
    charges: Mutex<Vec<ChargeRequest>>,
    payments: Mutex<HashMap<String, ProviderPayment>>,
    fail_with: Mutex<Option<ProviderError>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::of_kind(ProviderKind::Mollie)
    }

    pub fn of_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            charges: Mutex::new(Vec::new()),
            payments: Mutex::new(HashMap::new()),
            fail_with: Mutex::new(None),
        }
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    pub fn fail_charges_with(&self, err: ProviderError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn set_payment(&self, payment: ProviderPayment) {
        self.payments.lock().unwrap().insert(payment.id.clone(), payment);
    }
}

pub fn payment(id: &str, status: PaymentStatus, amount: &str, metadata: PaymentMetadata) -> ProviderPayment {
    ProviderPayment {
        id: id.to_string(),
        status,
        provider_status: status.as_str().to_lowercase(),
        amount: amount.parse().ok(),
        metadata: Ok(metadata),
        customer_id: Some("cst_1".to_string()),
        mandate_id: Some("mdt_1".to_string()),
        subscription_id: None,
        method: Some("directdebit".to_string()),
        consumer_name: Some("Acme GmbH".to_string()),
        capture_id: None,
        raw: Value::Null,
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeResult, ProviderError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        let mut charges = self.charges.lock().unwrap();
        charges.push(request.clone());
        Ok(ChargeResult {
            external_id: format!("tr_{}", charges.len()),
            redirect_url: None,
            status: PaymentStatus::Pending,
        })
    }

    async fn get_status(&self, external_id: &str) -> Result<ProviderPayment, ProviderError> {
        self.payments
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(external_id.to_string()))
    }
}

/// Same fixed secret for every provider.
pub struct StaticCredentials;

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn load(&self, provider: ProviderKind) -> Result<ProviderCredentials, ProviderError> {
        Ok(ProviderCredentials {
            client_id: Some(format!("{}_client", provider)),
            secret: Secret::new("test_secret".to_string()),
        })
    }
}

pub fn credentials() -> Arc<CredentialCache> {
    Arc::new(CredentialCache::new(Arc::new(StaticCredentials)))
}

pub fn mollie_client(base_url: &str) -> MollieClient {
    MollieClient::new(Client::new(), base_url, RetryConfig::no_retry(), credentials())
}

pub fn connect_config(base_url: &str) -> MollieConnectConfig {
    MollieConnectConfig {
        client_id: "app_1".to_string(),
        client_secret: Secret::new("app_secret".to_string()),
        redirect_uri: "https://api.example.com/billing/mollie/connect/callback".to_string(),
        authorize_url: format!("{}/oauth2/authorize", base_url),
        token_url: format!("{}/oauth2/tokens", base_url),
        api_base_url: base_url.to_string(),
        state_secret: Secret::new("state_secret".to_string()),
        state_max_age_secs: 3600,
    }
}

pub fn connect_bridge(store: Arc<dyn BillingStore>, base_url: &str) -> ConnectBridge {
    let config = connect_config(base_url);
    let oauth = MollieOAuthClient::new(
        Client::new(),
        &config.authorize_url,
        &config.token_url,
        &config.redirect_uri,
        credentials(),
    );
    let api = MollieApi::new(Client::new(), base_url, RetryConfig::no_retry(), ProviderKind::MollieConnect);
    ConnectBridge::new(store, oauth, api, &config, settings())
}
