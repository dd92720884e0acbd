//! Test helper module for billing-service integration tests.
//!
//! The app runs against in-memory backends; provider APIs are served by wiremock.

#![allow(dead_code)]

use billing_service::config::BillingConfig;
use billing_service::models::{TenantProfile, UsageBreakdown};
use billing_service::services::{init_metrics, InMemoryBlobStore, MockEmailSender, StaticCostReporter, UrlSigner};
use billing_service::startup::{Application, Backends};
use billing_service::store::InMemoryBillingStore;
use billing_service::providers::ConfigCredentialSource;
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use wiremock::MockServer;

pub const TEST_TENANT_ID: &str = "acme";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test";
pub const BLOB_BASE_URL: &str = "http://blobs.test";

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub store: Arc<InMemoryBillingStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub email: Arc<MockEmailSender>,
    pub mollie: MockServer,
    pub stripe: MockServer,
    pub paypal: MockServer,
}

impl TestApp {
    /// Spawn a new test application on a random port.
    pub async fn spawn() -> Self {
        init_metrics();

        let mollie = MockServer::start().await;
        let stripe = MockServer::start().await;
        let paypal = MockServer::start().await;

        let vars: HashMap<&str, String> = HashMap::from([
            ("API_BASE_URL", "https://api.example.com".to_string()),
            ("MOLLIE_API_BASE_URL", mollie.uri()),
            ("MOLLIE_API_KEY", "test_mollie_key".to_string()),
            ("STRIPE_API_BASE_URL", stripe.uri()),
            ("STRIPE_SECRET_KEY", "sk_test_1".to_string()),
            ("STRIPE_WEBHOOK_SECRET", STRIPE_WEBHOOK_SECRET.to_string()),
            ("PAYPAL_API_BASE_URL", paypal.uri()),
            ("PAYPAL_CLIENT_ID", "paypal_client".to_string()),
            ("PAYPAL_CLIENT_SECRET", "paypal_secret".to_string()),
            ("BLOB_PUBLIC_BASE_URL", BLOB_BASE_URL.to_string()),
            ("BLOB_SIGNING_SECRET", "blob_secret".to_string()),
            ("PROVIDER_MAX_RETRIES", "0".to_string()),
        ]);
        let common = CoreConfig {
            port: 0,
            ..CoreConfig::default()
        };
        let config = BillingConfig::from_lookup(common, |key| vars.get(key).cloned())
            .expect("Failed to build test configuration");

        let usage = UsageBreakdown::from([
            ("s3".to_string(), dec("2.10")),
            ("lambda".to_string(), dec("0.24")),
        ]);
        let signer = UrlSigner::new(BLOB_BASE_URL, Secret::new("blob_secret".to_string()));
        let store = Arc::new(InMemoryBillingStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new(signer.clone()));
        let email = Arc::new(MockEmailSender::new());

        let backends = Backends {
            store: store.clone(),
            blobs: blobs.clone(),
            signer,
            email: email.clone(),
            costs: Arc::new(StaticCostReporter::new().with_tenant(TEST_TENANT_ID, usage)),
            credentials: Arc::new(ConfigCredentialSource::new(config.clone())),
        };

        let app = Application::build_with(config, backends)
            .await
            .expect("Failed to build test application");
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
            store,
            blobs,
            email,
            mollie,
            stripe,
            paypal,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Signed download urls are issued under the public blob host; point them at this app.
    pub fn local_blob_url(&self, signed_url: &str) -> String {
        signed_url.replacen(BLOB_BASE_URL, &self.address, 1)
    }

    pub async fn seed_tenant(&self, tenant_id: &str) {
        use billing_service::store::BillingStore;

        let mut tenant = TenantProfile::new(tenant_id);
        tenant.company_name = Some("Acme GmbH".to_string());
        tenant.billing_email = Some("billing@acme.test".to_string());
        tenant.street = Some("Hauptstrasse 1".to_string());
        tenant.postal_code = Some("8000".to_string());
        tenant.city = Some("Zürich".to_string());
        self.store
            .put_tenant(&tenant)
            .await
            .expect("Failed to seed tenant");
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn put_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .put(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }
}
