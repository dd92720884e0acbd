//! Process-wide provider credential cache.
//!
//! Credentials are loaded lazily from a [`CredentialSource`] and kept until a provider
//! rejects them, at which point the client invalidates the entry and the next call reloads.

use super::ProviderError;
use crate::config::BillingConfig;
use crate::models::ProviderKind;
use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProviderCredentials {
    /// OAuth client id, for providers that use one.
    pub client_id: Option<String>,
    pub secret: Secret<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load(&self, provider: ProviderKind) -> Result<ProviderCredentials, ProviderError>;
}

/// Reads credentials from the service configuration.
pub struct ConfigCredentialSource {
    config: BillingConfig,
}

impl ConfigCredentialSource {
    pub fn new(config: BillingConfig) -> Self {
        Self { config }
    }
}

fn required(name: &str, secret: &Secret<String>) -> Result<Secret<String>, ProviderError> {
    if secret.expose_secret().is_empty() {
        return Err(ProviderError::NotConfigured(format!("{} is not set", name)));
    }
    Ok(secret.clone())
}

#[async_trait]
impl CredentialSource for ConfigCredentialSource {
    async fn load(&self, provider: ProviderKind) -> Result<ProviderCredentials, ProviderError> {
        match provider {
            ProviderKind::Mollie => Ok(ProviderCredentials {
                client_id: None,
                secret: required("MOLLIE_API_KEY", &self.config.mollie.api_key)?,
            }),
            ProviderKind::Stripe => Ok(ProviderCredentials {
                client_id: None,
                secret: required("STRIPE_SECRET_KEY", &self.config.stripe.secret_key)?,
            }),
            ProviderKind::Paypal => {
                if self.config.paypal.client_id.is_empty() {
                    return Err(ProviderError::NotConfigured(
                        "PAYPAL_CLIENT_ID is not set".to_string(),
                    ));
                }
                Ok(ProviderCredentials {
                    client_id: Some(self.config.paypal.client_id.clone()),
                    secret: required("PAYPAL_CLIENT_SECRET", &self.config.paypal.client_secret)?,
                })
            }
            ProviderKind::MollieConnect => {
                if self.config.mollie_connect.client_id.is_empty() {
                    return Err(ProviderError::NotConfigured(
                        "MOLLIE_CONNECT_CLIENT_ID is not set".to_string(),
                    ));
                }
                Ok(ProviderCredentials {
                    client_id: Some(self.config.mollie_connect.client_id.clone()),
                    secret: required(
                        "MOLLIE_CONNECT_CLIENT_SECRET",
                        &self.config.mollie_connect.client_secret,
                    )?,
                })
            }
        }
    }
}

pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    entries: DashMap<ProviderKind, ProviderCredentials>,
    loads: AtomicU64,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            entries: DashMap::new(),
            loads: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, provider: ProviderKind) -> Result<ProviderCredentials, ProviderError> {
        if let Some(entry) = self.entries.get(&provider) {
            return Ok(entry.value().clone());
        }

        // Two callers may both miss and load; the later insert simply wins.
        let credentials = self.source.load(provider).await?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(provider, credentials.clone());
        tracing::debug!(provider = %provider, "Provider credentials loaded");
        Ok(credentials)
    }

    /// Drop the cached entry, e.g. after the provider answered 401 or a secret was rotated.
    pub fn invalidate(&self, provider: ProviderKind) {
        if self.entries.remove(&provider).is_some() {
            tracing::info!(provider = %provider, "Provider credentials invalidated");
        }
    }

    /// How many times the source has been read.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}
