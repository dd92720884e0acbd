//! Configuration module for billing-service.
//!
//! Provider credentials are optional at startup. An operation that needs a missing
//! credential fails with a configuration error instead.

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub billing: BillingSettings,
    pub mollie: MollieConfig,
    pub mollie_connect: MollieConnectConfig,
    pub stripe: StripeConfig,
    pub paypal: PaypalConfig,
    pub smtp: SmtpConfig,
    pub storage: BlobStorageConfig,
    pub cost_reporting: CostReportingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub base_fee: Decimal,
    pub currency: String,
    pub vat_rate: Decimal,
    /// Amount of the first payment that establishes a mandate.
    pub verification_amount: Decimal,
    /// Public base url of this service, used for webhook urls.
    pub api_base_url: String,
    pub brand_name: String,
    /// Post-checkout landing page; `{tenantId}` is substituted.
    pub tenant_redirect_template: String,
    pub estimate_cache_ttl_secs: u64,
    pub provider_max_retries: u32,
}

impl BillingSettings {
    pub fn tenant_redirect_url(&self, tenant_id: &str) -> String {
        self.tenant_redirect_template.replace("{tenantId}", tenant_id)
    }

    /// Absolute url of one of this service's own routes, e.g. a webhook.
    pub fn public_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone)]
pub struct MollieConfig {
    pub api_key: Secret<String>,
    pub api_base_url: String,
}

#[derive(Debug, Clone)]
pub struct MollieConnectConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    pub state_secret: Secret<String>,
    pub state_max_age_secs: i64,
}

impl MollieConnectConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
            && !self.client_secret.expose_secret().is_empty()
            && !self.state_secret.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    pub webhook_tolerance_secs: i64,
    /// Recurring price for the platform subscription.
    pub price_id: Option<String>,
}

impl StripeConfig {
    pub fn is_configured(&self) -> bool {
        !self.secret_key.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub api_base_url: String,
    pub return_url: String,
    pub cancel_url: String,
}

impl PaypalConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Clone)]
pub struct BlobStorageConfig {
    pub root_dir: String,
    /// Base url that download links are issued under.
    pub public_base_url: String,
    pub signing_secret: Secret<String>,
    pub url_expiry_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CostReportingConfig {
    pub url: Option<String>,
}

fn var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    var(lookup, key).unwrap_or_else(|| default.to_string())
}

fn secret(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Secret<String> {
    Secret::new(var(lookup, key).unwrap_or_default())
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match var(lookup, key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process environment.
    pub fn from_lookup(
        common: core_config::Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AppError> {
        let lookup = &lookup;
        let api_base_url = string_or(lookup, "API_BASE_URL", "http://localhost:8080")
            .trim_end_matches('/')
            .to_string();
        let mollie_api = string_or(lookup, "MOLLIE_API_BASE_URL", "https://api.mollie.com/v2");

        let log_level = var(lookup, "LOG_LEVEL").unwrap_or_else(|| common.log_level.clone());
        let otlp_endpoint = var(lookup, "OTLP_ENDPOINT").or_else(|| common.otlp_endpoint.clone());

        Ok(Self {
            service_name: string_or(lookup, "SERVICE_NAME", "billing-service"),
            log_level,
            otlp_endpoint,
            database: DatabaseConfig {
                url: Secret::new(string_or(lookup, "DATABASE_URL", "mongodb://localhost:27017")),
                db_name: string_or(lookup, "DATABASE_NAME", "billing"),
            },
            billing: BillingSettings {
                base_fee: parse_or(lookup, "BILLING_BASE_FEE", Decimal::from(30))?,
                currency: string_or(lookup, "BILLING_CURRENCY", "EUR"),
                vat_rate: parse_or(lookup, "BILLING_VAT_RATE", Decimal::new(77, 1))?,
                verification_amount: parse_or(
                    lookup,
                    "MANDATE_VERIFICATION_AMOUNT",
                    Decimal::new(1, 2),
                )?,
                api_base_url: api_base_url.clone(),
                brand_name: string_or(lookup, "BILLING_BRAND_NAME", "Viral Tenant"),
                tenant_redirect_template: string_or(
                    lookup,
                    "TENANT_REDIRECT_TEMPLATE",
                    "https://{tenantId}.viraltenant.com/tenant",
                ),
                estimate_cache_ttl_secs: parse_or(lookup, "ESTIMATE_CACHE_TTL_SECS", 6 * 3600)?,
                provider_max_retries: parse_or(lookup, "PROVIDER_MAX_RETRIES", 2)?,
            },
            mollie: MollieConfig {
                api_key: secret(lookup, "MOLLIE_API_KEY"),
                api_base_url: mollie_api.clone(),
            },
            mollie_connect: MollieConnectConfig {
                client_id: string_or(lookup, "MOLLIE_CONNECT_CLIENT_ID", ""),
                client_secret: secret(lookup, "MOLLIE_CONNECT_CLIENT_SECRET"),
                redirect_uri: string_or(
                    lookup,
                    "MOLLIE_CONNECT_REDIRECT_URI",
                    &format!("{}/billing/mollie/connect/callback", api_base_url),
                ),
                authorize_url: string_or(
                    lookup,
                    "MOLLIE_CONNECT_AUTHORIZE_URL",
                    "https://my.mollie.com/oauth2/authorize",
                ),
                token_url: string_or(
                    lookup,
                    "MOLLIE_CONNECT_TOKEN_URL",
                    "https://api.mollie.com/oauth2/tokens",
                ),
                api_base_url: string_or(lookup, "MOLLIE_CONNECT_API_BASE_URL", &mollie_api),
                state_secret: secret(lookup, "MOLLIE_CONNECT_STATE_SECRET"),
                state_max_age_secs: parse_or(lookup, "MOLLIE_CONNECT_STATE_MAX_AGE_SECS", 3600)?,
            },
            stripe: StripeConfig {
                secret_key: secret(lookup, "STRIPE_SECRET_KEY"),
                webhook_secret: secret(lookup, "STRIPE_WEBHOOK_SECRET"),
                api_base_url: string_or(lookup, "STRIPE_API_BASE_URL", "https://api.stripe.com"),
                webhook_tolerance_secs: parse_or(lookup, "STRIPE_WEBHOOK_TOLERANCE_SECS", 300)?,
                price_id: var(lookup, "STRIPE_PRICE_ID"),
            },
            paypal: PaypalConfig {
                client_id: string_or(lookup, "PAYPAL_CLIENT_ID", ""),
                client_secret: secret(lookup, "PAYPAL_CLIENT_SECRET"),
                api_base_url: string_or(
                    lookup,
                    "PAYPAL_API_BASE_URL",
                    "https://api-m.sandbox.paypal.com",
                ),
                return_url: string_or(
                    lookup,
                    "PAYPAL_RETURN_URL",
                    "https://viraltenant.com/billing/paypal/return",
                ),
                cancel_url: string_or(
                    lookup,
                    "PAYPAL_CANCEL_URL",
                    "https://viraltenant.com/billing/paypal/cancel",
                ),
            },
            smtp: SmtpConfig {
                enabled: parse_or(lookup, "SMTP_ENABLED", false)?,
                host: string_or(lookup, "SMTP_HOST", "localhost"),
                port: parse_or(lookup, "SMTP_PORT", 587)?,
                user: string_or(lookup, "SMTP_USER", ""),
                password: secret(lookup, "SMTP_PASSWORD"),
                from_email: string_or(lookup, "SMTP_FROM_EMAIL", "billing@viraltenant.com"),
                from_name: string_or(lookup, "SMTP_FROM_NAME", "Viral Tenant Billing"),
            },
            storage: BlobStorageConfig {
                root_dir: string_or(lookup, "BLOB_ROOT_DIR", "./data/blobs"),
                public_base_url: string_or(lookup, "BLOB_PUBLIC_BASE_URL", &api_base_url),
                signing_secret: secret(lookup, "BLOB_SIGNING_SECRET"),
                url_expiry_secs: parse_or(lookup, "BLOB_URL_EXPIRY_SECS", 3600)?,
            },
            cost_reporting: CostReportingConfig {
                url: var(lookup, "COST_REPORTING_URL"),
            },
            common,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BillingConfig::from_lookup(core_config::Config::default(), lookup(&[])).unwrap();

        assert_eq!(config.billing.base_fee, Decimal::from(30));
        assert_eq!(config.billing.vat_rate.to_string(), "7.7");
        assert_eq!(config.billing.verification_amount.to_string(), "0.01");
        assert_eq!(config.billing.estimate_cache_ttl_secs, 21600);
        assert_eq!(config.mollie.api_base_url, "https://api.mollie.com/v2");
        assert_eq!(config.mollie_connect.state_max_age_secs, 3600);
        assert_eq!(config.storage.url_expiry_secs, 3600);
        assert!(config.mollie.api_key.expose_secret().is_empty());
        assert!(!config.mollie_connect.is_configured());
        assert!(!config.stripe.is_configured());
        assert!(!config.paypal.is_configured());
        assert!(config.stripe.price_id.is_none());
        assert!(config.cost_reporting.url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = BillingConfig::from_lookup(
            core_config::Config::default(),
            lookup(&[
                ("API_BASE_URL", "https://api.example.com/"),
                ("BILLING_BASE_FEE", "45.50"),
                ("MOLLIE_API_KEY", "test_abc"),
                ("STRIPE_PRICE_ID", "price_base"),
            ]),
        )
        .unwrap();

        assert_eq!(config.billing.api_base_url, "https://api.example.com");
        assert_eq!(config.billing.base_fee.to_string(), "45.50");
        assert_eq!(config.mollie.api_key.expose_secret(), "test_abc");
        assert_eq!(config.stripe.price_id.as_deref(), Some("price_base"));
        assert_eq!(
            config.mollie_connect.redirect_uri,
            "https://api.example.com/billing/mollie/connect/callback"
        );
    }

    #[test]
    fn test_otlp_export_is_opt_in() {
        let config = BillingConfig::from_lookup(core_config::Config::default(), lookup(&[])).unwrap();
        assert!(config.otlp_endpoint.is_none());

        let config = BillingConfig::from_lookup(
            core_config::Config::default(),
            lookup(&[("OTLP_ENDPOINT", "http://collector:4317")]),
        )
        .unwrap();
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = BillingConfig::from_lookup(
            core_config::Config::default(),
            lookup(&[("BILLING_BASE_FEE", "thirty")]),
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_tenant_redirect_url() {
        let config = BillingConfig::from_lookup(core_config::Config::default(), lookup(&[])).unwrap();
        assert_eq!(
            config.billing.tenant_redirect_url("acme"),
            "https://acme.viraltenant.com/tenant"
        );
    }
}
