//! SEPA mandate lifecycle on the platform Mollie account.

use crate::config::BillingSettings;
use crate::error::BillingError;
use crate::models::{CustomerProvider, PaymentMetadata, TenantBillingAccount, TenantProfile};
use crate::providers::mollie::{MollieAmount, MollieMandate, NewPayment};
use crate::providers::MollieClient;
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Most recent payments returned by the history endpoint.
const PAYMENT_HISTORY_LIMIT: u32 = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstPaymentOutcome {
    pub payment_id: Option<String>,
    pub checkout_url: Option<String>,
    pub status: String,
    /// Set when a valid mandate already existed and was adopted instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MandateSummary {
    pub id: String,
    pub method: Option<String>,
    pub status: String,
    pub created_at: Option<String>,
}

impl From<&MollieMandate> for MandateSummary {
    fn from(mandate: &MollieMandate) -> Self {
        Self {
            id: mandate.id.clone(),
            method: mandate.method.clone(),
            status: mandate.status.clone(),
            created_at: mandate.created_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerStatus {
    pub has_customer: bool,
    pub has_mandate: bool,
    pub customer_id: Option<String>,
    pub mandate_status: String,
    pub subscription_status: String,
    pub mandate: Option<MandateSummary>,
}

#[derive(Clone)]
pub struct MandateService {
    store: Arc<dyn BillingStore>,
    mollie: MollieClient,
    settings: BillingSettings,
}

impl MandateService {
    pub fn new(store: Arc<dyn BillingStore>, mollie: MollieClient, settings: BillingSettings) -> Self {
        Self {
            store,
            mollie,
            settings,
        }
    }

    /// Reuse the stored Mollie customer or create one from the tenant profile.
    pub async fn ensure_customer(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<String, BillingError> {
        if self.store.create_account_if_absent(&TenantBillingAccount::new(tenant_id, now)).await? {
            tracing::debug!(tenant_id = %tenant_id, "Billing account created");
        }
        let account = self.store.get_account(tenant_id).await?;
        if let Some(customer_id) = account.and_then(|a| a.provider_customer_ids.mollie) {
            return Ok(customer_id);
        }

        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await?
            .unwrap_or_else(|| TenantProfile::new(tenant_id));
        let email = tenant
            .customer_email()
            .ok_or_else(|| BillingError::Validation(format!("Tenant {} hat keine E-Mail-Adresse", tenant_id)))?
            .to_string();

        let customer = self
            .mollie
            .create_customer(&tenant.display_name(), &email, &PaymentMetadata::mandate_setup(tenant_id))
            .await?;

        self.store
            .set_account_customer_id(tenant_id, CustomerProvider::Mollie, &customer.id, now)
            .await?;
        tracing::info!(tenant_id = %tenant_id, customer_id = %customer.id, "Mollie customer linked");
        Ok(customer.id)
    }

    /// Start a mandate setup with a verification payment. A mandate Mollie already reports
    /// as valid is adopted instead, so repeated calls never race for a second mandate. When
    /// Mollie lists none, a mandate still marked active locally is stale and is reset.
    pub async fn create_first_payment(
        &self,
        tenant_id: &str,
        redirect_url: Option<&str>,
        amount: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<FirstPaymentOutcome, BillingError> {
        let customer_id = self.ensure_customer(tenant_id, now).await?;

        let mandates = self.mollie.list_mandates(&customer_id).await?;
        if let Some(valid) = mandates.iter().find(|m| m.is_valid()) {
            if self.store.adopt_account_mandate(tenant_id, &valid.id, now).await? {
                tracing::info!(tenant_id = %tenant_id, mandate_id = %valid.id, "Existing mandate adopted");
                return Ok(FirstPaymentOutcome {
                    payment_id: None,
                    checkout_url: None,
                    status: "valid".to_string(),
                    mandate_id: Some(valid.id.clone()),
                });
            }
            tracing::warn!(
                tenant_id = %tenant_id,
                mandate_id = %valid.id,
                "Account was revoked, starting a new mandate setup instead of adopting"
            );
        }

        let amount = amount.unwrap_or(self.settings.verification_amount);
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation("Betrag muss größer als 0 sein".to_string()));
        }
        let redirect = redirect_url
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.tenant_redirect_url(tenant_id));

        let payment = self
            .mollie
            .create_payment(&NewPayment {
                amount: MollieAmount::new(&self.settings.currency, amount),
                description: format!(
                    "{} - Zahlungsmethode einrichten ({})",
                    self.settings.brand_name, tenant_id
                ),
                metadata: PaymentMetadata::mandate_setup(tenant_id),
                customer_id: Some(customer_id),
                mandate_id: None,
                redirect_url: Some(with_tenant_param(&redirect, tenant_id)),
                webhook_url: Some(self.settings.public_url("/billing/mollie/webhook")),
                profile_id: None,
                idempotency_key: None,
            })
            .await?;

        self.store
            .begin_account_mandate_setup(tenant_id, &payment.id, now)
            .await?;
        tracing::info!(tenant_id = %tenant_id, payment_id = %payment.id, "Mandate verification payment created");

        Ok(FirstPaymentOutcome {
            checkout_url: payment.checkout_url(),
            payment_id: Some(payment.id),
            status: payment.status,
            mandate_id: None,
        })
    }

    /// Withdraw every valid mandate at Mollie, then revoke locally in one write.
    pub async fn revoke(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<TenantBillingAccount, BillingError> {
        let not_found = || BillingError::NotFound(format!("Kein Abrechnungskonto für {}", tenant_id));
        let account = self.store.get_account(tenant_id).await?.ok_or_else(not_found)?;

        if let Some(customer_id) = account.provider_customer_ids.mollie {
            for mandate in self.mollie.list_mandates(&customer_id).await? {
                if mandate.is_valid() {
                    self.mollie.revoke_mandate(&customer_id, &mandate.id).await?;
                }
            }
        }

        let revoked = self.store.revoke_account(tenant_id, now).await?.ok_or_else(not_found)?;
        tracing::info!(tenant_id = %tenant_id, "Mandate revoked, subscription cancelled");
        Ok(revoked)
    }

    pub async fn customer_status(&self, tenant_id: &str) -> Result<CustomerStatus, BillingError> {
        let account = self.store.get_account(tenant_id).await?;
        let Some(account) = account else {
            return Ok(CustomerStatus {
                has_customer: false,
                has_mandate: false,
                customer_id: None,
                mandate_status: "none".to_string(),
                subscription_status: "inactive".to_string(),
                mandate: None,
            });
        };

        let customer_id = account.provider_customer_ids.mollie.clone();
        let mandate = match &customer_id {
            Some(id) => self
                .mollie
                .list_mandates(id)
                .await?
                .iter()
                .find(|m| m.is_valid())
                .map(MandateSummary::from),
            None => None,
        };

        Ok(CustomerStatus {
            has_customer: customer_id.is_some(),
            has_mandate: mandate.is_some(),
            customer_id,
            mandate_status: account.mandate_status.as_str().to_string(),
            subscription_status: account.subscription_status.as_str().to_string(),
            mandate,
        })
    }

    pub async fn payment_history(&self, tenant_id: &str) -> Result<Vec<Value>, BillingError> {
        let customer_id = self
            .store
            .get_account(tenant_id)
            .await?
            .and_then(|account| account.provider_customer_ids.mollie);
        match customer_id {
            Some(id) => Ok(self.mollie.list_customer_payments(&id, PAYMENT_HISTORY_LIMIT).await?),
            None => Ok(Vec::new()),
        }
    }
}

fn with_tenant_param(url: &str, tenant_id: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    let query = serde_urlencoded::to_string([("tenantId", tenant_id)]).unwrap_or_default();
    format!("{}{}{}", url, separator, query)
}
