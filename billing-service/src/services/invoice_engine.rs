//! Monthly estimate, invoice creation and charge attempts.

use crate::config::BillingSettings;
use crate::error::BillingError;
use crate::models::{BillingPeriod, Estimate, Invoice, InvoiceStatus, PaymentMetadata};
use crate::providers::{ChargeRequest, ChargeResult, PaymentProvider};
use crate::services::cost::CostReporter;
use crate::services::metrics;
use crate::store::{BillingStore, StoreError};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

#[derive(Clone)]
pub struct InvoiceEngine {
    store: Arc<dyn BillingStore>,
    costs: Arc<dyn CostReporter>,
    charger: Arc<dyn PaymentProvider>,
    settings: BillingSettings,
}

impl InvoiceEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        costs: Arc<dyn CostReporter>,
        charger: Arc<dyn PaymentProvider>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            costs,
            charger,
            settings,
        }
    }

    pub fn settings(&self) -> &BillingSettings {
        &self.settings
    }

    pub async fn estimate_current_period(&self, tenant_id: &str, now: DateTime<Utc>) -> Estimate {
        self.estimate_period(tenant_id, BillingPeriod::containing(now)).await
    }

    /// Base fee plus metered usage. A cost lookup failure degrades to the base fee alone.
    pub async fn estimate_period(&self, tenant_id: &str, period: BillingPeriod) -> Estimate {
        match self.costs.usage_cost(tenant_id, &period).await {
            Ok(usage) => Estimate::new(self.settings.base_fee, usage, period),
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    period = %period.key(),
                    error = %e,
                    "Usage cost unavailable, estimating base fee only"
                );
                Estimate::base_only(
                    self.settings.base_fee,
                    period,
                    format!("Nutzungskosten konnten nicht geladen werden: {}", e),
                )
            }
        }
    }

    /// Open an invoice for the estimate's period, or return the one already holding it.
    pub async fn create_invoice(
        &self,
        tenant_id: &str,
        estimate: &Estimate,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let lock = Invoice::period_lock_for(tenant_id, &estimate.period);
        if let Some(existing) = self.store.find_invoice_by_period_lock(&lock).await? {
            tracing::debug!(tenant_id = %tenant_id, invoice_id = %existing.invoice_id, "Invoice exists for period");
            return Ok(existing);
        }

        let invoice = Invoice::open(tenant_id, estimate, &self.settings.currency, now);
        match self.store.insert_invoice(&invoice).await {
            Ok(()) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.invoice_id,
                    invoice_number = %invoice.invoice_number,
                    amount = %invoice.amount,
                    "Invoice created"
                );
                Ok(invoice)
            }
            // Lost the race for the period lock; the winner's invoice is the one.
            Err(StoreError::Duplicate(_)) => self
                .store
                .find_invoice_by_period_lock(&lock)
                .await?
                .ok_or_else(|| BillingError::ConditionalUpdateFailure(lock)),
            Err(e) => Err(e.into()),
        }
    }

    /// The invoice for the running month, created from a fresh estimate when missing.
    pub async fn current_period_invoice(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<Invoice, BillingError> {
        let lock = Invoice::period_lock_for(tenant_id, &BillingPeriod::containing(now));
        if let Some(existing) = self.store.find_invoice_by_period_lock(&lock).await? {
            return Ok(existing);
        }
        let estimate = self.estimate_current_period(tenant_id, now).await;
        self.create_invoice(tenant_id, &estimate, now).await
    }

    /// Create a recurring charge against the tenant's mandate. The invoice stays open
    /// until the provider confirms the payment.
    pub async fn charge_invoice(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<(Invoice, ChargeResult), BillingError> {
        let account = self
            .store
            .get_account(&invoice.tenant_id)
            .await?
            .filter(|account| account.has_active_mandate())
            .ok_or_else(|| BillingError::MandateMissing(invoice.tenant_id.clone()))?;

        if invoice.status != InvoiceStatus::Open {
            return Err(BillingError::Validation(format!(
                "Rechnung {} ist nicht offen ({})",
                invoice.invoice_number,
                invoice.status.as_str()
            )));
        }

        let request = ChargeRequest {
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            idempotency_key: invoice.invoice_id.clone(),
            description: format!(
                "{} {} - Grundgebühr + Nutzung",
                self.settings.brand_name,
                invoice.period.key()
            ),
            metadata: PaymentMetadata::monthly_billing(&invoice.tenant_id, &invoice.invoice_id),
            customer_id: account.provider_customer_ids.mollie.clone(),
            mandate_id: account.mandate_id.clone(),
            redirect_url: None,
            webhook_url: Some(self.settings.public_url("/billing/mollie/webhook")),
        };

        let result = self.charger.create_charge(&request).await.inspect_err(|e| {
            metrics::record_provider_error(self.charger.kind().as_str(), error_kind(e));
        })?;

        tracing::info!(
            tenant_id = %invoice.tenant_id,
            invoice_id = %invoice.invoice_id,
            payment_id = %result.external_id,
            amount = %invoice.amount,
            "Recurring charge created"
        );
        metrics::record_charge_created(
            self.charger.kind().as_str(),
            request.metadata.purpose.as_str(),
            &invoice.currency,
            invoice.amount.to_f64().unwrap_or_default(),
        );

        let mut updated = invoice.clone();
        updated.record_charge(self.charger.kind(), &result.external_id, now);
        if !self.store.update_invoice_if(&updated, &[InvoiceStatus::Open]).await? {
            // The webhook already settled it; the stored state wins.
            tracing::info!(invoice_id = %invoice.invoice_id, "Invoice changed while charging");
            let stored = self
                .store
                .get_invoice(&invoice.invoice_id)
                .await?
                .unwrap_or(updated);
            return Ok((stored, result));
        }
        Ok((updated, result))
    }

    /// Manual charge: charges the given invoice or the running month's invoice. An explicit
    /// amount must match the invoice.
    pub async fn charge_tenant(
        &self,
        tenant_id: &str,
        amount: Option<Decimal>,
        invoice_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Invoice, ChargeResult), BillingError> {
        let invoice = match invoice_id {
            Some(id) => self.get_invoice(tenant_id, id).await?,
            None => self.current_period_invoice(tenant_id, now).await?,
        };

        if let Some(amount) = amount {
            if crate::models::round_money(amount) != invoice.amount {
                return Err(BillingError::Validation(format!(
                    "Betrag {} stimmt nicht mit Rechnung {} ({}) überein",
                    amount, invoice.invoice_number, invoice.amount
                )));
            }
        }

        self.charge_invoice(&invoice, now).await
    }

    /// Look up by invoice id (`inv_…`) or invoice number, scoped to the tenant.
    pub async fn get_invoice(&self, tenant_id: &str, id_or_number: &str) -> Result<Invoice, BillingError> {
        let found = if id_or_number.starts_with("inv_") {
            self.store.get_invoice(id_or_number).await?
        } else {
            self.store.find_invoice_by_number(tenant_id, id_or_number).await?
        };
        found
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("Rechnung {} nicht gefunden", id_or_number)))
    }

    pub async fn list_invoices(&self, tenant_id: &str) -> Result<Vec<Invoice>, BillingError> {
        Ok(self.store.list_invoices(tenant_id).await?)
    }
}

pub(crate) fn error_kind(err: &crate::providers::ProviderError) -> &'static str {
    use crate::providers::ProviderError;
    match err {
        ProviderError::Unavailable(_) => "unavailable",
        ProviderError::AuthenticationFailed(_) => "authentication",
        ProviderError::Rejected { .. } => "rejected",
        ProviderError::NotFound(_) => "not_found",
        ProviderError::NotConfigured(_) => "not_configured",
        ProviderError::Unsupported(_) => "unsupported",
        ProviderError::Decode(_) => "decode",
    }
}
