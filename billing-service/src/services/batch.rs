//! Monthly billing run over every tenant with an active mandate.

use crate::error::BillingError;
use crate::models::{
    BillingReport, InvoicePaymentStatus, TenantBillingAccount, TenantBillingResult, TenantOutcome,
};
use crate::services::invoice_engine::InvoiceEngine;
use crate::services::metrics;
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

#[derive(Clone)]
pub struct MonthlyBatch {
    store: Arc<dyn BillingStore>,
    engine: InvoiceEngine,
}

impl MonthlyBatch {
    pub fn new(store: Arc<dyn BillingStore>, engine: InvoiceEngine) -> Self {
        Self { store, engine }
    }

    /// Tenants are billed one after another; one tenant failing never stops the run.
    pub async fn run_monthly_billing(&self, now: DateTime<Utc>) -> BillingReport {
        let mut report = BillingReport::default();
        let accounts = match self.store.list_accounts_with_active_mandate().await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::error!(error = %e, "Monthly billing could not list tenants");
                return report;
            }
        };
        tracing::info!(tenants = accounts.len(), "Monthly billing started");

        for account in accounts {
            let result = match self.bill_tenant(&account, now).await {
                Ok(result) => result,
                Err((invoice_id, e)) => {
                    tracing::warn!(
                        tenant_id = %account.tenant_id,
                        invoice_id = invoice_id.as_deref().unwrap_or("-"),
                        error = %e,
                        kind = e.kind(),
                        "Monthly billing failed for tenant"
                    );
                    TenantBillingResult::failed(&account.tenant_id, invoice_id, e.to_string())
                }
            };
            metrics::record_batch_tenant(match result.outcome {
                TenantOutcome::Success => "success",
                TenantOutcome::Failed => "failed",
                TenantOutcome::Skipped => "skipped",
            });
            report.record(result);
        }

        tracing::info!(
            processed = report.processed,
            success = report.success,
            failed = report.failed,
            skipped = report.skipped,
            "Monthly billing finished"
        );
        report
    }

    async fn bill_tenant(
        &self,
        account: &TenantBillingAccount,
        now: DateTime<Utc>,
    ) -> Result<TenantBillingResult, (Option<String>, BillingError)> {
        let tenant_id = account.tenant_id.as_str();
        let estimate = self.engine.estimate_current_period(tenant_id, now).await;
        if estimate.estimated_total <= Decimal::ZERO {
            return Ok(TenantBillingResult::skipped(tenant_id, "nothing to bill"));
        }

        let invoice = self
            .engine
            .create_invoice(tenant_id, &estimate, now)
            .await
            .map_err(|e| (None, e))?;
        if invoice.is_paid() {
            return Ok(TenantBillingResult::skipped(tenant_id, "already paid"));
        }
        if invoice.payment_status == Some(InvoicePaymentStatus::Pending) && invoice.provider_payment_id.is_some() {
            return Ok(TenantBillingResult::skipped(tenant_id, "charge already pending"));
        }

        let (charged, result) = self
            .engine
            .charge_invoice(&invoice, now)
            .await
            .map_err(|e| (Some(invoice.invoice_id.clone()), e))?;
        Ok(TenantBillingResult::charged(
            tenant_id,
            &charged.invoice_id,
            &result.external_id,
            charged.amount,
        ))
    }
}
