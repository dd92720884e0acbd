//! Platform-wide billing views for operators.

use crate::config::BillingSettings;
use crate::error::BillingError;
use crate::models::{BillingPeriod, Invoice, InvoiceStatus, TenantProfile, TenantStatus};
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantBillingRow {
    #[serde(rename = "tenant_id")]
    pub tenant_id: String,
    #[serde(rename = "creator_name")]
    pub creator_name: String,
    #[serde(rename = "creator_email")]
    pub creator_email: Option<String>,
    pub status: &'static str,
    pub current_month_total: Decimal,
    pub open_invoices_count: usize,
    pub open_invoices_amount: Decimal,
    pub paid_invoices_count: usize,
    pub paid_total: Decimal,
    pub total_invoices: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewSummary {
    pub total_tenants: usize,
    pub active_tenants: usize,
    pub total_open_amount: Decimal,
    pub total_paid_amount: Decimal,
    pub total_current_month: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantsOverview {
    pub tenants: Vec<TenantBillingRow>,
    pub summary: OverviewSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub total_invoices: usize,
    pub open_count: usize,
    pub paid_count: usize,
    pub open_amount: Decimal,
    pub paid_amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceListing {
    pub invoices: Vec<Invoice>,
    pub summary: InvoiceSummary,
}

impl InvoiceSummary {
    fn of<'a>(invoices: impl IntoIterator<Item = &'a Invoice>) -> Self {
        let mut summary = Self::default();
        for invoice in invoices {
            summary.total_invoices += 1;
            match invoice.status {
                InvoiceStatus::Open => {
                    summary.open_count += 1;
                    summary.open_amount += invoice.amount;
                }
                InvoiceStatus::Paid => {
                    summary.paid_count += 1;
                    summary.paid_amount += invoice.amount;
                }
                _ => {}
            }
        }
        summary
    }
}

#[derive(Clone)]
pub struct AdminService {
    store: Arc<dyn BillingStore>,
    settings: BillingSettings,
}

impl AdminService {
    pub fn new(store: Arc<dyn BillingStore>, settings: BillingSettings) -> Self {
        Self { store, settings }
    }

    /// Per-tenant invoice totals, largest current month first.
    pub async fn tenants_overview(&self, now: DateTime<Utc>) -> Result<TenantsOverview, BillingError> {
        let tenants = self.store.list_tenants().await?;
        let mut by_tenant: HashMap<String, Vec<Invoice>> = HashMap::new();
        for invoice in self.store.list_all_invoices().await? {
            by_tenant.entry(invoice.tenant_id.clone()).or_default().push(invoice);
        }
        let current = BillingPeriod::containing(now);

        let mut summary = OverviewSummary {
            total_tenants: tenants.len(),
            ..Default::default()
        };
        let mut rows: Vec<TenantBillingRow> = tenants
            .iter()
            .map(|tenant| {
                let invoices = by_tenant.remove(&tenant.tenant_id).unwrap_or_default();
                self.row(tenant, &invoices, &current)
            })
            .collect();

        for (tenant, row) in tenants.iter().zip(&rows) {
            if tenant.status == TenantStatus::Active {
                summary.active_tenants += 1;
            }
            summary.total_open_amount += row.open_invoices_amount;
            summary.total_paid_amount += row.paid_total;
            summary.total_current_month += row.current_month_total;
        }
        rows.sort_by(|a, b| b.current_month_total.cmp(&a.current_month_total));

        Ok(TenantsOverview { tenants: rows, summary })
    }

    fn row(&self, tenant: &TenantProfile, invoices: &[Invoice], current: &BillingPeriod) -> TenantBillingRow {
        let this_month: Vec<&Invoice> = invoices
            .iter()
            .filter(|invoice| invoice.period.key() == current.key())
            .collect();
        // Tenants without an invoice this month owe at least the base fee.
        let current_month_total = if this_month.is_empty() {
            self.settings.base_fee
        } else {
            this_month.iter().map(|invoice| invoice.amount).sum()
        };
        let totals = InvoiceSummary::of(invoices);

        TenantBillingRow {
            tenant_id: tenant.tenant_id.clone(),
            creator_name: tenant.display_name(),
            creator_email: tenant.billing_contact_email().map(str::to_string),
            status: tenant.status.as_str(),
            current_month_total,
            open_invoices_count: totals.open_count,
            open_invoices_amount: totals.open_amount,
            paid_invoices_count: totals.paid_count,
            paid_total: totals.paid_amount,
            total_invoices: totals.total_invoices,
        }
    }

    pub async fn all_invoices(&self) -> Result<InvoiceListing, BillingError> {
        let invoices = self.store.list_all_invoices().await?;
        let summary = InvoiceSummary::of(&invoices);
        Ok(InvoiceListing { invoices, summary })
    }

    pub async fn set_tenant_status(
        &self,
        tenant_id: &str,
        status: TenantStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let updated = self.store.set_tenant_status(tenant_id, status, reason, now).await?;
        if !updated {
            return Err(BillingError::NotFound(format!("Tenant {} nicht gefunden", tenant_id)));
        }
        tracing::info!(tenant_id = %tenant_id, status = status.as_str(), reason = ?reason, "Tenant status changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Estimate, UsageBreakdown};
    use crate::services::test_support::settings;
    use crate::store::InMemoryBillingStore;
    use chrono::TimeZone;

    fn invoice(tenant_id: &str, amount: i64, status: InvoiceStatus, at: DateTime<Utc>) -> Invoice {
        let estimate = Estimate::new(Decimal::from(amount), UsageBreakdown::default(), BillingPeriod::containing(at));
        let mut invoice = Invoice::open(tenant_id, &estimate, "EUR", at);
        invoice.status = status;
        invoice
    }

    async fn seeded() -> (AdminService, Arc<InMemoryBillingStore>, DateTime<Utc>) {
        let store = Arc::new(InMemoryBillingStore::new());
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let last_month = Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap();

        let mut active = TenantProfile::new("acme");
        active.status = TenantStatus::Active;
        active.creator_email = Some("owner@acme.test".to_string());
        store.put_tenant(&active).await.unwrap();
        store.put_tenant(&TenantProfile::new("quiet")).await.unwrap();

        for invoice in [
            invoice("acme", 50, InvoiceStatus::Open, now),
            invoice("acme", 40, InvoiceStatus::Paid, last_month),
        ] {
            store.insert_invoice(&invoice).await.unwrap();
        }
        (AdminService::new(store.clone(), settings()), store, now)
    }

    #[tokio::test]
    async fn test_overview_falls_back_to_base_fee() {
        let (admin, _, now) = seeded().await;
        let overview = admin.tenants_overview(now).await.unwrap();

        assert_eq!(overview.tenants.len(), 2);
        let first = &overview.tenants[0];
        assert_eq!(first.tenant_id, "acme");
        assert_eq!(first.current_month_total, Decimal::from(50));
        assert_eq!(first.open_invoices_count, 1);
        assert_eq!(first.paid_total, Decimal::from(40));
        assert_eq!(first.creator_email.as_deref(), Some("owner@acme.test"));
        assert_eq!(overview.tenants[1].current_month_total, Decimal::from(30));

        assert_eq!(overview.summary.total_tenants, 2);
        assert_eq!(overview.summary.active_tenants, 1);
        assert_eq!(overview.summary.total_current_month, Decimal::from(80));
        assert_eq!(overview.summary.total_open_amount, Decimal::from(50));
    }

    #[tokio::test]
    async fn test_invoice_summary_counts_by_status() {
        let (admin, _, _) = seeded().await;
        let listing = admin.all_invoices().await.unwrap();
        assert_eq!(listing.summary.total_invoices, 2);
        assert_eq!(listing.summary.open_count, 1);
        assert_eq!(listing.summary.paid_amount, Decimal::from(40));
    }

    #[tokio::test]
    async fn test_status_of_unknown_tenant_is_not_found() {
        let (admin, store, now) = seeded().await;
        assert!(matches!(
            admin.set_tenant_status("ghost", TenantStatus::Suspended, None, now).await,
            Err(BillingError::NotFound(_))
        ));
        admin
            .set_tenant_status("acme", TenantStatus::Suspended, Some("Zahlung offen"), now)
            .await
            .unwrap();
        let tenant = store.get_tenant("acme").await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert_eq!(tenant.status_reason.as_deref(), Some("Zahlung offen"));
    }
}
