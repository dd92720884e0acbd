//! In-process store for tests and local development.
//!
//! All tables sit behind one mutex so that every guarded write is atomic, matching the
//! single-document guarantees of the MongoDB store.

use super::{BillingStore, StoreError};
use crate::models::{
    ConnectStatus, CustomerProvider, Invoice, InvoiceStatus, MandateStatus, MemberSubscription,
    MollieConnectAccount, PaymentMethodInfo, RawWebhookEvent, StripeSubscriptionState, TenantBillingAccount,
    TenantProfile, TenantStatus, WebhookOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, TenantBillingAccount>,
    invoices: HashMap<String, Invoice>,
    connect_accounts: HashMap<String, MollieConnectAccount>,
    members: HashMap<String, MemberSubscription>,
    tenants: HashMap<String, TenantProfile>,
    webhook_events: HashMap<String, RawWebhookEvent>,
}

type AccountHook = Box<dyn FnOnce(&mut TenantBillingAccount) + Send>;

#[derive(Default)]
pub struct InMemoryBillingStore {
    tables: Mutex<Tables>,
    account_hook: Mutex<Option<AccountHook>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("in-memory store lock poisoned")))
    }

    /// Every stored invoice, for assertions.
    pub fn all_invoices(&self) -> Vec<Invoice> {
        self.tables()
            .map(|t| t.invoices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_webhook_events(&self) -> Vec<RawWebhookEvent> {
        self.tables()
            .map(|t| t.webhook_events.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Store `account` as is, replacing any existing record.
    pub fn seed_account(&self, account: &TenantBillingAccount) {
        if let Ok(mut tables) = self.tables() {
            tables
                .accounts
                .insert(account.tenant_id.clone(), account.clone());
        }
    }

    /// Run `hook` on the stored account right before the next account update applies, as a
    /// concurrent writer would.
    pub fn before_next_account_write(&self, hook: impl FnOnce(&mut TenantBillingAccount) + Send + 'static) {
        if let Ok(mut slot) = self.account_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Apply `update` to the stored account under the lock. `None` when there is no account.
    fn update_account<R>(
        &self,
        tenant_id: &str,
        update: impl FnOnce(&mut TenantBillingAccount) -> R,
    ) -> Result<Option<R>, StoreError> {
        let hook = self.account_hook.lock().ok().and_then(|mut slot| slot.take());
        let mut tables = self.tables()?;
        let Some(account) = tables.accounts.get_mut(tenant_id) else {
            return Ok(None);
        };
        if let Some(hook) = hook {
            hook(account);
        }
        Ok(Some(update(account)))
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.tables().map(|_| ())
    }

    async fn get_account(&self, tenant_id: &str) -> Result<Option<TenantBillingAccount>, StoreError> {
        Ok(self.tables()?.accounts.get(tenant_id).cloned())
    }

    async fn create_account_if_absent(&self, account: &TenantBillingAccount) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        if tables.accounts.contains_key(&account.tenant_id) {
            return Ok(false);
        }
        tables
            .accounts
            .insert(account.tenant_id.clone(), account.clone());
        Ok(true)
    }

    async fn set_account_customer_id(
        &self,
        tenant_id: &str,
        provider: CustomerProvider,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_account(tenant_id, |account| {
            account.provider_customer_ids.set(provider, customer_id);
            account.updated_at = now;
        })?;
        Ok(())
    }

    async fn set_account_payment_method(
        &self,
        tenant_id: &str,
        payment_method: &PaymentMethodInfo,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_account(tenant_id, |account| {
            account.payment_method = Some(payment_method.clone());
            account.updated_at = now;
        })?;
        Ok(())
    }

    async fn clear_account_payment_method(
        &self,
        tenant_id: &str,
        payment_method_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let cleared = self.update_account(tenant_id, |account| {
            account.clear_payment_method(payment_method_id, now)
        })?;
        Ok(cleared.unwrap_or(false))
    }

    async fn set_account_stripe_subscription(
        &self,
        tenant_id: &str,
        subscription: &StripeSubscriptionState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_account(tenant_id, |account| {
            account.stripe_subscription = Some(subscription.clone());
            account.updated_at = now;
        })?;
        Ok(())
    }

    async fn adopt_account_mandate(
        &self,
        tenant_id: &str,
        mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let adopted = self.update_account(tenant_id, |account| {
            if account.mandate_status == MandateStatus::Revoked {
                return false;
            }
            account.adopt_mandate(mandate_id, now);
            true
        })?;
        Ok(adopted.unwrap_or(false))
    }

    async fn begin_account_mandate_setup(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_account(tenant_id, |account| account.begin_mandate_setup(setup_payment_id, now))?;
        Ok(())
    }

    async fn activate_account_mandate(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let activated = self.update_account(tenant_id, |account| {
            if !setup_pending(account, setup_payment_id) {
                return false;
            }
            account.activate_mandate(mandate_id, now);
            true
        })?;
        Ok(activated.unwrap_or(false))
    }

    async fn fail_account_mandate_setup(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let failed = self.update_account(tenant_id, |account| {
            if !setup_pending(account, setup_payment_id) {
                return false;
            }
            account.mandate_setup_failed(now);
            true
        })?;
        Ok(failed.unwrap_or(false))
    }

    async fn record_account_payment(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update_account(tenant_id, |account| account.record_payment(now))?;
        Ok(())
    }

    async fn record_account_payment_failure(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update_account(tenant_id, |account| account.record_payment_failure(now))?;
        Ok(())
    }

    async fn revoke_account(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TenantBillingAccount>, StoreError> {
        self.update_account(tenant_id, |account| {
            account.revoke(now);
            account.clone()
        })
    }

    async fn list_accounts_with_active_mandate(&self) -> Result<Vec<TenantBillingAccount>, StoreError> {
        let mut accounts: Vec<_> = self
            .tables()?
            .accounts
            .values()
            .filter(|a| a.mandate_status == MandateStatus::Active)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(accounts)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if let Some(lock) = &invoice.period_lock {
            let taken = tables
                .invoices
                .values()
                .any(|existing| existing.period_lock.as_ref() == Some(lock));
            if taken {
                return Err(StoreError::Duplicate(lock.clone()));
            }
        }
        if tables.invoices.contains_key(&invoice.invoice_id) {
            return Err(StoreError::Duplicate(invoice.invoice_id.clone()));
        }
        tables
            .invoices
            .insert(invoice.invoice_id.clone(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self.tables()?.invoices.get(invoice_id).cloned())
    }

    async fn find_invoice_by_number(
        &self,
        tenant_id: &str,
        invoice_number: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .tables()?
            .invoices
            .values()
            .find(|i| i.tenant_id == tenant_id && i.invoice_number == invoice_number)
            .cloned())
    }

    async fn find_invoice_by_period_lock(&self, period_lock: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .tables()?
            .invoices
            .values()
            .find(|i| i.period_lock.as_deref() == Some(period_lock))
            .cloned())
    }

    async fn find_invoice_by_payment_id(&self, provider_payment_id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .tables()?
            .invoices
            .values()
            .find(|i| i.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn list_invoices(&self, tenant_id: &str) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices: Vec<_> = self
            .tables()?
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn list_all_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices: Vec<_> = self.tables()?.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn update_invoice_if(
        &self,
        invoice: &Invoice,
        expected: &[InvoiceStatus],
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let Some(current) = tables.invoices.get_mut(&invoice.invoice_id) else {
            return Ok(false);
        };
        if !expected.contains(&current.status) {
            return Ok(false);
        }
        current.status = invoice.status;
        current.payment_method = invoice.payment_method;
        current.provider_payment_id = invoice.provider_payment_id.clone();
        current.payment_status = invoice.payment_status;
        current.payment_error = invoice.payment_error.clone();
        current.payment_details = invoice.payment_details.clone();
        current.period_lock = invoice.period_lock.clone();
        current.paid_at = invoice.paid_at;
        current.updated_at = invoice.updated_at;
        Ok(true)
    }

    async fn set_invoice_pdf_key(&self, invoice_id: &str, pdf_key: &str) -> Result<(), StoreError> {
        if let Some(invoice) = self.tables()?.invoices.get_mut(invoice_id) {
            invoice.pdf_key = Some(pdf_key.to_string());
        }
        Ok(())
    }

    async fn get_connect_account(&self, tenant_id: &str) -> Result<Option<MollieConnectAccount>, StoreError> {
        Ok(self.tables()?.connect_accounts.get(tenant_id).cloned())
    }

    async fn put_connect_account(&self, account: &MollieConnectAccount) -> Result<(), StoreError> {
        self.tables()?
            .connect_accounts
            .insert(account.tenant_id.clone(), account.clone());
        Ok(())
    }

    async fn list_connected_accounts(&self) -> Result<Vec<MollieConnectAccount>, StoreError> {
        Ok(self
            .tables()?
            .connect_accounts
            .values()
            .filter(|a| a.status == ConnectStatus::Connected)
            .cloned()
            .collect())
    }

    async fn get_member(&self, tenant_id: &str, member_id: &str) -> Result<Option<MemberSubscription>, StoreError> {
        Ok(self
            .tables()?
            .members
            .get(&MemberSubscription::key(tenant_id, member_id))
            .cloned())
    }

    async fn put_member(&self, member: &MemberSubscription) -> Result<(), StoreError> {
        self.tables()?.members.insert(member.id.clone(), member.clone());
        Ok(())
    }

    async fn list_members(&self, tenant_id: &str) -> Result<Vec<MemberSubscription>, StoreError> {
        let mut members: Vec<_> = self
            .tables()?
            .members
            .values()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(members)
    }

    async fn find_member_by_mandate_payment(&self, payment_id: &str) -> Result<Option<MemberSubscription>, StoreError> {
        Ok(self
            .tables()?
            .members
            .values()
            .find(|m| m.is_mandate_payment(payment_id))
            .cloned())
    }

    async fn find_member_by_customer(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> Result<Option<MemberSubscription>, StoreError> {
        Ok(self
            .tables()?
            .members
            .values()
            .find(|m| m.tenant_id == tenant_id && m.customer_id == customer_id)
            .cloned())
    }

    async fn replace_member_if_payment_new(
        &self,
        member: &MemberSubscription,
        payment_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let fresh = tables
            .members
            .get(&member.id)
            .is_some_and(|current| !current.has_applied(payment_id));
        if fresh {
            tables.members.insert(member.id.clone(), member.clone());
        }
        Ok(fresh)
    }

    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantProfile>, StoreError> {
        Ok(self.tables()?.tenants.get(tenant_id).cloned())
    }

    async fn put_tenant(&self, tenant: &TenantProfile) -> Result<(), StoreError> {
        self.tables()?
            .tenants
            .insert(tenant.tenant_id.clone(), tenant.clone());
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantProfile>, StoreError> {
        let mut tenants: Vec<_> = self.tables()?.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(tenants)
    }

    async fn set_tenant_status(
        &self,
        tenant_id: &str,
        status: TenantStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let Some(tenant) = tables.tenants.get_mut(tenant_id) else {
            return Ok(false);
        };
        tenant.status = status;
        tenant.status_reason = reason.map(str::to_string);
        tenant.status_updated_at = Some(now);
        Ok(true)
    }

    async fn activate_tenant_if_inactive(&self, tenant_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        match tables.tenants.get_mut(tenant_id) {
            Some(tenant) if tenant.status != TenantStatus::Active => {
                tenant.status = TenantStatus::Active;
                tenant.billing_active = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_webhook_event(&self, event: &RawWebhookEvent) -> Result<(), StoreError> {
        self.tables()?
            .webhook_events
            .insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    async fn set_webhook_outcome(
        &self,
        event_id: &str,
        payment_id: Option<&str>,
        outcome: &WebhookOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(event) = self.tables()?.webhook_events.get_mut(event_id) {
            if let Some(payment_id) = payment_id {
                event.payment_id = Some(payment_id.to_string());
            }
            event.outcome = Some(outcome.clone());
            event.processed_at = Some(processed_at);
        }
        Ok(())
    }

    async fn get_webhook_event(&self, event_id: &str) -> Result<Option<RawWebhookEvent>, StoreError> {
        Ok(self.tables()?.webhook_events.get(event_id).cloned())
    }
}

fn setup_pending(account: &TenantBillingAccount, setup_payment_id: &str) -> bool {
    account.mandate_status == MandateStatus::Pending
        && account.setup_payment_id.as_deref() == Some(setup_payment_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingPeriod, Estimate, UsageBreakdown};
    use rust_decimal::Decimal;

    fn invoice(tenant_id: &str) -> Invoice {
        let estimate = Estimate::new(
            Decimal::from(30),
            UsageBreakdown::new(),
            BillingPeriod::containing(Utc::now()),
        );
        Invoice::open(tenant_id, &estimate, "EUR", Utc::now())
    }

    #[tokio::test]
    async fn test_period_lock_is_unique() {
        let store = InMemoryBillingStore::new();
        store.insert_invoice(&invoice("t1")).await.unwrap();

        let err = store.insert_invoice(&invoice("t1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        store.insert_invoice(&invoice("t2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_void_invoice_releases_period() {
        let store = InMemoryBillingStore::new();
        let mut first = invoice("t1");
        store.insert_invoice(&first).await.unwrap();

        first.void(Utc::now()).unwrap();
        assert!(store
            .update_invoice_if(&first, &[InvoiceStatus::Open])
            .await
            .unwrap());

        store.insert_invoice(&invoice("t1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_invoice_guard() {
        let store = InMemoryBillingStore::new();
        let mut inv = invoice("t1");
        store.insert_invoice(&inv).await.unwrap();

        inv.status = InvoiceStatus::Paid;
        assert!(store
            .update_invoice_if(&inv, &InvoiceStatus::payable())
            .await
            .unwrap());
        assert!(!store
            .update_invoice_if(&inv, &InvoiceStatus::payable())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_mandate_activation_guard() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        store
            .create_account_if_absent(&TenantBillingAccount::new("t1", now))
            .await
            .unwrap();
        store.begin_account_mandate_setup("t1", "tr_1", now).await.unwrap();

        assert!(!store.activate_account_mandate("t1", "tr_other", "mdt_1", now).await.unwrap());
        assert!(store.activate_account_mandate("t1", "tr_1", "mdt_1", now).await.unwrap());
        assert!(!store.activate_account_mandate("t1", "tr_1", "mdt_1", now).await.unwrap());
        assert!(!store.fail_account_mandate_setup("t1", "tr_1", now).await.unwrap());

        let account = store.get_account("t1").await.unwrap().unwrap();
        assert!(account.has_active_mandate());
    }

    #[tokio::test]
    async fn test_account_created_once() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        assert!(store.create_account_if_absent(&TenantBillingAccount::new("t1", now)).await.unwrap());
        store
            .set_account_customer_id("t1", CustomerProvider::Mollie, "cst_1", now)
            .await
            .unwrap();
        assert!(!store.create_account_if_absent(&TenantBillingAccount::new("t1", now)).await.unwrap());

        let account = store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(account.provider_customer_ids.mollie.as_deref(), Some("cst_1"));
    }

    #[tokio::test]
    async fn test_revoke_between_read_and_write_is_kept() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        let mut account = TenantBillingAccount::new("t1", now);
        account.adopt_mandate("mdt_1", now);
        store.seed_account(&account);

        store.before_next_account_write(move |stored| stored.revoke(now));
        store.record_account_payment("t1", now).await.unwrap();
        assert!(!store.adopt_account_mandate("t1", "mdt_1", now).await.unwrap());

        let stored = store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(stored.mandate_status, MandateStatus::Revoked);
        assert_eq!(stored.subscription_status, crate::models::SubscriptionStatus::Cancelled);
        assert!(stored.last_payment_at.is_some());
        assert!(stored.is_consistent());
    }

    #[tokio::test]
    async fn test_invoice_update_keeps_pdf_key() {
        let store = InMemoryBillingStore::new();
        let mut inv = invoice("t1");
        store.insert_invoice(&inv).await.unwrap();
        store.set_invoice_pdf_key(&inv.invoice_id, "invoices/t1/a.pdf").await.unwrap();

        inv.record_charge(crate::models::ProviderKind::Mollie, "tr_1", Utc::now());
        assert!(inv.pdf_key.is_none());
        assert!(store
            .update_invoice_if(&inv, &InvoiceStatus::payable())
            .await
            .unwrap());

        let stored = store.get_invoice(&inv.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.provider_payment_id.as_deref(), Some("tr_1"));
        assert_eq!(stored.pdf_key.as_deref(), Some("invoices/t1/a.pdf"));
    }

    #[tokio::test]
    async fn test_tenant_activation_once() {
        let store = InMemoryBillingStore::new();
        store.put_tenant(&TenantProfile::new("t1")).await.unwrap();

        assert!(store.activate_tenant_if_inactive("t1").await.unwrap());
        assert!(!store.activate_tenant_if_inactive("t1").await.unwrap());
        assert!(!store.activate_tenant_if_inactive("missing").await.unwrap());

        let tenant = store.get_tenant("t1").await.unwrap().unwrap();
        assert!(tenant.billing_active);
    }

    #[tokio::test]
    async fn test_tenant_status_keeps_reason() {
        let store = InMemoryBillingStore::new();
        store.put_tenant(&TenantProfile::new("t1")).await.unwrap();

        let now = Utc::now();
        assert!(store
            .set_tenant_status("t1", TenantStatus::Suspended, Some("offene Rechnungen"), now)
            .await
            .unwrap());
        assert!(!store
            .set_tenant_status("missing", TenantStatus::Active, None, now)
            .await
            .unwrap());

        let tenant = store.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert_eq!(tenant.status_reason.as_deref(), Some("offene Rechnungen"));
        assert_eq!(tenant.status_updated_at, Some(now));
    }

    #[tokio::test]
    async fn test_payment_method_cleared_only_when_stored() {
        let store = InMemoryBillingStore::new();
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.payment_method = Some(PaymentMethodInfo {
            id: Some("pm_1".to_string()),
            method_type: "card".to_string(),
            last4: None,
            brand: None,
        });
        store.seed_account(&account);

        assert!(!store.clear_account_payment_method("t1", "pm_2", Utc::now()).await.unwrap());
        assert!(store.clear_account_payment_method("t1", "pm_1", Utc::now()).await.unwrap());
        let stored = store.get_account("t1").await.unwrap().unwrap();
        assert!(stored.payment_method.is_none());
    }
}
