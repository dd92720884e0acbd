//! Persistence seam for billing state.
//!
//! Every conditional operation returns `Ok(false)` when its guard did not match, which
//! callers treat as "already applied by someone else".
//!
//! Account and invoice transitions write only the fields they own, filtered on the state they
//! expect, so concurrent writers never overwrite each other's fields with a stale snapshot.

pub mod memory;
pub mod mongo;

pub use memory::InMemoryBillingStore;
pub use mongo::MongoBillingStore;

use crate::models::{
    CustomerProvider, Invoice, InvoiceStatus, MemberSubscription, MollieConnectAccount,
    PaymentMethodInfo, RawWebhookEvent, StripeSubscriptionState, TenantBillingAccount, TenantProfile,
    TenantStatus, WebhookOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniquely indexed value is already taken.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // Billing accounts

    async fn get_account(&self, tenant_id: &str) -> Result<Option<TenantBillingAccount>, StoreError>;

    /// Insert the account unless one exists for the tenant.
    async fn create_account_if_absent(&self, account: &TenantBillingAccount) -> Result<bool, StoreError>;

    async fn set_account_customer_id(
        &self,
        tenant_id: &str,
        provider: CustomerProvider,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_account_payment_method(
        &self,
        tenant_id: &str,
        payment_method: &PaymentMethodInfo,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Clear the stored payment method if it is `payment_method_id`.
    async fn clear_account_payment_method(
        &self,
        tenant_id: &str,
        payment_method_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn set_account_stripe_subscription(
        &self,
        tenant_id: &str,
        subscription: &StripeSubscriptionState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark a provider-valid mandate active unless the account has been revoked.
    async fn adopt_account_mandate(
        &self,
        tenant_id: &str,
        mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Start a setup for `setup_payment_id`: pending mandate, no mandate id, an active
    /// subscription drops to inactive.
    async fn begin_account_mandate_setup(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Activate mandate and subscription while the setup for `setup_payment_id` is still pending.
    async fn activate_account_mandate(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return a pending setup for `setup_payment_id` to `none`.
    async fn fail_account_mandate_setup(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Stamp `last_payment_at`; the subscription becomes active only under an active mandate.
    async fn record_account_payment(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Suspend an active subscription. The mandate is kept.
    async fn record_account_payment_failure(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Revoke the mandate and cancel the subscription. `None` when there is no account.
    async fn revoke_account(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TenantBillingAccount>, StoreError>;

    async fn list_accounts_with_active_mandate(&self) -> Result<Vec<TenantBillingAccount>, StoreError>;

    // Invoices

    /// Fails with [`StoreError::Duplicate`] when a non-void invoice already holds the period.
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError>;

    async fn find_invoice_by_number(
        &self,
        tenant_id: &str,
        invoice_number: &str,
    ) -> Result<Option<Invoice>, StoreError>;

    /// The non-void invoice holding `period_lock`, if any.
    async fn find_invoice_by_period_lock(&self, period_lock: &str) -> Result<Option<Invoice>, StoreError>;

    async fn find_invoice_by_payment_id(&self, provider_payment_id: &str) -> Result<Option<Invoice>, StoreError>;

    /// Newest first.
    async fn list_invoices(&self, tenant_id: &str) -> Result<Vec<Invoice>, StoreError>;

    /// Every tenant's invoices, newest first.
    async fn list_all_invoices(&self) -> Result<Vec<Invoice>, StoreError>;

    /// Write the invoice's status and payment fields while its stored status is one of
    /// `expected`. Identity, amounts and `pdf_key` are left as stored.
    async fn update_invoice_if(
        &self,
        invoice: &Invoice,
        expected: &[InvoiceStatus],
    ) -> Result<bool, StoreError>;

    async fn set_invoice_pdf_key(&self, invoice_id: &str, pdf_key: &str) -> Result<(), StoreError>;

    // Mollie Connect accounts

    async fn get_connect_account(&self, tenant_id: &str) -> Result<Option<MollieConnectAccount>, StoreError>;

    async fn put_connect_account(&self, account: &MollieConnectAccount) -> Result<(), StoreError>;

    async fn list_connected_accounts(&self) -> Result<Vec<MollieConnectAccount>, StoreError>;

    // Member subscriptions

    async fn get_member(&self, tenant_id: &str, member_id: &str) -> Result<Option<MemberSubscription>, StoreError>;

    async fn put_member(&self, member: &MemberSubscription) -> Result<(), StoreError>;

    async fn list_members(&self, tenant_id: &str) -> Result<Vec<MemberSubscription>, StoreError>;

    async fn find_member_by_mandate_payment(&self, payment_id: &str) -> Result<Option<MemberSubscription>, StoreError>;

    async fn find_member_by_customer(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> Result<Option<MemberSubscription>, StoreError>;

    /// Replace the member only if `payment_id` has not been applied to it yet.
    async fn replace_member_if_payment_new(
        &self,
        member: &MemberSubscription,
        payment_id: &str,
    ) -> Result<bool, StoreError>;

    // Tenants

    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantProfile>, StoreError>;

    async fn put_tenant(&self, tenant: &TenantProfile) -> Result<(), StoreError>;

    async fn list_tenants(&self) -> Result<Vec<TenantProfile>, StoreError>;

    /// Set the status and its reason. `false` when the tenant does not exist.
    async fn set_tenant_status(
        &self,
        tenant_id: &str,
        status: TenantStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Set `status=active, billing_active=true` unless the tenant is already active.
    async fn activate_tenant_if_inactive(&self, tenant_id: &str) -> Result<bool, StoreError>;

    // Raw webhook events

    async fn record_webhook_event(&self, event: &RawWebhookEvent) -> Result<(), StoreError>;

    async fn set_webhook_outcome(
        &self,
        event_id: &str,
        payment_id: Option<&str>,
        outcome: &WebhookOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_webhook_event(&self, event_id: &str) -> Result<Option<RawWebhookEvent>, StoreError>;
}
