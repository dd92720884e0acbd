//! Webhook reconciliation.
//!
//! Every delivery is persisted before it is looked at and is always acknowledged. The
//! notification body only names the payment; the canonical payment is re-fetched from the
//! provider and applied through conditional store updates, so replays are silent no-ops.

use crate::config::BillingSettings;
use crate::error::BillingError;
use crate::models::{
    Invoice, InvoicePaymentStatus, InvoiceStatus, MandateStatus, PaymentDetails, PaymentMetadata,
    PaymentPurpose, PaymentStatus, ProviderKind, RawWebhookEvent, TenantBillingAccount, TenantProfile,
    WebhookOutcome,
};
use crate::providers::stripe::StripeWebhookVerifier;
use crate::providers::{PaymentProvider, ProviderError, ProviderPayment};
use crate::services::email::{self, EmailSender};
use crate::services::members::MemberService;
use crate::services::metrics;
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
struct StripeEventObject {
    id: String,
}

/// Payment id from a Mollie webhook body: `id=tr_...` form data or `{"id": "tr_..."}`.
fn mollie_payment_id(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()?
            .get("id")?
            .as_str()
            .map(str::to_string);
    }
    serde_urlencoded::from_str::<HashMap<String, String>>(trimmed)
        .ok()?
        .remove("id")
        .filter(|id| !id.is_empty())
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
    mollie: Arc<dyn PaymentProvider>,
    stripe: Arc<dyn PaymentProvider>,
    verifier: StripeWebhookVerifier,
    members: MemberService,
    email: Arc<dyn EmailSender>,
    settings: BillingSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        mollie: Arc<dyn PaymentProvider>,
        stripe: Arc<dyn PaymentProvider>,
        verifier: StripeWebhookVerifier,
        members: MemberService,
        email: Arc<dyn EmailSender>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            mollie,
            stripe,
            verifier,
            members,
            email,
            settings,
        }
    }

    async fn record(&self, provider: ProviderKind, body: &str, now: DateTime<Utc>) -> Option<RawWebhookEvent> {
        let event = RawWebhookEvent::received(provider, body, now);
        match self.store.record_webhook_event(&event).await {
            Ok(()) => Some(event),
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Failed to persist webhook event");
                None
            }
        }
    }

    async fn finish(
        &self,
        provider: ProviderKind,
        event: Option<RawWebhookEvent>,
        payment_id: Option<&str>,
        outcome: WebhookOutcome,
        now: DateTime<Utc>,
    ) -> WebhookOutcome {
        metrics::record_webhook(provider.as_str(), outcome.label());
        tracing::info!(
            provider = %provider,
            payment_id = payment_id.unwrap_or("-"),
            outcome = %outcome,
            "Webhook processed"
        );
        if let Some(event) = event {
            if let Err(e) = self
                .store
                .set_webhook_outcome(&event.event_id, payment_id, &outcome, now)
                .await
            {
                tracing::error!(event_id = %event.event_id, error = %e, "Failed to record webhook outcome");
            }
        }
        outcome
    }

    fn outcome_of(result: Result<WebhookOutcome, BillingError>) -> WebhookOutcome {
        match result {
            Ok(outcome) => outcome,
            Err(BillingError::ConditionalUpdateFailure(_)) => WebhookOutcome::Duplicate,
            Err(e) => WebhookOutcome::Error(e.to_string()),
        }
    }

    /// Platform Mollie webhook. Never fails; the outcome is for logging only.
    pub async fn handle_mollie(&self, body: &str, now: DateTime<Utc>) -> WebhookOutcome {
        let event = self.record(ProviderKind::Mollie, body, now).await;
        let Some(payment_id) = mollie_payment_id(body) else {
            let outcome = WebhookOutcome::Ignored("no payment id".to_string());
            return self.finish(ProviderKind::Mollie, event, None, outcome, now).await;
        };

        let result = match self.mollie.get_status(&payment_id).await {
            Ok(payment) => self.apply_payment(&payment, ProviderKind::Mollie, now).await,
            Err(ProviderError::NotFound(_)) => Ok(WebhookOutcome::Ignored("unknown payment".to_string())),
            Err(e) => Err(e.into()),
        };
        let outcome = Self::outcome_of(result);
        self.finish(ProviderKind::Mollie, event, Some(&payment_id), outcome, now)
            .await
    }

    /// Connect webhook for member payments.
    pub async fn handle_connect(&self, body: &str, now: DateTime<Utc>) -> WebhookOutcome {
        let event = self.record(ProviderKind::MollieConnect, body, now).await;
        let Some(payment_id) = mollie_payment_id(body) else {
            let outcome = WebhookOutcome::Ignored("no payment id".to_string());
            return self.finish(ProviderKind::MollieConnect, event, None, outcome, now).await;
        };
        let outcome = Self::outcome_of(self.members.reconcile_payment(&payment_id, now).await);
        self.finish(ProviderKind::MollieConnect, event, Some(&payment_id), outcome, now)
            .await
    }

    /// Stripe webhook. A bad signature is the only case answered with an error.
    pub async fn handle_stripe(
        &self,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let text = String::from_utf8_lossy(body);
        let event = self.record(ProviderKind::Stripe, &text, now).await;

        if let Err(e) = self.verifier.verify(signature, body, now) {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            let outcome = WebhookOutcome::Error(format!("signature: {}", e));
            self.finish(ProviderKind::Stripe, event, None, outcome, now).await;
            return Err(BillingError::Validation("Ungültige Webhook-Signatur".to_string()));
        }

        let parsed: StripeEvent = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let outcome = WebhookOutcome::Error(format!("malformed event: {}", e));
                return Ok(self.finish(ProviderKind::Stripe, event, None, outcome, now).await);
            }
        };
        if !parsed.event_type.starts_with("payment_intent.") {
            let outcome = WebhookOutcome::Ignored(parsed.event_type);
            return Ok(self.finish(ProviderKind::Stripe, event, None, outcome, now).await);
        }

        let payment_id = parsed.data.object.id;
        let result = match self.stripe.get_status(&payment_id).await {
            Ok(payment) => self.apply_payment(&payment, ProviderKind::Stripe, now).await,
            Err(ProviderError::NotFound(_)) => Ok(WebhookOutcome::Ignored("unknown payment".to_string())),
            Err(e) => Err(e.into()),
        };
        let outcome = Self::outcome_of(result);
        Ok(self
            .finish(ProviderKind::Stripe, event, Some(&payment_id), outcome, now)
            .await)
    }

    /// Apply a re-fetched provider payment to local state.
    pub async fn apply_payment(
        &self,
        payment: &ProviderPayment,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let metadata = match &payment.metadata {
            Ok(metadata) => metadata.clone(),
            Err(e) => match self.store.find_invoice_by_payment_id(&payment.id).await? {
                // Charges created before metadata was versioned still resolve by payment id.
                Some(invoice) => PaymentMetadata::invoice_payment(&invoice.tenant_id, &invoice.invoice_id),
                None => return Ok(WebhookOutcome::Ignored(format!("metadata: {}", e))),
            },
        };

        match metadata.purpose {
            PaymentPurpose::MandateSetup => self.apply_mandate_setup(payment, &metadata, now).await,
            PaymentPurpose::MonthlyBilling | PaymentPurpose::InvoicePayment => {
                self.apply_invoice_payment(payment, &metadata, provider, now).await
            }
            other => Ok(WebhookOutcome::Ignored(format!("purpose {}", other.as_str()))),
        }
    }

    async fn apply_mandate_setup(
        &self,
        payment: &ProviderPayment,
        metadata: &PaymentMetadata,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let tenant_id = metadata.tenant_id.as_str();
        let Some(account) = self.store.get_account(tenant_id).await? else {
            return Ok(WebhookOutcome::Ignored(format!("no billing account for {}", tenant_id)));
        };
        if account.mandate_status != MandateStatus::Pending
            || account.setup_payment_id.as_deref() != Some(payment.id.as_str())
        {
            return Ok(WebhookOutcome::Duplicate);
        }

        match payment.status {
            PaymentStatus::Succeeded => {
                let Some(mandate_id) = payment.mandate_id.as_deref() else {
                    return Ok(WebhookOutcome::Error("paid verification payment carries no mandate".to_string()));
                };
                if !self
                    .store
                    .activate_account_mandate(tenant_id, &payment.id, mandate_id, now)
                    .await?
                {
                    return Ok(WebhookOutcome::Duplicate);
                }
                tracing::info!(
                    tenant_id = %tenant_id,
                    payment_id = %payment.id,
                    mandate_id = %mandate_id,
                    "Mandate activated"
                );
                self.activate_tenant(tenant_id).await?;
            }
            status if status.is_failure() => {
                if !self
                    .store
                    .fail_account_mandate_setup(tenant_id, &payment.id, now)
                    .await?
                {
                    return Ok(WebhookOutcome::Duplicate);
                }
                tracing::info!(tenant_id = %tenant_id, payment_id = %payment.id, status = %payment.provider_status, "Mandate setup failed");
            }
            _ => return Ok(WebhookOutcome::Ignored(format!("payment {}", payment.provider_status))),
        }
        Ok(WebhookOutcome::Applied)
    }

    async fn resolve_invoice(
        &self,
        payment: &ProviderPayment,
        metadata: &PaymentMetadata,
    ) -> Result<Option<Invoice>, BillingError> {
        if let Some(invoice_id) = metadata.invoice_id.as_deref() {
            if let Some(invoice) = self.store.get_invoice(invoice_id).await? {
                return Ok(Some(invoice));
            }
        }
        Ok(self.store.find_invoice_by_payment_id(&payment.id).await?)
    }

    async fn apply_invoice_payment(
        &self,
        payment: &ProviderPayment,
        metadata: &PaymentMetadata,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(invoice) = self.resolve_invoice(payment, metadata).await? else {
            return Ok(WebhookOutcome::Ignored("unknown invoice".to_string()));
        };
        if invoice.tenant_id != metadata.tenant_id {
            return Ok(WebhookOutcome::Error(format!(
                "payment {} names tenant {} but invoice {} belongs to {}",
                payment.id, metadata.tenant_id, invoice.invoice_id, invoice.tenant_id
            )));
        }

        match payment.status {
            PaymentStatus::Succeeded => self.apply_paid(payment, invoice, provider, now).await,
            status if status.is_failure() => self.apply_failed(payment, invoice, now).await,
            _ => Ok(WebhookOutcome::Ignored(format!("payment {}", payment.provider_status))),
        }
    }

    async fn apply_paid(
        &self,
        payment: &ProviderPayment,
        invoice: Invoice,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        if let Some(amount) = payment.amount {
            if amount != invoice.amount {
                tracing::error!(
                    invoice_id = %invoice.invoice_id,
                    payment_id = %payment.id,
                    expected = %invoice.amount,
                    received = %amount,
                    "Paid amount does not match invoice"
                );
                return Ok(WebhookOutcome::Error(format!(
                    "amount {} does not match invoice amount {}",
                    amount, invoice.amount
                )));
            }
        }

        let mut updated = invoice.clone();
        let details = PaymentDetails {
            provider,
            payment_id: payment.id.clone(),
            method: payment.method.clone(),
            consumer_name: payment.consumer_name.clone(),
            capture_id: payment.capture_id.clone(),
        };
        if updated.mark_paid(details, now).is_err() {
            return Ok(WebhookOutcome::Duplicate);
        }
        if !self
            .store
            .update_invoice_if(&updated, &InvoiceStatus::payable())
            .await?
        {
            return Ok(WebhookOutcome::Duplicate);
        }
        tracing::info!(
            tenant_id = %updated.tenant_id,
            invoice_id = %updated.invoice_id,
            payment_id = %payment.id,
            "Invoice paid"
        );

        self.store
            .create_account_if_absent(&TenantBillingAccount::new(&updated.tenant_id, now))
            .await?;
        self.store.record_account_payment(&updated.tenant_id, now).await?;
        self.activate_tenant(&updated.tenant_id).await?;

        let tenant = self.tenant_profile(&updated.tenant_id).await?;
        let (subject, html) = email::payment_confirmation(&self.settings.brand_name, &updated, &tenant);
        self.notify(&tenant, &subject, &html).await;
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_failed(
        &self,
        payment: &ProviderPayment,
        invoice: Invoice,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        if invoice
            .provider_payment_id
            .as_deref()
            .is_some_and(|current| current != payment.id)
        {
            return Ok(WebhookOutcome::Ignored(format!("superseded payment {}", payment.id)));
        }
        if invoice.payment_status == Some(InvoicePaymentStatus::Failed) {
            return Ok(WebhookOutcome::Duplicate);
        }

        let reason = format!("Zahlung {}", payment.provider_status);
        let mut updated = invoice.clone();
        if updated.record_failure(&reason, now).is_err() {
            return Ok(WebhookOutcome::Duplicate);
        }
        updated.provider_payment_id = Some(payment.id.clone());
        if !self
            .store
            .update_invoice_if(&updated, &[InvoiceStatus::Open])
            .await?
        {
            return Ok(WebhookOutcome::Duplicate);
        }
        tracing::warn!(
            tenant_id = %updated.tenant_id,
            invoice_id = %updated.invoice_id,
            payment_id = %payment.id,
            status = %payment.provider_status,
            "Invoice payment failed"
        );

        self.store
            .record_account_payment_failure(&updated.tenant_id, now)
            .await?;

        let tenant = self.tenant_profile(&updated.tenant_id).await?;
        let (subject, html) = email::payment_failed(&self.settings.brand_name, &updated, &tenant, &reason);
        self.notify(&tenant, &subject, &html).await;
        Ok(WebhookOutcome::Applied)
    }

    async fn tenant_profile(&self, tenant_id: &str) -> Result<TenantProfile, BillingError> {
        Ok(self
            .store
            .get_tenant(tenant_id)
            .await?
            .unwrap_or_else(|| TenantProfile::new(tenant_id)))
    }

    async fn activate_tenant(&self, tenant_id: &str) -> Result<(), BillingError> {
        if self.store.activate_tenant_if_inactive(tenant_id).await? {
            tracing::info!(tenant_id = %tenant_id, "Tenant activated");
        }
        Ok(())
    }

    /// Email failures never undo a recorded payment.
    async fn notify(&self, tenant: &TenantProfile, subject: &str, html: &str) {
        let Some(to) = tenant.billing_contact_email() else {
            tracing::warn!(tenant_id = %tenant.tenant_id, "No email address, notification skipped");
            return;
        };
        if let Err(e) = self.email.send(to, subject, html).await {
            tracing::error!(tenant_id = %tenant.tenant_id, error = %e, "Failed to send billing email");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingPeriod, Estimate, SubscriptionStatus, TenantStatus};
    use crate::services::email::MockEmailSender;
    use crate::services::test_support::{connect_bridge, payment, settings, FakeProvider};
    use crate::store::InMemoryBillingStore;
    use rust_decimal::Decimal;
    use secrecy::Secret;
    use service_core::utils::hmac_sha256_hex;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    struct Harness {
        reconciler: Reconciler,
        store: Arc<InMemoryBillingStore>,
        mollie: Arc<FakeProvider>,
        stripe: Arc<FakeProvider>,
        email: Arc<MockEmailSender>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let mollie = Arc::new(FakeProvider::new());
        let stripe = Arc::new(FakeProvider::of_kind(ProviderKind::Stripe));
        let email = Arc::new(MockEmailSender::new());
        let members = MemberService::new(store.clone(), connect_bridge(store.clone(), "http://127.0.0.1:9"), settings());

        let mut tenant = TenantProfile::new("t1");
        tenant.billing_email = Some("billing@acme.test".to_string());
        store.put_tenant(&tenant).await.unwrap();

        let reconciler = Reconciler::new(
            store.clone(),
            mollie.clone(),
            stripe.clone(),
            StripeWebhookVerifier::new(Secret::new("whsec_test".to_string()), 300),
            members,
            email.clone(),
            settings(),
        );
        Harness {
            reconciler,
            store,
            mollie,
            stripe,
            email,
        }
    }

    async fn open_invoice(store: &InMemoryBillingStore, payment_id: &str) -> Invoice {
        let mut usage = BTreeMap::new();
        usage.insert("s3".to_string(), Decimal::from_str("2.10").unwrap());
        usage.insert("lambda".to_string(), Decimal::from_str("0.24").unwrap());
        let estimate = Estimate::new(Decimal::from(30), usage, BillingPeriod::containing(Utc::now()));
        let mut invoice = Invoice::open("t1", &estimate, "EUR", Utc::now());
        invoice.record_charge(ProviderKind::Mollie, payment_id, Utc::now());
        store.insert_invoice(&invoice).await.unwrap();
        invoice
    }

    async fn active_account(store: &InMemoryBillingStore) {
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.provider_customer_ids.mollie = Some("cst_1".to_string());
        account.adopt_mandate("mdt_1", Utc::now());
        store.seed_account(&account);
    }

    #[test]
    fn test_payment_id_from_form_and_json() {
        assert_eq!(mollie_payment_id("id=tr_abc").as_deref(), Some("tr_abc"));
        assert_eq!(mollie_payment_id(r#"{"id":"tr_abc"}"#).as_deref(), Some("tr_abc"));
        assert_eq!(mollie_payment_id(""), None);
        assert_eq!(mollie_payment_id("id="), None);
    }

    #[tokio::test]
    async fn test_replayed_paid_webhook_applies_once() {
        let h = harness().await;
        active_account(&h.store).await;
        let invoice = open_invoice(&h.store, "tr_1").await;
        h.mollie.set_payment(payment(
            "tr_1",
            PaymentStatus::Succeeded,
            "32.34",
            PaymentMetadata::monthly_billing("t1", &invoice.invoice_id),
        ));

        let first = h.reconciler.handle_mollie("id=tr_1", Utc::now()).await;
        let second = h.reconciler.handle_mollie("id=tr_1", Utc::now()).await;
        assert_eq!(first, WebhookOutcome::Applied);
        assert_eq!(second, WebhookOutcome::Duplicate);

        let stored = h.store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
        assert_eq!(stored.payment_details.unwrap().consumer_name.as_deref(), Some("Acme GmbH"));
        assert_eq!(h.email.send_count(), 1);
        assert_eq!(h.email.sent()[0].to, "billing@acme.test");

        let account = h.store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert!(account.last_payment_at.is_some());
        let tenant = h.store.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert!(tenant.billing_active);
    }

    #[tokio::test]
    async fn test_every_delivery_is_logged_with_outcome() {
        let h = harness().await;
        h.reconciler.handle_mollie("id=tr_missing", Utc::now()).await;

        let events = h.store.all_webhook_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body, "id=tr_missing");
        assert_eq!(events[0].payment_id.as_deref(), Some("tr_missing"));
        assert!(matches!(events[0].outcome, Some(WebhookOutcome::Ignored(_))));
        assert!(events[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_amount_mismatch_is_not_applied() {
        let h = harness().await;
        let invoice = open_invoice(&h.store, "tr_1").await;
        h.mollie.set_payment(payment(
            "tr_1",
            PaymentStatus::Succeeded,
            "1.00",
            PaymentMetadata::monthly_billing("t1", &invoice.invoice_id),
        ));

        let outcome = h.reconciler.handle_mollie("id=tr_1", Utc::now()).await;
        assert!(matches!(outcome, WebhookOutcome::Error(_)));
        let stored = h.store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Open);
        assert_eq!(h.email.send_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_charge_keeps_mandate() {
        let h = harness().await;
        active_account(&h.store).await;
        let invoice = open_invoice(&h.store, "tr_1").await;
        h.mollie.set_payment(payment(
            "tr_1",
            PaymentStatus::Failed,
            "32.34",
            PaymentMetadata::monthly_billing("t1", &invoice.invoice_id),
        ));

        assert_eq!(h.reconciler.handle_mollie("id=tr_1", Utc::now()).await, WebhookOutcome::Applied);
        assert_eq!(h.reconciler.handle_mollie("id=tr_1", Utc::now()).await, WebhookOutcome::Duplicate);

        let stored = h.store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Open);
        assert_eq!(stored.payment_status, Some(InvoicePaymentStatus::Failed));
        let account = h.store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(account.mandate_status, MandateStatus::Active);
        assert_eq!(h.email.send_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_is_a_noop() {
        let h = harness().await;
        let invoice = open_invoice(&h.store, "tr_1").await;
        h.mollie.set_payment(payment(
            "tr_1",
            PaymentStatus::Pending,
            "32.34",
            PaymentMetadata::monthly_billing("t1", &invoice.invoice_id),
        ));
        let outcome = h.reconciler.handle_mollie("id=tr_1", Utc::now()).await;
        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_verification_payment_activates_mandate() {
        let h = harness().await;
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.begin_mandate_setup("tr_setup", Utc::now());
        h.store.seed_account(&account);
        h.mollie.set_payment(payment(
            "tr_setup",
            PaymentStatus::Succeeded,
            "0.01",
            PaymentMetadata::mandate_setup("t1"),
        ));

        assert_eq!(h.reconciler.handle_mollie("id=tr_setup", Utc::now()).await, WebhookOutcome::Applied);
        assert_eq!(h.reconciler.handle_mollie("id=tr_setup", Utc::now()).await, WebhookOutcome::Duplicate);

        let stored = h.store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(stored.mandate_status, MandateStatus::Active);
        assert_eq!(stored.mandate_id.as_deref(), Some("mdt_1"));
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert!(stored.is_consistent());
    }

    #[tokio::test]
    async fn test_revoke_during_paid_webhook_is_not_undone() {
        let h = harness().await;
        active_account(&h.store).await;
        let invoice = open_invoice(&h.store, "tr_1").await;
        h.mollie.set_payment(payment(
            "tr_1",
            PaymentStatus::Succeeded,
            "32.34",
            PaymentMetadata::monthly_billing("t1", &invoice.invoice_id),
        ));
        h.store.before_next_account_write(|account| account.revoke(Utc::now()));

        assert_eq!(h.reconciler.handle_mollie("id=tr_1", Utc::now()).await, WebhookOutcome::Applied);

        let stored = h.store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
        let account = h.store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(account.mandate_status, MandateStatus::Revoked);
        assert_eq!(account.subscription_status, SubscriptionStatus::Cancelled);
        assert!(account.mandate_id.is_none());
        assert!(account.is_consistent());
    }

    #[tokio::test]
    async fn test_revoke_during_verification_webhook_wins() {
        let h = harness().await;
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.begin_mandate_setup("tr_setup", Utc::now());
        h.store.seed_account(&account);
        h.mollie.set_payment(payment(
            "tr_setup",
            PaymentStatus::Succeeded,
            "0.01",
            PaymentMetadata::mandate_setup("t1"),
        ));
        h.store.before_next_account_write(|account| account.revoke(Utc::now()));

        assert_eq!(h.reconciler.handle_mollie("id=tr_setup", Utc::now()).await, WebhookOutcome::Duplicate);
        let stored = h.store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(stored.mandate_status, MandateStatus::Revoked);
        assert!(stored.is_consistent());
        let tenant = h.store.get_tenant("t1").await.unwrap().unwrap();
        assert_ne!(tenant.status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_verification_resets_mandate() {
        let h = harness().await;
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.begin_mandate_setup("tr_setup", Utc::now());
        h.store.seed_account(&account);
        h.mollie.set_payment(payment(
            "tr_setup",
            PaymentStatus::Cancelled,
            "0.01",
            PaymentMetadata::mandate_setup("t1"),
        ));

        assert_eq!(h.reconciler.handle_mollie("id=tr_setup", Utc::now()).await, WebhookOutcome::Applied);
        let stored = h.store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(stored.mandate_status, MandateStatus::None);
    }

    #[tokio::test]
    async fn test_stripe_signature_is_checked() {
        let h = harness().await;
        let body = br#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;
        let err = h
            .reconciler
            .handle_stripe(Some("t=1,v1=deadbeef"), body, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(matches!(
            h.store.all_webhook_events()[0].outcome,
            Some(WebhookOutcome::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_stripe_event_is_refetched() {
        let h = harness().await;
        let invoice = open_invoice(&h.store, "pi_1").await;
        h.stripe.set_payment(payment(
            "pi_1",
            PaymentStatus::Succeeded,
            "32.34",
            PaymentMetadata::invoice_payment("t1", &invoice.invoice_id),
        ));

        // The body claims a failure; the re-fetched intent says otherwise.
        let body = br#"{"type":"payment_intent.payment_failed","data":{"object":{"id":"pi_1","status":"requires_payment_method"}}}"#;
        let now = Utc::now();
        let signed = format!("{}.{}", now.timestamp(), String::from_utf8_lossy(body));
        let signature = hmac_sha256_hex(b"whsec_test", signed.as_bytes()).unwrap();
        let header = format!("t={},v1={}", now.timestamp(), signature);

        let outcome = h.reconciler.handle_stripe(Some(&header), body, now).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);
        let stored = h.store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.payment_method, Some(ProviderKind::Stripe));
        assert!(stored.is_paid());
    }
}
