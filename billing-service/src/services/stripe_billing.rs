//! Card and SEPA payments through Stripe.

use crate::error::BillingError;
use crate::models::{
    CustomerProvider, InvoiceStatus, PaymentMetadata, PaymentMethodInfo, ProviderKind, StripeSubscriptionState,
    TenantBillingAccount, TenantProfile,
};
use crate::providers::stripe::{from_unix, StripeInvoice, StripePaymentMethod, StripeSubscription};
use crate::providers::{ChargeRequest, StripeClient};
use crate::services::invoice_engine::InvoiceEngine;
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntentOutcome {
    pub setup_intent_id: String,
    pub client_secret: Option<String>,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodStatus {
    pub has_payment_method: bool,
    pub payment_method: Option<PaymentMethodInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePaymentIntent {
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub invoice_id: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Default description of usage charged on the next Stripe invoice.
const USAGE_DESCRIPTION: &str = "Infrastrukturkosten";

/// How many past Stripe invoices are listed.
const INVOICE_HISTORY_LIMIT: u32 = 24;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetails {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<DateTime<Utc>>,
}

impl From<&StripeSubscription> for SubscriptionDetails {
    fn from(subscription: &StripeSubscription) -> Self {
        Self {
            id: subscription.id.clone(),
            status: subscription.status.clone(),
            current_period_start: subscription.current_period_start.and_then(from_unix),
            current_period_end: subscription.current_period_end.and_then(from_unix),
            cancel_at_period_end: subscription.cancel_at_period_end,
            cancel_at: subscription.cancel_at.and_then(from_unix),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusView {
    pub has_subscription: bool,
    pub subscription: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCreated {
    pub subscription_id: String,
    pub status: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCancelled {
    pub subscription_id: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCharged {
    pub invoice_item_id: String,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeInvoiceView {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub amount: Decimal,
    pub amount_paid: Decimal,
    pub currency: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

impl From<StripeInvoice> for StripeInvoiceView {
    fn from(invoice: StripeInvoice) -> Self {
        Self {
            id: invoice.id,
            number: invoice.number,
            status: invoice.status,
            amount: Decimal::new(invoice.amount_due, 2),
            amount_paid: Decimal::new(invoice.amount_paid, 2),
            currency: invoice.currency,
            period_start: from_unix(invoice.period_start),
            period_end: from_unix(invoice.period_end),
            created: from_unix(invoice.created),
            paid_at: invoice.status_transitions.paid_at.and_then(from_unix),
            hosted_invoice_url: invoice.hosted_invoice_url,
            invoice_pdf: invoice.invoice_pdf,
        }
    }
}

fn method_info(method: &StripePaymentMethod) -> PaymentMethodInfo {
    PaymentMethodInfo {
        id: Some(method.id.clone()),
        method_type: method.method_type.clone(),
        last4: method.last4(),
        brand: method.brand(),
    }
}

#[derive(Clone)]
pub struct StripeBillingService {
    store: Arc<dyn BillingStore>,
    stripe: StripeClient,
    engine: InvoiceEngine,
    price_id: Option<String>,
}

impl StripeBillingService {
    pub fn new(store: Arc<dyn BillingStore>, stripe: StripeClient, engine: InvoiceEngine) -> Self {
        Self {
            store,
            stripe,
            engine,
            price_id: None,
        }
    }

    /// Price the recurring base-fee subscription is created on.
    pub fn with_price_id(mut self, price_id: Option<String>) -> Self {
        self.price_id = price_id.filter(|id| !id.is_empty());
        self
    }

    async fn stripe_customer(&self, tenant_id: &str) -> Result<Option<String>, BillingError> {
        Ok(self
            .store
            .get_account(tenant_id)
            .await?
            .and_then(|account| account.provider_customer_ids.stripe))
    }

    async fn ensure_customer(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<String, BillingError> {
        self.store
            .create_account_if_absent(&TenantBillingAccount::new(tenant_id, now))
            .await?;
        let account = self.store.get_account(tenant_id).await?;
        if let Some(customer_id) = account.and_then(|a| a.provider_customer_ids.stripe) {
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
            .stripe
            .create_customer(&email, &tenant.display_name(), &PaymentMetadata::mandate_setup(tenant_id))
            .await?;
        self.store
            .set_account_customer_id(tenant_id, CustomerProvider::Stripe, &customer.id, now)
            .await?;
        tracing::info!(tenant_id = %tenant_id, customer_id = %customer.id, "Stripe customer linked");
        Ok(customer.id)
    }

    pub async fn setup_intent(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<SetupIntentOutcome, BillingError> {
        let customer_id = self.ensure_customer(tenant_id, now).await?;
        let intent = self
            .stripe
            .create_setup_intent(&customer_id, &PaymentMetadata::mandate_setup(tenant_id))
            .await?;
        tracing::info!(tenant_id = %tenant_id, setup_intent_id = %intent.id, "Stripe setup intent created");
        Ok(SetupIntentOutcome {
            setup_intent_id: intent.id,
            client_secret: intent.client_secret,
            customer_id,
        })
    }

    /// The customer's first stored payment method, mirrored onto the billing account.
    pub async fn payment_method_status(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentMethodStatus, BillingError> {
        let Some(account) = self.store.get_account(tenant_id).await? else {
            return Ok(PaymentMethodStatus {
                has_payment_method: false,
                payment_method: None,
            });
        };
        let Some(customer_id) = account.provider_customer_ids.stripe.clone() else {
            return Ok(PaymentMethodStatus {
                has_payment_method: false,
                payment_method: account.payment_method,
            });
        };

        let methods = self.stripe.list_payment_methods(&customer_id).await?;
        let info = methods.first().map(method_info);

        if let Some(method) = info.as_ref().filter(|m| account.payment_method.as_ref() != Some(*m)) {
            self.store.set_account_payment_method(tenant_id, method, now).await?;
        }

        Ok(PaymentMethodStatus {
            has_payment_method: info.is_some(),
            payment_method: info,
        })
    }

    /// PaymentIntent for an open invoice. The invoice id doubles as idempotency key, so a
    /// repeated request returns the same intent.
    pub async fn invoice_payment_intent(
        &self,
        tenant_id: &str,
        invoice_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<InvoicePaymentIntent, BillingError> {
        let invoice = match invoice_id {
            Some(id) => self.engine.get_invoice(tenant_id, id).await?,
            None => self.engine.current_period_invoice(tenant_id, now).await?,
        };
        if invoice.status != InvoiceStatus::Open {
            return Err(BillingError::Validation(format!(
                "Rechnung {} ist nicht offen",
                invoice.invoice_number
            )));
        }

        let customer_id = self.ensure_customer(tenant_id, now).await?;
        let request = ChargeRequest {
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            idempotency_key: invoice.invoice_id.clone(),
            description: format!("{} {}", self.engine.settings().brand_name, invoice.invoice_number),
            metadata: PaymentMetadata::invoice_payment(tenant_id, &invoice.invoice_id),
            customer_id: Some(customer_id),
            mandate_id: None,
            redirect_url: None,
            webhook_url: None,
        };
        let intent = self.stripe.create_payment_intent(&request).await?;

        let mut updated = invoice.clone();
        updated.record_charge(ProviderKind::Stripe, &intent.id, now);
        self.store.update_invoice_if(&updated, &[InvoiceStatus::Open]).await?;

        Ok(InvoicePaymentIntent {
            payment_intent_id: intent.id,
            client_secret: intent.client_secret,
            invoice_id: invoice.invoice_id,
            amount: invoice.amount,
            currency: invoice.currency,
        })
    }

    pub async fn subscription(&self, tenant_id: &str) -> Result<SubscriptionStatusView, BillingError> {
        let stored = self
            .store
            .get_account(tenant_id)
            .await?
            .and_then(|account| account.stripe_subscription);
        let Some(stored) = stored else {
            return Ok(SubscriptionStatusView {
                has_subscription: false,
                subscription: None,
            });
        };
        let subscription = self.stripe.get_subscription(&stored.id).await?;
        Ok(SubscriptionStatusView {
            has_subscription: true,
            subscription: Some(SubscriptionDetails::from(&subscription)),
        })
    }

    /// Recurring base-fee subscription. A given payment method becomes the customer's default first.
    pub async fn create_subscription(
        &self,
        tenant_id: &str,
        payment_method_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionCreated, BillingError> {
        let price_id = self
            .price_id
            .clone()
            .ok_or_else(|| BillingError::Validation("Stripe Preis-ID ist nicht konfiguriert".to_string()))?;
        let customer_id = self.ensure_customer(tenant_id, now).await?;

        if let Some(payment_method_id) = payment_method_id {
            self.attach_default(tenant_id, &customer_id, payment_method_id, now).await?;
        }

        let subscription = self
            .stripe
            .create_subscription(&customer_id, &price_id, &PaymentMetadata::mandate_setup(tenant_id))
            .await?;
        self.store_subscription(tenant_id, &subscription, now).await?;

        Ok(SubscriptionCreated {
            client_secret: subscription.client_secret(),
            subscription_id: subscription.id,
            status: subscription.status,
        })
    }

    pub async fn cancel_subscription(
        &self,
        tenant_id: &str,
        immediately: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionCancelled, BillingError> {
        let stored = self
            .store
            .get_account(tenant_id)
            .await?
            .and_then(|account| account.stripe_subscription)
            .ok_or_else(|| BillingError::NotFound("Kein aktives Abonnement gefunden".to_string()))?;

        let subscription = self.stripe.cancel_subscription(&stored.id, immediately).await?;
        self.store_subscription(tenant_id, &subscription, now).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            immediately,
            "Stripe subscription cancelled"
        );

        Ok(SubscriptionCancelled {
            current_period_end: subscription.current_period_end.and_then(from_unix),
            subscription_id: subscription.id,
            status: subscription.status,
            cancel_at_period_end: subscription.cancel_at_period_end,
        })
    }

    pub async fn add_payment_method(
        &self,
        tenant_id: &str,
        payment_method_id: &str,
        set_as_default: bool,
        now: DateTime<Utc>,
    ) -> Result<StripePaymentMethod, BillingError> {
        let customer_id = self.ensure_customer(tenant_id, now).await?;
        if set_as_default {
            return self.attach_default(tenant_id, &customer_id, payment_method_id, now).await;
        }
        Ok(self.stripe.attach_payment_method(payment_method_id, &customer_id).await?)
    }

    /// Detach the given method, or the stored one when none is named.
    pub async fn delete_payment_method(
        &self,
        tenant_id: &str,
        payment_method_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let stored = self
            .store
            .get_account(tenant_id)
            .await?
            .and_then(|account| account.payment_method)
            .and_then(|method| method.id);
        let payment_method_id = payment_method_id
            .map(str::to_string)
            .or(stored)
            .ok_or_else(|| BillingError::NotFound("Keine Zahlungsmethode gefunden".to_string()))?;

        self.stripe.detach_payment_method(&payment_method_id).await?;
        let cleared = self
            .store
            .clear_account_payment_method(tenant_id, &payment_method_id, now)
            .await?;
        tracing::info!(tenant_id = %tenant_id, payment_method_id = %payment_method_id, cleared, "Stripe payment method detached");
        Ok(())
    }

    /// Charge usage on the customer's next Stripe invoice.
    pub async fn add_usage(
        &self,
        tenant_id: &str,
        amount: Decimal,
        description: Option<&str>,
    ) -> Result<UsageCharged, BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation("Betrag muss größer als 0 sein".to_string()));
        }
        let customer_id = self
            .stripe_customer(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Kein Stripe-Kunde gefunden".to_string()))?;
        let description = description.filter(|d| !d.trim().is_empty()).unwrap_or(USAGE_DESCRIPTION);
        let currency = self.engine.settings().currency.clone();

        let item = self
            .stripe
            .create_invoice_item(&customer_id, amount, &currency, description)
            .await?;
        tracing::info!(tenant_id = %tenant_id, invoice_item_id = %item.id, amount = %amount, "Stripe usage recorded");
        Ok(UsageCharged {
            invoice_item_id: item.id,
            amount: Decimal::new(item.amount, 2),
            description: item.description.unwrap_or_else(|| description.to_string()),
        })
    }

    pub async fn stripe_invoices(&self, tenant_id: &str) -> Result<Vec<StripeInvoiceView>, BillingError> {
        let Some(customer_id) = self.stripe_customer(tenant_id).await? else {
            return Ok(Vec::new());
        };
        let invoices = self.stripe.list_invoices(&customer_id, INVOICE_HISTORY_LIMIT).await?;
        Ok(invoices.into_iter().map(StripeInvoiceView::from).collect())
    }

    async fn attach_default(
        &self,
        tenant_id: &str,
        customer_id: &str,
        payment_method_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StripePaymentMethod, BillingError> {
        self.stripe.attach_payment_method(payment_method_id, customer_id).await?;
        self.stripe
            .set_default_payment_method(customer_id, payment_method_id)
            .await?;
        let method = self.stripe.get_payment_method(payment_method_id).await?;
        self.store
            .set_account_payment_method(tenant_id, &method_info(&method), now)
            .await?;
        Ok(method)
    }

    async fn store_subscription(
        &self,
        tenant_id: &str,
        subscription: &StripeSubscription,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let state = StripeSubscriptionState {
            id: subscription.id.clone(),
            status: subscription.status.clone(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        };
        self.store.set_account_stripe_subscription(tenant_id, &state, now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cost::StaticCostReporter;
    use crate::services::test_support::{credentials, settings, FakeProvider};
    use crate::store::InMemoryBillingStore;
    use reqwest::Client;
    use serde_json::json;
    use service_core::retry::RetryConfig;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn service(server: &MockServer) -> (StripeBillingService, Arc<InMemoryBillingStore>) {
        let store = Arc::new(InMemoryBillingStore::new());
        let mut tenant = TenantProfile::new("t1");
        tenant.billing_email = Some("billing@acme.test".to_string());
        store.put_tenant(&tenant).await.unwrap();
        let engine = InvoiceEngine::new(
            store.clone(),
            Arc::new(StaticCostReporter::new()),
            Arc::new(FakeProvider::new()),
            settings(),
        );
        let stripe = StripeClient::new(Client::new(), &server.uri(), RetryConfig::no_retry(), credentials());
        let service = StripeBillingService::new(store.clone(), stripe, engine).with_price_id(Some("price_base".to_string()));
        (service, store)
    }

    fn linked_account(store: &InMemoryBillingStore) -> TenantBillingAccount {
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.provider_customer_ids.stripe = Some("cus_1".to_string());
        store.seed_account(&account);
        account
    }

    async fn mount_customer(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/customers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_1"})))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_setup_intent_creates_customer_once() {
        let server = MockServer::start().await;
        mount_customer(&server).await;
        Mock::given(method("POST"))
            .and(path("/v1/setup_intents"))
            .and(body_string_contains("customer=cus_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "seti_1", "client_secret": "seti_1_secret", "status": "requires_payment_method"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        let first = service.setup_intent("t1", Utc::now()).await.unwrap();
        let second = service.setup_intent("t1", Utc::now()).await.unwrap();
        assert_eq!(first.customer_id, "cus_1");
        assert_eq!(second.client_secret.as_deref(), Some("seti_1_secret"));
        let account = store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(account.provider_customer_ids.stripe.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn test_payment_method_status_is_mirrored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/cus_1/payment_methods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "pm_1", "type": "card", "card": {"brand": "visa", "last4": "4242"}}]
            })))
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        let mut account = TenantBillingAccount::new("t1", Utc::now());
        account.provider_customer_ids.stripe = Some("cus_1".to_string());
        store.seed_account(&account);

        let status = service.payment_method_status("t1", Utc::now()).await.unwrap();
        assert!(status.has_payment_method);
        let stored = store.get_account("t1").await.unwrap().unwrap();
        let method = stored.payment_method.unwrap();
        assert_eq!(method.last4.as_deref(), Some("4242"));
        assert_eq!(method.brand.as_deref(), Some("visa"));
    }

    #[tokio::test]
    async fn test_invoice_intent_uses_invoice_id_as_idempotency_key() {
        let server = MockServer::start().await;
        mount_customer(&server).await;
        let (service, store) = service(&server).await;
        let invoice = service.engine.current_period_invoice("t1", Utc::now()).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("Idempotency-Key", invoice.invoice_id.as_str()))
            .and(body_string_contains("amount=3000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_1", "status": "requires_payment_method", "amount": 3000,
                "currency": "eur", "client_secret": "pi_1_secret"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let intent = service.invoice_payment_intent("t1", None, Utc::now()).await.unwrap();
        assert_eq!(intent.client_secret.as_deref(), Some("pi_1_secret"));
        let stored = store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.provider_payment_id.as_deref(), Some("pi_1"));
        assert_eq!(stored.payment_method, Some(ProviderKind::Stripe));
    }

    #[tokio::test]
    async fn test_subscription_with_payment_method_sets_default_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_methods/pm_1/attach"))
            .and(body_string_contains("customer=cus_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pm_1", "type": "card"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/customers/cus_1"))
            .and(body_string_contains("default_payment_method%5D=pm_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_methods/pm_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pm_1", "type": "card", "card": {"brand": "visa", "last4": "4242", "exp_month": 12, "exp_year": 2030}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1", "status": "incomplete",
                "latest_invoice": {"payment_intent": {"client_secret": "pi_1_secret"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        linked_account(&store);
        let created = service.create_subscription("t1", Some("pm_1"), Utc::now()).await.unwrap();
        assert_eq!(created.subscription_id, "sub_1");
        assert_eq!(created.client_secret.as_deref(), Some("pi_1_secret"));

        let account = store.get_account("t1").await.unwrap().unwrap();
        assert_eq!(account.stripe_subscription.unwrap().status, "incomplete");
        let method = account.payment_method.unwrap();
        assert_eq!(method.id.as_deref(), Some("pm_1"));
        assert_eq!(method.last4.as_deref(), Some("4242"));
    }

    #[tokio::test]
    async fn test_subscription_without_price_is_rejected() {
        let server = MockServer::start().await;
        let (service, store) = service(&server).await;
        linked_account(&store);
        let service = service.with_price_id(None);
        assert!(matches!(
            service.create_subscription("t1", None, Utc::now()).await,
            Err(BillingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_not_found() {
        let server = MockServer::start().await;
        let (service, store) = service(&server).await;
        linked_account(&store);
        assert!(matches!(
            service.cancel_subscription("t1", false, Utc::now()).await,
            Err(BillingError::NotFound(_))
        ));
        let status = service.subscription("t1").await.unwrap();
        assert!(!status.has_subscription);
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_is_stored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions/sub_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1", "status": "active", "cancel_at_period_end": true, "current_period_end": 1769904000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        let mut account = linked_account(&store);
        account.stripe_subscription = Some(StripeSubscriptionState {
            id: "sub_1".to_string(),
            status: "active".to_string(),
            cancel_at_period_end: false,
        });
        store.seed_account(&account);

        let cancelled = service.cancel_subscription("t1", false, Utc::now()).await.unwrap();
        assert!(cancelled.cancel_at_period_end);
        assert!(cancelled.current_period_end.is_some());
        let stored = store.get_account("t1").await.unwrap().unwrap().stripe_subscription.unwrap();
        assert!(stored.cancel_at_period_end);
        assert_eq!(stored.status, "active");
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_stored_method() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_methods/pm_1/detach"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pm_1", "type": "card"})))
            .expect(1)
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        let mut account = linked_account(&store);
        account.payment_method = Some(PaymentMethodInfo {
            id: Some("pm_1".to_string()),
            method_type: "card".to_string(),
            last4: Some("4242".to_string()),
            brand: Some("visa".to_string()),
        });
        store.seed_account(&account);

        service.delete_payment_method("t1", None, Utc::now()).await.unwrap();
        assert!(store.get_account("t1").await.unwrap().unwrap().payment_method.is_none());
        assert!(matches!(
            service.delete_payment_method("t1", None, Utc::now()).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_usage_requires_customer_and_positive_amount() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoiceitems"))
            .and(body_string_contains("description=Infrastrukturkosten"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ii_1", "amount": 450, "description": "Infrastrukturkosten"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        assert!(matches!(
            service.add_usage("t1", Decimal::new(45, 1), None).await,
            Err(BillingError::NotFound(_))
        ));
        linked_account(&store);
        assert!(matches!(
            service.add_usage("t1", Decimal::ZERO, None).await,
            Err(BillingError::Validation(_))
        ));
        let usage = service.add_usage("t1", Decimal::new(45, 1), Some(" ")).await.unwrap();
        assert_eq!(usage.amount, Decimal::new(450, 2));
        assert_eq!(usage.description, "Infrastrukturkosten");
    }

    #[tokio::test]
    async fn test_stripe_invoices_are_listed_in_major_units() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .and(query_param("customer", "cus_1"))
            .and(query_param("limit", "24"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "in_1", "number": "A-0001", "status": "paid",
                    "amount_due": 3231, "amount_paid": 3231, "currency": "eur",
                    "period_start": 1767225600, "period_end": 1769904000, "created": 1769904000,
                    "status_transitions": {"paid_at": 1769990400},
                    "hosted_invoice_url": "https://invoice.stripe.test/i/1", "invoice_pdf": null
                }]
            })))
            .mount(&server)
            .await;

        let (service, store) = service(&server).await;
        assert!(service.stripe_invoices("t1").await.unwrap().is_empty());
        linked_account(&store);
        let invoices = service.stripe_invoices("t1").await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].amount, Decimal::new(3231, 2));
        assert!(invoices[0].paid_at.is_some());
    }
}
