//! One-off invoice payments through PayPal orders.

use crate::error::BillingError;
use crate::models::{Invoice, InvoiceStatus, PaymentMetadata, PaymentStatus, ProviderKind, WebhookOutcome};
use crate::providers::{ChargeRequest, PaymentProvider, PaypalClient};
use crate::services::invoice_engine::InvoiceEngine;
use crate::services::reconciler::Reconciler;
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaypalOrderOutcome {
    pub order_id: String,
    pub approval_url: Option<String>,
    pub amount: Decimal,
    pub invoice_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaypalCaptureOutcome {
    pub success: bool,
    pub capture_id: Option<String>,
    pub status: String,
    pub amount: Option<Decimal>,
}

#[derive(Clone)]
pub struct PaypalBillingService {
    store: Arc<dyn BillingStore>,
    paypal: PaypalClient,
    engine: InvoiceEngine,
    reconciler: Reconciler,
    return_url: String,
}

impl PaypalBillingService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        paypal: PaypalClient,
        engine: InvoiceEngine,
        reconciler: Reconciler,
        return_url: &str,
    ) -> Self {
        Self {
            store,
            paypal,
            engine,
            reconciler,
            return_url: return_url.to_string(),
        }
    }

    async fn invoice_for(
        &self,
        tenant_id: &str,
        invoice_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        match invoice_id {
            Some(id) => self.engine.get_invoice(tenant_id, id).await,
            None => self.engine.current_period_invoice(tenant_id, now).await,
        }
    }

    /// Order for an existing invoice, or for the current period's invoice from the estimate.
    pub async fn create_order(
        &self,
        tenant_id: &str,
        invoice_id: Option<&str>,
        return_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PaypalOrderOutcome, BillingError> {
        let invoice = self.invoice_for(tenant_id, invoice_id, now).await?;
        if invoice.status != InvoiceStatus::Open {
            return Err(BillingError::Validation(format!(
                "Rechnung {} ist nicht offen",
                invoice.invoice_number
            )));
        }

        let request = ChargeRequest {
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            idempotency_key: invoice.invoice_id.clone(),
            description: format!(
                "{} {}",
                self.engine.settings().brand_name,
                invoice.invoice_number
            ),
            metadata: PaymentMetadata::invoice_payment(tenant_id, &invoice.invoice_id),
            customer_id: None,
            mandate_id: None,
            redirect_url: Some(return_url.unwrap_or(&self.return_url).to_string()),
            webhook_url: None,
        };
        let order = self.paypal.create_order(&request).await?;

        let mut updated = invoice.clone();
        updated.record_charge(ProviderKind::Paypal, &order.id, now);
        self.store.update_invoice_if(&updated, &[InvoiceStatus::Open]).await?;

        Ok(PaypalOrderOutcome {
            approval_url: order.approval_url(),
            order_id: order.id,
            amount: invoice.amount,
            invoice_id: invoice.invoice_id,
        })
    }

    /// Capture an approved order and settle the invoice through the same conditional
    /// update the webhooks use.
    pub async fn capture(
        &self,
        tenant_id: &str,
        order_id: &str,
        invoice_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PaypalCaptureOutcome, BillingError> {
        let captured = self.paypal.capture(order_id).await?;
        let mut payment = self.paypal.get_status(order_id).await?;

        let metadata = match &payment.metadata {
            Ok(metadata) => metadata.clone(),
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "PayPal order without invoice reference");
                let invoice = self.invoice_for(tenant_id, invoice_id, now).await?;
                PaymentMetadata::invoice_payment(tenant_id, &invoice.invoice_id)
            }
        };
        if metadata.tenant_id != tenant_id {
            return Err(BillingError::Validation(format!(
                "Bestellung {} gehört nicht zu {}",
                order_id, tenant_id
            )));
        }
        payment.metadata = Ok(metadata);
        if payment.capture_id.is_none() {
            payment.capture_id = captured.capture_id.clone();
        }

        let outcome = self
            .reconciler
            .apply_payment(&payment, ProviderKind::Paypal, now)
            .await?;
        let settled = payment.status == PaymentStatus::Succeeded
            && matches!(outcome, WebhookOutcome::Applied | WebhookOutcome::Duplicate);
        tracing::info!(
            tenant_id = %tenant_id,
            order_id = %order_id,
            outcome = %outcome,
            "PayPal capture reconciled"
        );

        Ok(PaypalCaptureOutcome {
            success: settled,
            capture_id: payment.capture_id,
            status: payment.provider_status,
            amount: payment.amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantProfile;
    use crate::providers::stripe::StripeWebhookVerifier;
    use crate::services::cost::StaticCostReporter;
    use crate::services::email::MockEmailSender;
    use crate::services::members::MemberService;
    use crate::services::test_support::{connect_bridge, credentials, settings, FakeProvider};
    use crate::store::InMemoryBillingStore;
    use reqwest::Client;
    use secrecy::Secret;
    use serde_json::json;
    use service_core::retry::RetryConfig;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn service(server: &MockServer) -> (PaypalBillingService, Arc<InMemoryBillingStore>, Arc<MockEmailSender>) {
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A21", "token_type": "Bearer", "expires_in": 32400
            })))
            .mount(server)
            .await;

        let store = Arc::new(InMemoryBillingStore::new());
        let mut tenant = TenantProfile::new("t1");
        tenant.email = Some("creator@acme.test".to_string());
        store.put_tenant(&tenant).await.unwrap();

        let email = Arc::new(MockEmailSender::new());
        let engine = InvoiceEngine::new(
            store.clone(),
            Arc::new(StaticCostReporter::new()),
            Arc::new(FakeProvider::new()),
            settings(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(FakeProvider::new()),
            Arc::new(FakeProvider::of_kind(ProviderKind::Stripe)),
            StripeWebhookVerifier::new(Secret::new(String::new()), 300),
            MemberService::new(store.clone(), connect_bridge(store.clone(), &server.uri()), settings()),
            email.clone(),
            settings(),
        );
        let paypal = PaypalClient::new(Client::new(), &server.uri(), RetryConfig::no_retry(), credentials());
        (
            PaypalBillingService::new(store.clone(), paypal, engine, reconciler, "https://t1.example.com/paid"),
            store,
            email,
        )
    }

    fn order_json(invoice_id: &str, status: &str, capture: Option<&str>) -> serde_json::Value {
        let mut unit = json!({
            "reference_id": invoice_id,
            "custom_id": "t1",
            "amount": {"currency_code": "EUR", "value": "30.00"}
        });
        if let Some(capture_status) = capture {
            unit["payments"] = json!({"captures": [{"id": "CAP-1", "status": capture_status}]});
        }
        json!({
            "id": "ORDER-1",
            "status": status,
            "purchase_units": [unit],
            "links": [{"href": "https://paypal.test/approve/ORDER-1", "rel": "approve"}]
        })
    }

    #[tokio::test]
    async fn test_order_for_current_period() {
        let server = MockServer::start().await;
        let (service, store, _) = service(&server).await;
        let invoice = service.engine.current_period_invoice("t1", Utc::now()).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .and(header("PayPal-Request-Id", invoice.invoice_id.as_str()))
            .and(body_partial_json(json!({"intent": "CAPTURE", "purchase_units": [{"custom_id": "t1"}]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(order_json(&invoice.invoice_id, "CREATED", None)))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = service.create_order("t1", None, None, Utc::now()).await.unwrap();
        assert_eq!(outcome.order_id, "ORDER-1");
        assert_eq!(outcome.approval_url.as_deref(), Some("https://paypal.test/approve/ORDER-1"));
        assert_eq!(outcome.invoice_id, invoice.invoice_id);

        let stored = store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.payment_method, Some(ProviderKind::Paypal));
    }

    #[tokio::test]
    async fn test_capture_marks_invoice_paid_once() {
        let server = MockServer::start().await;
        let (service, store, email) = service(&server).await;
        let invoice = service.engine.current_period_invoice("t1", Utc::now()).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders/ORDER-1/capture"))
            .respond_with(ResponseTemplate::new(201).set_body_json(order_json(&invoice.invoice_id, "COMPLETED", Some("COMPLETED"))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/checkout/orders/ORDER-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json(&invoice.invoice_id, "COMPLETED", Some("COMPLETED"))))
            .mount(&server)
            .await;

        let first = service.capture("t1", "ORDER-1", None, Utc::now()).await.unwrap();
        let second = service.capture("t1", "ORDER-1", None, Utc::now()).await.unwrap();
        assert!(first.success);
        assert!(second.success);
        assert_eq!(first.capture_id.as_deref(), Some("CAP-1"));

        let stored = store.get_invoice(&invoice.invoice_id).await.unwrap().unwrap();
        assert!(stored.is_paid());
        assert_eq!(stored.payment_details.unwrap().capture_id.as_deref(), Some("CAP-1"));
        assert_eq!(email.send_count(), 1);
    }

    #[tokio::test]
    async fn test_capture_for_other_tenant_is_rejected() {
        let server = MockServer::start().await;
        let (service, _, _) = service(&server).await;

        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders/ORDER-1/capture"))
            .respond_with(ResponseTemplate::new(201).set_body_json(order_json("inv_other", "COMPLETED", Some("COMPLETED"))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/checkout/orders/ORDER-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json("inv_other", "COMPLETED", Some("COMPLETED"))))
            .mount(&server)
            .await;

        let err = service.capture("t2", "ORDER-1", None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
