//! Member billing on a creator's connected Mollie organization.

use crate::config::BillingSettings;
use crate::error::BillingError;
use crate::models::{
    MemberMandateStatus, MemberSubscription, MemberSubscriptionView, MembershipStatus, PaymentMetadata,
    PaymentPurpose, PaymentStatus, WebhookOutcome,
};
use crate::providers::mollie::{ConnectedMollie, MollieAmount, NewPayment};
use crate::providers::{PaymentProvider, ProviderError, ProviderPayment};
use crate::services::oauth_bridge::ConnectBridge;
use crate::store::BillingStore;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_INTERVAL: &str = "1 month";
const CONNECT_WEBHOOK_PATH: &str = "/billing/mollie/connect/webhook";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberMandateOutcome {
    pub payment_id: String,
    pub checkout_url: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSubscriptionOutcome {
    pub needs_mandate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<MemberSubscription>,
}

/// What a creator asks for when subscribing a member.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub customer_id: Option<String>,
    pub amount: Decimal,
    pub interval: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct MemberService {
    store: Arc<dyn BillingStore>,
    bridge: ConnectBridge,
    settings: BillingSettings,
}

impl MemberService {
    pub fn new(store: Arc<dyn BillingStore>, bridge: ConnectBridge, settings: BillingSettings) -> Self {
        Self { store, bridge, settings }
    }

    async fn member(&self, tenant_id: &str, member_id: &str) -> Result<MemberSubscription, BillingError> {
        self.store
            .get_member(tenant_id, member_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Mitglied {} nicht gefunden", member_id)))
    }

    /// Load the member and check a caller-supplied customer id against the stored one.
    async fn member_with_customer(
        &self,
        tenant_id: &str,
        member_id: &str,
        customer_id: Option<&str>,
    ) -> Result<MemberSubscription, BillingError> {
        let member = self.member(tenant_id, member_id).await?;
        check_customer(&member, customer_id)?;
        Ok(member)
    }

    /// Get or create the member's customer on the creator's organization.
    pub async fn create_customer(
        &self,
        tenant_id: &str,
        member_id: &str,
        name: &str,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MemberSubscription, BillingError> {
        if let Some(existing) = self.store.get_member(tenant_id, member_id).await? {
            return Ok(existing);
        }
        let email = email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| BillingError::Validation("E-Mail-Adresse des Mitglieds fehlt".to_string()))?;

        let client = self.bridge.connected_client(tenant_id, now).await?;
        let customer = client
            .create_customer(
                name,
                email,
                &PaymentMetadata::member(tenant_id, member_id, PaymentPurpose::MembershipSubscriber),
            )
            .await?;

        let mut member = MemberSubscription::new(tenant_id, member_id, &customer.id, Some(email.to_string()), now);
        member.name = Some(name.to_string());
        self.store.put_member(&member).await?;
        tracing::info!(tenant_id = %tenant_id, member_id = %member_id, customer_id = %customer.id, "Member customer created");
        Ok(member)
    }

    /// First payment that establishes the member's SEPA mandate.
    pub async fn create_mandate(
        &self,
        tenant_id: &str,
        member_id: &str,
        customer_id: Option<&str>,
        amount: Option<Decimal>,
        redirect_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MemberMandateOutcome, BillingError> {
        let mut member = self.member_with_customer(tenant_id, member_id, customer_id).await?;
        let client = self.bridge.connected_client(tenant_id, now).await?;

        let payment = client
            .create_payment(NewPayment {
                amount: MollieAmount::new(
                    &self.settings.currency,
                    amount.unwrap_or(self.settings.verification_amount),
                ),
                description: format!("Mitgliedschaft - Zahlungsmethode einrichten ({})", member_id),
                metadata: PaymentMetadata::member(tenant_id, member_id, PaymentPurpose::MemberMandateSetup),
                customer_id: Some(member.customer_id.clone()),
                mandate_id: None,
                redirect_url: Some(
                    redirect_url
                        .map(str::to_string)
                        .unwrap_or_else(|| self.settings.tenant_redirect_url(tenant_id)),
                ),
                webhook_url: Some(self.settings.public_url(CONNECT_WEBHOOK_PATH)),
                profile_id: None,
                idempotency_key: None,
            })
            .await?;

        member.mandate_payment_id = Some(payment.id.clone());
        member.mandate_status = MemberMandateStatus::Pending;
        member.updated_at = now;
        self.store.put_member(&member).await?;

        Ok(MemberMandateOutcome {
            checkout_url: payment.checkout_url(),
            payment_id: payment.id,
            status: payment.status,
        })
    }

    async fn has_valid_mandate(
        &self,
        client: &ConnectedMollie,
        member: &MemberSubscription,
    ) -> Result<bool, BillingError> {
        if member.mandate_status == MemberMandateStatus::Valid {
            return Ok(true);
        }
        let mandates = client.list_mandates(&member.customer_id).await?;
        Ok(mandates.iter().any(|m| m.is_valid()))
    }

    pub async fn create_subscription(
        &self,
        tenant_id: &str,
        member_id: &str,
        request: &SubscriptionRequest,
        now: DateTime<Utc>,
    ) -> Result<MemberSubscriptionOutcome, BillingError> {
        if request.amount <= Decimal::ZERO {
            return Err(BillingError::Validation("Betrag muss größer als 0 sein".to_string()));
        }
        let mut member = self
            .member_with_customer(tenant_id, member_id, request.customer_id.as_deref())
            .await?;
        let client = self.bridge.connected_client(tenant_id, now).await?;

        if !self.has_valid_mandate(&client, &member).await? {
            return Ok(MemberSubscriptionOutcome {
                needs_mandate: true,
                subscription: None,
            });
        }

        let interval = request.interval.clone().unwrap_or_else(|| DEFAULT_INTERVAL.to_string());
        let body = json!({
            "amount": MollieAmount::new(&self.settings.currency, request.amount),
            "interval": interval,
            "description": request
                .description
                .clone()
                .unwrap_or_else(|| format!("Mitgliedschaft {}", member_id)),
            "webhookUrl": self.settings.public_url(CONNECT_WEBHOOK_PATH),
            "metadata": PaymentMetadata::member(tenant_id, member_id, PaymentPurpose::MemberSubscription).to_value(),
        });
        let subscription = client.create_subscription(&member.customer_id, body).await?;

        member.subscription_id = Some(subscription.id.clone());
        member.amount = Some(request.amount);
        member.interval = Some(interval);
        member.mandate_status = MemberMandateStatus::Valid;
        member.status = MembershipStatus::from_mollie(&subscription.status);
        member.next_payment_date = subscription
            .next_payment_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        member.cancelled_at = None;
        member.updated_at = now;
        self.store.put_member(&member).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            member_id = %member_id,
            subscription_id = %subscription.id,
            "Member subscription created"
        );
        Ok(MemberSubscriptionOutcome {
            needs_mandate: false,
            subscription: Some(member),
        })
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<MemberSubscription>, BillingError> {
        Ok(self.store.list_members(tenant_id).await?)
    }

    /// Members that have a provider subscription, newest first.
    pub async fn subscriptions(&self, tenant_id: &str) -> Result<Vec<MemberSubscriptionView>, BillingError> {
        Ok(self.list(tenant_id).await?.iter().filter_map(MemberSubscription::view).collect())
    }

    /// Cancel by provider subscription id.
    pub async fn cancel_subscription(
        &self,
        tenant_id: &str,
        subscription_id: &str,
        customer_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MemberSubscription, BillingError> {
        let member = self
            .list(tenant_id)
            .await?
            .into_iter()
            .find(|m| m.subscription_id.as_deref() == Some(subscription_id))
            .ok_or_else(|| BillingError::NotFound(format!("Abonnement {} nicht gefunden", subscription_id)))?;
        check_customer(&member, customer_id)?;
        self.cancel(tenant_id, &member.member_id, now).await
    }

    pub async fn cancel(
        &self,
        tenant_id: &str,
        member_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MemberSubscription, BillingError> {
        let mut member = self.member(tenant_id, member_id).await?;
        if let Some(subscription_id) = member.subscription_id.clone() {
            let client = self.bridge.connected_client(tenant_id, now).await?;
            match client.cancel_subscription(&member.customer_id, &subscription_id).await {
                Ok(()) => {}
                // Already cancelled or gone at Mollie.
                Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        member.cancel(now);
        self.store.put_member(&member).await?;
        tracing::info!(tenant_id = %tenant_id, member_id = %member_id, "Member subscription cancelled");
        Ok(member)
    }

    /// Apply a connect webhook for `payment_id`. The payment is always re-fetched with the
    /// owning tenant's token before anything changes.
    pub async fn reconcile_payment(
        &self,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some((member, payment)) = self.resolve(payment_id, now).await? else {
            return Ok(WebhookOutcome::Ignored(format!("no member for payment {}", payment_id)));
        };
        if member.has_applied(payment_id) {
            return Ok(WebhookOutcome::Duplicate);
        }

        let mut updated = member.clone();
        match payment.status {
            PaymentStatus::Succeeded => updated.apply_paid(payment_id, now),
            status if status.is_failure() => updated.apply_failed(payment_id, now),
            _ => return Ok(WebhookOutcome::Ignored(format!("payment {}", payment.provider_status))),
        }

        if !self.store.replace_member_if_payment_new(&updated, payment_id).await? {
            return Ok(WebhookOutcome::Duplicate);
        }
        tracing::info!(
            tenant_id = %updated.tenant_id,
            member_id = %updated.member_id,
            payment_id = %payment_id,
            status = %payment.provider_status,
            "Member payment applied"
        );
        Ok(WebhookOutcome::Applied)
    }

    /// Locate the member behind a payment: by stored mandate payment first, then by scanning
    /// connected tenants for one whose organization knows the payment.
    async fn resolve(
        &self,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(MemberSubscription, ProviderPayment)>, BillingError> {
        if let Some(member) = self.store.find_member_by_mandate_payment(payment_id).await? {
            let client = self.bridge.connected_client(&member.tenant_id, now).await?;
            let payment = client.get_status(payment_id).await?;
            return Ok(Some((member, payment)));
        }

        for tenant_id in self.bridge.connected_tenants().await? {
            let client = match self.bridge.connected_client(&tenant_id, now).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %e, "Skipping tenant without usable token");
                    continue;
                }
            };
            let payment = match client.get_status(payment_id).await {
                Ok(payment) => payment,
                Err(ProviderError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let by_metadata = match &payment.metadata {
                Ok(meta) if meta.tenant_id == tenant_id => match meta.member_id.as_deref() {
                    Some(member_id) => self.store.get_member(&tenant_id, member_id).await?,
                    None => None,
                },
                _ => None,
            };
            let member = match (by_metadata, payment.customer_id.as_deref()) {
                (Some(member), _) => Some(member),
                (None, Some(customer_id)) => self.store.find_member_by_customer(&tenant_id, customer_id).await?,
                (None, None) => None,
            };
            return Ok(member.map(|member| (member, payment)));
        }
        Ok(None)
    }
}

fn check_customer(member: &MemberSubscription, customer_id: Option<&str>) -> Result<(), BillingError> {
    match customer_id {
        Some(id) if id != member.customer_id => Err(BillingError::Validation(format!(
            "Kunde {} gehört nicht zu Mitglied {}",
            id, member.member_id
        ))),
        _ => Ok(()),
    }
}
