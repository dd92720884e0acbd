//! Per-tenant billing account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mandate lifecycle: `none -> pending -> active -> revoked`, `pending -> none` on a failed setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MandateStatus {
    #[default]
    None,
    Pending,
    Active,
    Revoked,
    Expired,
}

impl MandateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MandateStatus::None => "none",
            MandateStatus::Pending => "pending",
            MandateStatus::Active => "active",
            MandateStatus::Revoked => "revoked",
            MandateStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending" => MandateStatus::Pending,
            "active" | "valid" => MandateStatus::Active,
            "revoked" => MandateStatus::Revoked,
            "expired" => MandateStatus::Expired,
            _ => MandateStatus::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCustomerIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mollie: Option<String>,
}

/// Provider whose customer id an account stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerProvider {
    Stripe,
    Mollie,
}

impl CustomerProvider {
    /// Document path of the id inside the account.
    pub fn field(&self) -> &'static str {
        match self {
            CustomerProvider::Stripe => "provider_customer_ids.stripe",
            CustomerProvider::Mollie => "provider_customer_ids.mollie",
        }
    }
}

impl ProviderCustomerIds {
    pub fn get(&self, provider: CustomerProvider) -> Option<&str> {
        match provider {
            CustomerProvider::Stripe => self.stripe.as_deref(),
            CustomerProvider::Mollie => self.mollie.as_deref(),
        }
    }

    pub fn set(&mut self, provider: CustomerProvider, customer_id: &str) {
        let slot = match provider {
            CustomerProvider::Stripe => &mut self.stripe,
            CustomerProvider::Mollie => &mut self.mollie,
        };
        *slot = Some(customer_id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodInfo {
    /// Provider id of the stored method (`pm_…` at Stripe).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
}

/// Platform subscription held at Stripe, as last reported by Stripe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeSubscriptionState {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// One record per tenant. Never deleted; only revoked or cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantBillingAccount {
    #[serde(rename = "_id")]
    pub tenant_id: String,
    #[serde(default)]
    pub provider_customer_ids: ProviderCustomerIds,
    pub mandate_id: Option<String>,
    #[serde(default)]
    pub mandate_status: MandateStatus,
    #[serde(default)]
    pub subscription_status: SubscriptionStatus,
    pub payment_method: Option<PaymentMethodInfo>,
    #[serde(default)]
    pub stripe_subscription: Option<StripeSubscriptionState>,
    /// Verification payment issued by the last mandate setup.
    pub setup_payment_id: Option<String>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub subscription_activated_at: Option<DateTime<Utc>>,
    pub subscription_cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantBillingAccount {
    pub fn new(tenant_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            provider_customer_ids: ProviderCustomerIds::default(),
            mandate_id: None,
            mandate_status: MandateStatus::None,
            subscription_status: SubscriptionStatus::Inactive,
            payment_method: None,
            stripe_subscription: None,
            setup_payment_id: None,
            last_payment_at: None,
            subscription_activated_at: None,
            subscription_cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Drop the stored payment method when it is `payment_method_id`.
    pub fn clear_payment_method(&mut self, payment_method_id: &str, now: DateTime<Utc>) -> bool {
        let matches = self
            .payment_method
            .as_ref()
            .is_some_and(|m| m.id.as_deref() == Some(payment_method_id));
        if matches {
            self.payment_method = None;
            self.updated_at = now;
        }
        matches
    }

    pub fn has_active_mandate(&self) -> bool {
        self.mandate_status == MandateStatus::Active && self.mandate_id.is_some()
    }

    /// Record a fresh verification payment. Any mandate held locally is dropped, since a new
    /// setup only starts once the provider reports no valid mandate.
    pub fn begin_mandate_setup(&mut self, setup_payment_id: &str, now: DateTime<Utc>) {
        self.mandate_id = None;
        self.mandate_status = MandateStatus::Pending;
        self.setup_payment_id = Some(setup_payment_id.to_string());
        if self.subscription_status == SubscriptionStatus::Active {
            self.subscription_status = SubscriptionStatus::Inactive;
        }
        self.updated_at = now;
    }

    /// Confirmed verification payment: the mandate and the subscription become active together.
    pub fn activate_mandate(&mut self, mandate_id: &str, now: DateTime<Utc>) {
        self.mandate_id = Some(mandate_id.to_string());
        self.mandate_status = MandateStatus::Active;
        self.subscription_status = SubscriptionStatus::Active;
        self.subscription_activated_at = Some(now);
        self.subscription_cancelled_at = None;
        self.last_payment_at = Some(now);
        self.updated_at = now;
    }

    /// Adopt a mandate that the provider already reports as valid.
    pub fn adopt_mandate(&mut self, mandate_id: &str, now: DateTime<Utc>) {
        self.mandate_id = Some(mandate_id.to_string());
        self.mandate_status = MandateStatus::Active;
        self.updated_at = now;
    }

    pub fn mandate_setup_failed(&mut self, now: DateTime<Utc>) {
        if self.mandate_status == MandateStatus::Pending {
            self.mandate_status = MandateStatus::None;
            self.setup_payment_id = None;
        }
        self.subscription_status = SubscriptionStatus::Inactive;
        self.updated_at = now;
    }

    /// A recurring payment went through. The subscription follows only an active mandate.
    pub fn record_payment(&mut self, now: DateTime<Utc>) {
        self.last_payment_at = Some(now);
        if self.mandate_status == MandateStatus::Active
            && self.subscription_status != SubscriptionStatus::Active
        {
            self.subscription_status = SubscriptionStatus::Active;
            self.subscription_activated_at = Some(now);
        }
        self.updated_at = now;
    }

    /// A single failed charge suspends the subscription but keeps the mandate.
    pub fn record_payment_failure(&mut self, now: DateTime<Utc>) {
        if self.subscription_status == SubscriptionStatus::Active {
            self.subscription_status = SubscriptionStatus::Inactive;
        }
        self.updated_at = now;
    }

    pub fn revoke(&mut self, now: DateTime<Utc>) {
        self.mandate_status = MandateStatus::Revoked;
        self.mandate_id = None;
        self.setup_payment_id = None;
        self.subscription_status = SubscriptionStatus::Cancelled;
        self.subscription_cancelled_at = Some(now);
        self.updated_at = now;
    }

    /// `subscription_status == Active` implies `mandate_status == Active`, and a revoked
    /// mandate always carries a cancelled subscription.
    pub fn is_consistent(&self) -> bool {
        let active_needs_mandate = self.subscription_status != SubscriptionStatus::Active
            || self.mandate_status == MandateStatus::Active;
        let revoked_is_cancelled = self.mandate_status != MandateStatus::Revoked
            || self.subscription_status == SubscriptionStatus::Cancelled;
        active_needs_mandate && revoked_is_cancelled
    }
}
