use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Most recent payment ids kept for replay detection.
pub const APPLIED_PAYMENT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberMandateStatus {
    #[default]
    None,
    Pending,
    Valid,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    #[default]
    Pending,
    Active,
    PaymentFailed,
    Cancelled,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Pending => "pending",
            MembershipStatus::Active => "active",
            MembershipStatus::PaymentFailed => "payment_failed",
            MembershipStatus::Cancelled => "cancelled",
        }
    }

    /// Mollie subscription status.
    pub fn from_mollie(status: &str) -> Self {
        match status {
            "active" => MembershipStatus::Active,
            "canceled" | "completed" => MembershipStatus::Cancelled,
            "suspended" => MembershipStatus::PaymentFailed,
            _ => MembershipStatus::Pending,
        }
    }
}

/// A member billed by a creator through the creator's connected Mollie account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSubscription {
    /// `{tenant_id}:{member_id}`
    #[serde(rename = "_id")]
    pub id: String,
    pub tenant_id: String,
    pub member_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub email: Option<String>,
    pub subscription_id: Option<String>,
    pub amount: Option<Decimal>,
    pub interval: Option<String>,
    pub status: MembershipStatus,
    pub next_payment_date: Option<NaiveDate>,
    #[serde(default)]
    pub mandate_status: MemberMandateStatus,
    pub mandate_payment_id: Option<String>,
    #[serde(default)]
    pub payment_failures: u32,
    /// Provider payments already applied to this record, oldest first and capped at
    /// [`APPLIED_PAYMENT_HISTORY`].
    #[serde(default)]
    pub applied_payment_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl MemberSubscription {
    pub fn key(tenant_id: &str, member_id: &str) -> String {
        format!("{}:{}", tenant_id, member_id)
    }

    pub fn new(
        tenant_id: &str,
        member_id: &str,
        customer_id: &str,
        email: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::key(tenant_id, member_id),
            tenant_id: tenant_id.to_string(),
            member_id: member_id.to_string(),
            customer_id: customer_id.to_string(),
            name: None,
            email,
            subscription_id: None,
            amount: None,
            interval: None,
            status: MembershipStatus::Pending,
            next_payment_date: None,
            mandate_status: MemberMandateStatus::None,
            mandate_payment_id: None,
            payment_failures: 0,
            applied_payment_ids: Vec::new(),
            created_at: now,
            cancelled_at: None,
            updated_at: now,
        }
    }

    pub fn has_applied(&self, payment_id: &str) -> bool {
        self.applied_payment_ids.iter().any(|id| id == payment_id)
    }

    /// The mandate payment for this member, as opposed to a recurring subscription charge.
    pub fn is_mandate_payment(&self, payment_id: &str) -> bool {
        self.mandate_payment_id.as_deref() == Some(payment_id)
    }

    fn remember_payment(&mut self, payment_id: &str) {
        self.applied_payment_ids.push(payment_id.to_string());
        let overflow = self.applied_payment_ids.len().saturating_sub(APPLIED_PAYMENT_HISTORY);
        self.applied_payment_ids.drain(..overflow);
    }

    /// A late charge on a cancelled membership is recorded but does not reactivate it.
    pub fn apply_paid(&mut self, payment_id: &str, now: DateTime<Utc>) {
        if self.is_mandate_payment(payment_id) {
            self.mandate_status = MemberMandateStatus::Valid;
        } else if self.status != MembershipStatus::Cancelled {
            self.status = MembershipStatus::Active;
            self.payment_failures = 0;
        }
        self.remember_payment(payment_id);
        self.updated_at = now;
    }

    pub fn apply_failed(&mut self, payment_id: &str, now: DateTime<Utc>) {
        if self.is_mandate_payment(payment_id) {
            self.mandate_status = MemberMandateStatus::Failed;
        } else if self.status != MembershipStatus::Cancelled {
            self.status = MembershipStatus::PaymentFailed;
            self.payment_failures += 1;
        }
        self.remember_payment(payment_id);
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = MembershipStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.updated_at = now;
    }

    /// Listing entry, present only once a provider subscription exists.
    pub fn view(&self) -> Option<MemberSubscriptionView> {
        Some(MemberSubscriptionView {
            subscription_id: self.subscription_id.clone()?,
            customer_id: self.customer_id.clone(),
            customer_name: self.name.clone(),
            customer_email: self.email.clone(),
            member_id: self.member_id.clone(),
            amount: self.amount,
            interval: self.interval.clone(),
            status: self.status.as_str(),
            next_payment_date: self.next_payment_date,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSubscriptionView {
    pub subscription_id: String,
    pub customer_id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub member_id: String,
    pub amount: Option<Decimal>,
    pub interval: Option<String>,
    pub status: &'static str,
    pub next_payment_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}
