//! Invoice and billing-period model.

use super::provider::ProviderKind;
use super::round_money;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Usage cost per service key. Ordered so line items render identically every time.
pub type UsageBreakdown = BTreeMap<String, Decimal>;

/// Invoice status. Transitions only move forward: `draft -> open -> {paid | void | uncollectible}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Void | InvoiceStatus::Uncollectible
        )
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        match (self, next) {
            (InvoiceStatus::Draft, InvoiceStatus::Open) => true,
            (InvoiceStatus::Draft | InvoiceStatus::Open, n) => n.is_terminal(),
            _ => false,
        }
    }

    /// Statuses from which a payment confirmation may still be applied.
    pub fn payable() -> [InvoiceStatus; 2] {
        [InvoiceStatus::Draft, InvoiceStatus::Open]
    }
}

/// Provider-side state of the latest charge attempt. The invoice stays open until paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoicePaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invoice cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: InvoiceStatus,
    pub to: InvoiceStatus,
}

/// Calendar month in UTC. `end` is the first instant of the following month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn containing(at: DateTime<Utc>) -> Self {
        let start = NaiveDate::from_ymd_opt(at.year(), at.month(), 1)
            .unwrap_or_default()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let end = start
            .checked_add_months(Months::new(1))
            .unwrap_or(start);
        Self { start, end }
    }

    /// Parse a `YYYY-MM` period tag.
    pub fn from_key(key: &str) -> Option<Self> {
        let (year, month) = key.split_once('-')?;
        let digits = |part: &str, len: usize| part.len() == len && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(year, 4) || !digits(month, 2) {
            return None;
        }
        let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)?;
        Some(Self::containing(date.and_hms_opt(0, 0, 0)?.and_utc()))
    }

    /// `YYYY-MM`, the period tag used for lookups and descriptions.
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.start.year(), self.start.month())
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Last calendar day that belongs to the period.
    pub fn last_day(&self) -> NaiveDate {
        self.end
            .date_naive()
            .pred_opt()
            .unwrap_or_else(|| self.start.date_naive())
    }
}

/// Monthly estimate: base fee plus metered usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub base_fee: Decimal,
    pub usage_breakdown: UsageBreakdown,
    pub estimated_total: Decimal,
    pub period: BillingPeriod,
    /// Set when usage could not be fetched and only the base fee was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Estimate {
    pub fn new(base_fee: Decimal, usage_breakdown: UsageBreakdown, period: BillingPeriod) -> Self {
        let estimated_total = Invoice::total_of(base_fee, &usage_breakdown);
        Self {
            base_fee,
            usage_breakdown,
            estimated_total,
            period,
            warning: None,
        }
    }

    pub fn base_only(base_fee: Decimal, period: BillingPeriod, warning: impl Into<String>) -> Self {
        Self {
            base_fee,
            usage_breakdown: UsageBreakdown::new(),
            estimated_total: round_money(base_fee),
            period,
            warning: Some(warning.into()),
        }
    }
}

/// How a payment was settled, shown on the paid banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub provider: ProviderKind,
    pub payment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub invoice_id: String,
    pub invoice_number: String,
    pub tenant_id: String,
    pub period: BillingPeriod,
    pub base_fee: Decimal,
    #[serde(default)]
    pub usage_breakdown: UsageBreakdown,
    pub amount: Decimal,
    pub currency: String,
    pub status: InvoiceStatus,
    pub payment_method: Option<ProviderKind>,
    pub provider_payment_id: Option<String>,
    pub payment_status: Option<InvoicePaymentStatus>,
    pub payment_error: Option<String>,
    pub payment_details: Option<PaymentDetails>,
    pub pdf_key: Option<String>,
    /// `{tenant_id}:{YYYY-MM}` while the invoice is not void. Uniquely indexed, so it is
    /// left out of the document entirely once cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_lock: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn open(tenant_id: &str, estimate: &Estimate, currency: &str, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let invoice_number = format!(
            "INV-{:04}{:02}-{}",
            estimate.period.start.year(),
            estimate.period.start.month(),
            id[..8].to_uppercase()
        );

        Self {
            invoice_id: format!("inv_{}", id),
            invoice_number,
            tenant_id: tenant_id.to_string(),
            period: estimate.period,
            base_fee: estimate.base_fee,
            usage_breakdown: estimate.usage_breakdown.clone(),
            amount: Self::total_of(estimate.base_fee, &estimate.usage_breakdown),
            currency: currency.to_string(),
            status: InvoiceStatus::Open,
            payment_method: None,
            provider_payment_id: None,
            payment_status: None,
            payment_error: None,
            payment_details: None,
            pdf_key: None,
            period_lock: Some(Self::period_lock_for(tenant_id, &estimate.period)),
            created_at: now,
            paid_at: None,
            updated_at: now,
        }
    }

    pub fn period_lock_for(tenant_id: &str, period: &BillingPeriod) -> String {
        format!("{}:{}", tenant_id, period.key())
    }

    /// `base_fee + sum(usage)`, rounded to cents.
    pub fn total_of(base_fee: Decimal, usage: &UsageBreakdown) -> Decimal {
        round_money(base_fee + usage.values().copied().sum::<Decimal>())
    }

    pub fn amount_is_consistent(&self) -> bool {
        self.amount == Self::total_of(self.base_fee, &self.usage_breakdown)
    }

    pub fn is_paid(&self) -> bool {
        self.status == InvoiceStatus::Paid
    }

    fn transition(&mut self, to: InvoiceStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// A charge was created at the provider; completion arrives later by webhook.
    pub fn record_charge(&mut self, provider: ProviderKind, payment_id: &str, now: DateTime<Utc>) {
        self.payment_method = Some(provider);
        self.provider_payment_id = Some(payment_id.to_string());
        self.payment_status = Some(InvoicePaymentStatus::Pending);
        self.payment_error = None;
        self.updated_at = now;
    }

    pub fn mark_paid(&mut self, details: PaymentDetails, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(InvoiceStatus::Paid, now)?;
        self.payment_method = Some(details.provider);
        self.provider_payment_id = Some(details.payment_id.clone());
        self.payment_status = Some(InvoicePaymentStatus::Paid);
        self.payment_error = None;
        self.payment_details = Some(details);
        self.paid_at = Some(now);
        Ok(())
    }

    /// Failed charge attempt. The invoice stays open so it can be charged again.
    pub fn record_failure(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != InvoiceStatus::Open {
            return Err(TransitionError {
                from: self.status,
                to: InvoiceStatus::Open,
            });
        }
        self.payment_status = Some(InvoicePaymentStatus::Failed);
        self.payment_error = Some(reason.to_string());
        self.updated_at = now;
        Ok(())
    }

    pub fn void(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(InvoiceStatus::Void, now)?;
        self.period_lock = None;
        Ok(())
    }

    pub fn mark_uncollectible(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(InvoiceStatus::Uncollectible, now)
    }

    /// Blob key of the rendered PDF. Paid invoices get their own artifact.
    pub fn artifact_key(&self) -> String {
        if self.is_paid() {
            format!("invoices/{}/{}-paid.pdf", self.tenant_id, self.invoice_number)
        } else {
            format!("invoices/{}/{}.pdf", self.tenant_id, self.invoice_number)
        }
    }

    pub fn download_filename(&self) -> String {
        format!("Rechnung_{}.pdf", self.invoice_number)
    }
}
