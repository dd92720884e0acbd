use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Stripe,
    Paypal,
    Mollie,
    MollieConnect,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::Paypal => "paypal",
            ProviderKind::Mollie => "mollie",
            ProviderKind::MollieConnect => "mollie_connect",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(ProviderKind::Stripe),
            "paypal" => Some(ProviderKind::Paypal),
            "mollie" => Some(ProviderKind::Mollie),
            "mollie_connect" => Some(ProviderKind::MollieConnect),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized payment status across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Succeeded,
    Pending,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Mollie payment status. `authorized` is not yet money received and stays pending.
    pub fn from_mollie(status: &str) -> Self {
        match status {
            "paid" => PaymentStatus::Succeeded,
            "failed" | "expired" => PaymentStatus::Failed,
            "canceled" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn from_stripe(status: &str) -> Self {
        match status {
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" => PaymentStatus::Cancelled,
            "requires_payment_method" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn from_paypal(status: &str) -> Self {
        match status {
            "COMPLETED" => PaymentStatus::Succeeded,
            "VOIDED" => PaymentStatus::Cancelled,
            "DECLINED" | "FAILED" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    /// Failures and cancellations are handled the same way by the reconciler.
    pub fn is_failure(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }
}
