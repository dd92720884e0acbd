//! Domain models for tenant billing.

pub mod account;
pub mod connect;
pub mod invoice;
pub mod member;
pub mod metadata;
pub mod provider;
pub mod report;
pub mod tenant;
pub mod webhook;

pub use account::{
    CustomerProvider, MandateStatus, PaymentMethodInfo, ProviderCustomerIds, StripeSubscriptionState,
    SubscriptionStatus, TenantBillingAccount,
};
pub use connect::{ConnectStatus, MollieConnectAccount};
pub use invoice::{
    BillingPeriod, Estimate, Invoice, InvoicePaymentStatus, InvoiceStatus, PaymentDetails,
    TransitionError, UsageBreakdown,
};
pub use member::{MemberMandateStatus, MemberSubscription, MemberSubscriptionView, MembershipStatus};
pub use metadata::{MetadataError, PaymentMetadata, PaymentPurpose, METADATA_VERSION};
pub use provider::{PaymentStatus, ProviderKind};
pub use report::{BillingReport, TenantBillingResult, TenantOutcome};
pub use tenant::{TenantProfile, TenantStatus};
pub use webhook::{RawWebhookEvent, WebhookOutcome};

use rust_decimal::Decimal;

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
}

/// Render an amount with exactly two decimals, as provider APIs expect ("0.01", "32.34").
pub fn format_amount(amount: Decimal) -> String {
    let mut rounded = round_money(amount);
    rounded.rescale(2);
    rounded.to_string()
}
