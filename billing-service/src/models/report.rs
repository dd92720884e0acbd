use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantBillingResult {
    pub tenant_id: String,
    pub outcome: TenantOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TenantBillingResult {
    pub fn skipped(tenant_id: &str, reason: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            outcome: TenantOutcome::Skipped,
            invoice_id: None,
            payment_id: None,
            amount: None,
            reason: Some(reason.into()),
        }
    }

    pub fn failed(tenant_id: &str, invoice_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            outcome: TenantOutcome::Failed,
            invoice_id,
            payment_id: None,
            amount: None,
            reason: Some(reason.into()),
        }
    }

    pub fn charged(tenant_id: &str, invoice_id: &str, payment_id: &str, amount: Decimal) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            outcome: TenantOutcome::Success,
            invoice_id: Some(invoice_id.to_string()),
            payment_id: Some(payment_id.to_string()),
            amount: Some(amount),
            reason: None,
        }
    }
}

/// Summary of one monthly billing run. `processed == success + failed + skipped`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingReport {
    pub processed: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
    pub details: Vec<TenantBillingResult>,
}

impl BillingReport {
    pub fn record(&mut self, result: TenantBillingResult) {
        self.processed += 1;
        match result.outcome {
            TenantOutcome::Success => self.success += 1,
            TenantOutcome::Failed => self.failed += 1,
            TenantOutcome::Skipped => self.skipped += 1,
        }
        self.details.push(result);
    }

    pub fn is_balanced(&self) -> bool {
        self.processed == self.success + self.failed + self.skipped
            && self.processed as usize == self.details.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let mut report = BillingReport::default();
        report.record(TenantBillingResult::charged("t1", "inv_1", "tr_1", Decimal::from(30)));
        report.record(TenantBillingResult::failed("t2", None, "provider unavailable"));
        report.record(TenantBillingResult::skipped("t3", "zero amount"));

        assert_eq!(report.processed, 3);
        assert_eq!((report.success, report.failed, report.skipped), (1, 1, 1));
        assert!(report.is_balanced());
    }
}
