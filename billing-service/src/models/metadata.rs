//! Typed metadata attached to provider payments.
//!
//! Providers hand metadata back verbatim, so every payment carries a versioned record
//! that identifies the tenant and what the payment was for. Records are validated on read.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    MandateSetup,
    MonthlyBilling,
    InvoicePayment,
    MembershipSubscriber,
    MemberMandateSetup,
    MemberSubscription,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::MandateSetup => "mandate_setup",
            PaymentPurpose::MonthlyBilling => "monthly_billing",
            PaymentPurpose::InvoicePayment => "invoice_payment",
            PaymentPurpose::MembershipSubscriber => "membership_subscriber",
            PaymentPurpose::MemberMandateSetup => "member_mandate_setup",
            PaymentPurpose::MemberSubscription => "member_subscription",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "mandate_setup" => Some(PaymentPurpose::MandateSetup),
            "monthly_billing" => Some(PaymentPurpose::MonthlyBilling),
            "invoice_payment" => Some(PaymentPurpose::InvoicePayment),
            "membership_subscriber" => Some(PaymentPurpose::MembershipSubscriber),
            "member_mandate_setup" => Some(PaymentPurpose::MemberMandateSetup),
            "member_subscription" => Some(PaymentPurpose::MemberSubscription),
            _ => None,
        }
    }

    fn needs_invoice(&self) -> bool {
        matches!(self, PaymentPurpose::MonthlyBilling | PaymentPurpose::InvoicePayment)
    }

    fn needs_member(&self) -> bool {
        matches!(
            self,
            PaymentPurpose::MembershipSubscriber
                | PaymentPurpose::MemberMandateSetup
                | PaymentPurpose::MemberSubscription
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("payment carries no metadata")]
    Missing,

    #[error("metadata is malformed: {0}")]
    Malformed(String),

    #[error("metadata version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error("metadata is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMetadata {
    /// 0 marks records written before versioning.
    #[serde(default)]
    pub version: u32,
    pub tenant_id: String,
    #[serde(alias = "type")]
    pub purpose: PaymentPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
}

impl PaymentMetadata {
    fn with(tenant_id: &str, purpose: PaymentPurpose) -> Self {
        Self {
            version: METADATA_VERSION,
            tenant_id: tenant_id.to_string(),
            purpose,
            invoice_id: None,
            member_id: None,
        }
    }

    pub fn mandate_setup(tenant_id: &str) -> Self {
        Self::with(tenant_id, PaymentPurpose::MandateSetup)
    }

    pub fn monthly_billing(tenant_id: &str, invoice_id: &str) -> Self {
        Self {
            invoice_id: Some(invoice_id.to_string()),
            ..Self::with(tenant_id, PaymentPurpose::MonthlyBilling)
        }
    }

    pub fn invoice_payment(tenant_id: &str, invoice_id: &str) -> Self {
        Self {
            invoice_id: Some(invoice_id.to_string()),
            ..Self::with(tenant_id, PaymentPurpose::InvoicePayment)
        }
    }

    pub fn member(tenant_id: &str, member_id: &str, purpose: PaymentPurpose) -> Self {
        Self {
            member_id: Some(member_id.to_string()),
            ..Self::with(tenant_id, purpose)
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse metadata as returned by a provider. Legacy records stored the JSON as a string.
    pub fn from_value(value: &Value) -> Result<Self, MetadataError> {
        let parsed: PaymentMetadata = match value {
            Value::Null => return Err(MetadataError::Missing),
            Value::String(raw) => serde_json::from_str(raw)
                .map_err(|e| MetadataError::Malformed(e.to_string()))?,
            other => serde_json::from_value(other.clone())
                .map_err(|e| MetadataError::Malformed(e.to_string()))?,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Flat string map, for providers whose metadata only holds string values.
    pub fn to_string_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("version".to_string(), self.version.to_string());
        map.insert("tenantId".to_string(), self.tenant_id.clone());
        map.insert("purpose".to_string(), self.purpose.as_str().to_string());
        if let Some(invoice_id) = &self.invoice_id {
            map.insert("invoiceId".to_string(), invoice_id.clone());
        }
        if let Some(member_id) = &self.member_id {
            map.insert("memberId".to_string(), member_id.clone());
        }
        map
    }

    pub fn from_string_map(map: &HashMap<String, String>) -> Result<Self, MetadataError> {
        if map.is_empty() {
            return Err(MetadataError::Missing);
        }
        let version = match map.get("version") {
            Some(v) => v
                .parse()
                .map_err(|_| MetadataError::Malformed(format!("version '{}'", v)))?,
            None => 0,
        };
        let purpose = map
            .get("purpose")
            .or_else(|| map.get("type"))
            .ok_or(MetadataError::MissingField("purpose"))?;
        let purpose = PaymentPurpose::from_string(purpose)
            .ok_or_else(|| MetadataError::Malformed(format!("purpose '{}'", purpose)))?;

        let parsed = Self {
            version,
            tenant_id: map.get("tenantId").cloned().unwrap_or_default(),
            purpose,
            invoice_id: map.get("invoiceId").cloned(),
            member_id: map.get("memberId").cloned(),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), MetadataError> {
        if self.version > METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion(self.version));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(MetadataError::MissingField("tenantId"));
        }
        if self.purpose.needs_invoice() && self.invoice_id.as_deref().is_none_or(str::is_empty) {
            return Err(MetadataError::MissingField("invoiceId"));
        }
        if self.purpose.needs_member() && self.member_id.as_deref().is_none_or(str::is_empty) {
            return Err(MetadataError::MissingField("memberId"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_current_record() {
        let meta = PaymentMetadata::monthly_billing("t1", "inv_1");
        let parsed = PaymentMetadata::from_value(&meta.to_value()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.version, METADATA_VERSION);
    }

    #[test]
    fn test_parse_legacy_record() {
        let legacy = json!({"tenantId": "t1", "type": "mandate_setup"});
        let parsed = PaymentMetadata::from_value(&legacy).unwrap();
        assert_eq!(parsed.purpose, PaymentPurpose::MandateSetup);
        assert_eq!(parsed.version, 0);

        let as_string = Value::String(legacy.to_string());
        assert_eq!(PaymentMetadata::from_value(&as_string).unwrap(), parsed);
    }

    #[test]
    fn test_rejects_incomplete_records() {
        assert_eq!(
            PaymentMetadata::from_value(&Value::Null),
            Err(MetadataError::Missing)
        );
        assert_eq!(
            PaymentMetadata::from_value(&json!({"tenantId": "t1", "purpose": "monthly_billing"})),
            Err(MetadataError::MissingField("invoiceId"))
        );
        assert_eq!(
            PaymentMetadata::from_value(&json!({"tenantId": "", "purpose": "mandate_setup"})),
            Err(MetadataError::MissingField("tenantId"))
        );
        assert!(matches!(
            PaymentMetadata::from_value(&json!({"tenantId": "t1", "purpose": "refund"})),
            Err(MetadataError::Malformed(_))
        ));
        assert_eq!(
            PaymentMetadata::from_value(&json!({"version": 9, "tenantId": "t1", "purpose": "mandate_setup"})),
            Err(MetadataError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_string_map() {
        let meta = PaymentMetadata::member("t1", "m1", PaymentPurpose::MemberMandateSetup);
        let map = meta.to_string_map();
        assert_eq!(map.get("purpose").map(String::as_str), Some("member_mandate_setup"));
        assert_eq!(PaymentMetadata::from_string_map(&map).unwrap(), meta);
        assert_eq!(
            PaymentMetadata::from_string_map(&HashMap::new()),
            Err(MetadataError::Missing)
        );
    }
}
