use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Pending,
    Active,
    Suspended,
}

impl TenantStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TenantStatus::Pending),
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Pending => "pending",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
        }
    }
}

/// The slice of the tenant record that billing reads. Owned by the tenant directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantProfile {
    #[serde(rename = "_id")]
    pub tenant_id: String,
    #[serde(default)]
    pub status: TenantStatus,
    #[serde(default)]
    pub billing_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,
    pub company_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub creator_name: Option<String>,
    pub name: Option<String>,
    pub creator_email: Option<String>,
    pub billing_email: Option<String>,
    pub email: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl TenantProfile {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    /// Company name, then first and last name, then creator name, then name, then the id.
    pub fn display_name(&self) -> String {
        if let Some(company) = non_empty(&self.company_name) {
            return company.to_string();
        }
        let full_name = [non_empty(&self.first_name), non_empty(&self.last_name)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !full_name.is_empty() {
            return full_name;
        }
        non_empty(&self.creator_name)
            .or_else(|| non_empty(&self.name))
            .unwrap_or(&self.tenant_id)
            .to_string()
    }

    /// Address used when registering the tenant as a provider customer.
    pub fn customer_email(&self) -> Option<&str> {
        non_empty(&self.creator_email)
            .or_else(|| non_empty(&self.billing_email))
            .or_else(|| non_empty(&self.email))
    }

    /// Address that receives invoices and payment notices.
    pub fn billing_contact_email(&self) -> Option<&str> {
        non_empty(&self.billing_email)
            .or_else(|| non_empty(&self.creator_email))
            .or_else(|| non_empty(&self.email))
    }

    pub fn address_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(street) = non_empty(&self.street) {
            lines.push(street.to_string());
        }
        let city_line = [non_empty(&self.postal_code), non_empty(&self.city)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !city_line.is_empty() {
            lines.push(city_line);
        }
        if let Some(country) = non_empty(&self.country) {
            lines.push(country.to_string());
        }
        lines
    }
}
