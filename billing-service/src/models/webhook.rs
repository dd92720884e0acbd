use super::provider::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What processing a webhook delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A state transition was performed.
    Applied,
    /// The transition had already been applied by an earlier delivery.
    Duplicate,
    /// Nothing to do: pending status, unknown payment, or an irrelevant event.
    Ignored(String),
    Error(String),
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored(_) => "ignored",
            WebhookOutcome::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookOutcome::Ignored(reason) => write!(f, "ignored: {}", reason),
            WebhookOutcome::Error(reason) => write!(f, "error: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Inbound webhook as received, kept for inspection and reprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWebhookEvent {
    #[serde(rename = "_id")]
    pub event_id: String,
    pub provider: ProviderKind,
    pub body: String,
    pub payment_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub outcome: Option<WebhookOutcome>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RawWebhookEvent {
    pub fn received(provider: ProviderKind, body: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id: format!("whe_{}", Uuid::new_v4().simple()),
            provider,
            body: body.into(),
            payment_id: None,
            received_at: now,
            outcome: None,
            processed_at: None,
        }
    }
}
