use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tokens are refreshed when they expire within this window.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Connected,
    Disconnected,
}

/// A creator's own Mollie organization, reached through delegated OAuth tokens.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct MollieConnectAccount {
    #[serde(rename = "_id")]
    pub tenant_id: String,
    pub organization_id: String,
    pub organization_name: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_id: Option<String>,
    pub status: ConnectStatus,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for MollieConnectAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MollieConnectAccount")
            .field("tenant_id", &self.tenant_id)
            .field("organization_id", &self.organization_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("profile_id", &self.profile_id)
            .field("status", &self.status)
            .finish()
    }
}

impl MollieConnectAccount {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectStatus::Connected && self.access_token.is_some()
    }

    /// True while the access token is usable without a refresh.
    pub fn token_is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => {
                now < expires_at - Duration::seconds(TOKEN_REFRESH_BUFFER_SECS)
            }
            _ => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.status == ConnectStatus::Connected && self.refresh_token.is_some()
    }

    pub fn store_tokens(
        &mut self,
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: i64,
        now: DateTime<Utc>,
    ) {
        self.access_token = Some(access_token);
        // Mollie only sometimes rotates the refresh token.
        if let Some(refresh_token) = refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        self.expires_at = Some(now + Duration::seconds(expires_in_secs));
        self.updated_at = now;
    }

    /// Drop the tokens but keep the organization and history.
    pub fn disconnect(&mut self, now: DateTime<Utc>) {
        self.access_token = None;
        self.refresh_token = None;
        self.expires_at = None;
        self.status = ConnectStatus::Disconnected;
        self.disconnected_at = Some(now);
        self.updated_at = now;
    }
}
