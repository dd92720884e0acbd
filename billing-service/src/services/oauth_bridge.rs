//! Mollie Connect: OAuth onboarding of a creator's own Mollie organization and
//! delegated access tokens for member billing.

use crate::config::{BillingSettings, MollieConnectConfig};
use crate::error::BillingError;
use crate::models::{ConnectStatus, MollieConnectAccount};
use crate::providers::mollie::{ConnectedMollie, MollieProfile};
use crate::providers::mollie_connect::TokenResponse;
use crate::providers::{MollieApi, MollieOAuthClient};
use crate::services::keyed_lock::KeyedLocks;
use crate::store::BillingStore;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::utils::{hmac_sha256_hex, verify_hmac_sha256_hex};
use std::sync::Arc;

/// Payload carried through the OAuth round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectState {
    pub tenant_id: String,
    pub redirect_url: String,
    pub issued_at: i64,
}

/// Signs and checks `base64url(json).hexhmac` state tokens.
#[derive(Clone)]
pub struct StateCodec {
    secret: Secret<String>,
    max_age_secs: i64,
}

impl StateCodec {
    pub fn new(secret: Secret<String>, max_age_secs: i64) -> Self {
        Self { secret, max_age_secs }
    }

    pub fn encode(&self, state: &ConnectState) -> Result<String, BillingError> {
        let json = serde_json::to_vec(state).map_err(|e| BillingError::Internal(e.into()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = hmac_sha256_hex(self.secret.expose_secret().as_bytes(), payload.as_bytes())?;
        Ok(format!("{}.{}", payload, signature))
    }

    pub fn decode(&self, token: &str, now: DateTime<Utc>) -> Result<ConnectState, BillingError> {
        let invalid = || BillingError::Validation("Ungültiger OAuth-Status".to_string());
        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;

        let valid = verify_hmac_sha256_hex(
            self.secret.expose_secret().as_bytes(),
            payload.as_bytes(),
            signature,
        )
        .unwrap_or(false);
        if !valid {
            tracing::warn!("OAuth state signature mismatch");
            return Err(invalid());
        }

        let json = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let state: ConnectState = serde_json::from_slice(&json).map_err(|_| invalid())?;
        if now.timestamp() - state.issued_at > self.max_age_secs {
            return Err(BillingError::Validation("OAuth-Status abgelaufen".to_string()));
        }
        Ok(state)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeUrl {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub success: bool,
    pub tenant_id: String,
    pub organization_id: String,
    pub organization_name: Option<String>,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectStatusView {
    pub connected: bool,
    pub needs_reconnect: bool,
    pub organization_name: Option<String>,
    pub profile_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Verified first, then unverified, then whatever comes first.
fn choose_profile(profiles: &[MollieProfile]) -> Option<&MollieProfile> {
    let with_status = |wanted: &str| {
        profiles
            .iter()
            .find(|p| p.status.as_deref() == Some(wanted))
    };
    with_status("verified")
        .or_else(|| with_status("unverified"))
        .or_else(|| profiles.first())
}

#[derive(Clone)]
pub struct ConnectBridge {
    store: Arc<dyn BillingStore>,
    oauth: MollieOAuthClient,
    api: MollieApi,
    states: StateCodec,
    settings: BillingSettings,
    configured: bool,
    refresh_locks: Arc<KeyedLocks>,
}

impl ConnectBridge {
    pub fn new(
        store: Arc<dyn BillingStore>,
        oauth: MollieOAuthClient,
        api: MollieApi,
        config: &MollieConnectConfig,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            oauth,
            api,
            states: StateCodec::new(config.state_secret.clone(), config.state_max_age_secs),
            settings,
            configured: config.is_configured(),
            refresh_locks: Arc::new(KeyedLocks::new()),
        }
    }

    fn ensure_configured(&self) -> Result<(), BillingError> {
        if !self.configured {
            return Err(BillingError::Configuration(
                "Mollie Connect is not configured".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn build_authorize_url(
        &self,
        tenant_id: &str,
        redirect_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeUrl, BillingError> {
        self.ensure_configured()?;
        let state = self.states.encode(&ConnectState {
            tenant_id: tenant_id.to_string(),
            redirect_url: redirect_url
                .map(str::to_string)
                .unwrap_or_else(|| self.settings.tenant_redirect_url(tenant_id)),
            issued_at: now.timestamp(),
        })?;
        let url = self.oauth.authorize_url(&state).await?;
        Ok(AuthorizeUrl { url, state })
    }

    pub async fn handle_callback(
        &self,
        params: &CallbackParams,
        now: DateTime<Utc>,
    ) -> Result<ConnectResult, BillingError> {
        if let Some(error) = &params.error {
            let detail = params.error_description.as_deref().unwrap_or(error);
            tracing::warn!(error = %error, detail = %detail, "Mollie Connect authorization denied");
            return Err(BillingError::Validation(format!("Autorisierung fehlgeschlagen: {}", detail)));
        }
        let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
            return Err(BillingError::Validation("code und state sind erforderlich".to_string()));
        };
        self.exchange_code(code, state, now).await
    }

    /// Trade the authorization code for tokens and persist the connected organization.
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<ConnectResult, BillingError> {
        self.ensure_configured()?;
        let state = self.states.decode(state, now)?;
        let tokens = self.oauth.exchange_code(code).await?;

        let organization = self.api.current_organization(&tokens.access_token).await?;
        let profiles = self.api.list_profiles(&tokens.access_token).await?;
        let profile_id = choose_profile(&profiles).map(|p| p.id.clone());

        let mut account = self
            .store
            .get_connect_account(&state.tenant_id)
            .await?
            .unwrap_or_else(|| MollieConnectAccount {
                tenant_id: state.tenant_id.clone(),
                organization_id: organization.id.clone(),
                organization_name: None,
                access_token: None,
                refresh_token: None,
                expires_at: None,
                profile_id: None,
                status: ConnectStatus::Connected,
                connected_at: now,
                disconnected_at: None,
                updated_at: now,
            });
        account.organization_id = organization.id.clone();
        account.organization_name = organization.name.clone();
        account.profile_id = profile_id;
        account.status = ConnectStatus::Connected;
        account.connected_at = now;
        account.disconnected_at = None;
        account.store_tokens(tokens.access_token, tokens.refresh_token, tokens.expires_in, now);
        self.store.put_connect_account(&account).await?;

        tracing::info!(
            tenant_id = %state.tenant_id,
            organization_id = %organization.id,
            profile_id = ?account.profile_id,
            "Mollie organization connected"
        );
        Ok(ConnectResult {
            success: true,
            tenant_id: state.tenant_id,
            organization_id: organization.id,
            organization_name: organization.name,
            redirect_url: state.redirect_url,
        })
    }

    async fn connected_account(&self, tenant_id: &str) -> Result<MollieConnectAccount, BillingError> {
        self.store
            .get_connect_account(tenant_id)
            .await?
            .filter(|account| account.status == ConnectStatus::Connected)
            .ok_or_else(|| BillingError::NotConnected(tenant_id.to_string()))
    }

    /// A usable access token, refreshed first when it expires within the buffer.
    /// Refreshes for one tenant are serialized; a refresh token that another worker
    /// already rotated is answered by re-reading the stored account once.
    pub async fn get_valid_access_token(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Secret<String>, BillingError> {
        let account = self.connected_account(tenant_id).await?;
        if let (true, Some(token)) = (account.token_is_fresh(now), account.access_token.as_ref()) {
            return Ok(Secret::new(token.clone()));
        }

        let _guard = self.refresh_locks.lock(tenant_id).await;

        // Someone may have refreshed while we waited.
        let mut account = self.connected_account(tenant_id).await?;
        if let (true, Some(token)) = (account.token_is_fresh(now), account.access_token.as_ref()) {
            return Ok(Secret::new(token.clone()));
        }

        let refresh_token = account
            .refresh_token
            .clone()
            .ok_or_else(|| BillingError::NotConnected(tenant_id.to_string()))?;

        let tokens = match self.oauth.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) if e.is_invalid_grant() => {
                tracing::warn!(tenant_id = %tenant_id, "Refresh token already rotated, re-reading account");
                return self.reread_after_rotation(tenant_id, &refresh_token, now).await;
            }
            Err(e) => return Err(e.into()),
        };

        self.store_refreshed(&mut account, tokens, now).await?;
        tracing::info!(tenant_id = %tenant_id, expires_at = ?account.expires_at, "Mollie Connect token refreshed");
        account
            .access_token
            .map(Secret::new)
            .ok_or_else(|| BillingError::NotConnected(tenant_id.to_string()))
    }

    async fn reread_after_rotation(
        &self,
        tenant_id: &str,
        used_refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Secret<String>, BillingError> {
        let mut account = self.connected_account(tenant_id).await?;
        if let (true, Some(token)) = (account.token_is_fresh(now), account.access_token.as_ref()) {
            return Ok(Secret::new(token.clone()));
        }
        match account.refresh_token.clone() {
            Some(rotated) if rotated != used_refresh_token => {
                let tokens = self.oauth.refresh(&rotated).await?;
                self.store_refreshed(&mut account, tokens, now).await?;
                account
                    .access_token
                    .map(Secret::new)
                    .ok_or_else(|| BillingError::NotConnected(tenant_id.to_string()))
            }
            _ => Err(BillingError::NotConnected(tenant_id.to_string())),
        }
    }

    async fn store_refreshed(
        &self,
        account: &mut MollieConnectAccount,
        tokens: TokenResponse,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        account.store_tokens(tokens.access_token, tokens.refresh_token, tokens.expires_in, now);
        self.store.put_connect_account(account).await?;
        Ok(())
    }

    /// Client for the tenant's organization with a fresh token.
    pub async fn connected_client(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<ConnectedMollie, BillingError> {
        let token = self.get_valid_access_token(tenant_id, now).await?;
        let profile_id = self.connected_account(tenant_id).await?.profile_id;
        Ok(ConnectedMollie::new(self.api.clone(), token, profile_id))
    }

    /// Drops the tokens. Member subscriptions keep running at Mollie.
    pub async fn disconnect(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), BillingError> {
        let Some(mut account) = self.store.get_connect_account(tenant_id).await? else {
            return Err(BillingError::NotConnected(tenant_id.to_string()));
        };
        account.disconnect(now);
        self.store.put_connect_account(&account).await?;
        tracing::info!(tenant_id = %tenant_id, "Mollie organization disconnected");
        Ok(())
    }

    pub async fn status(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<ConnectStatusView, BillingError> {
        let Some(account) = self.store.get_connect_account(tenant_id).await? else {
            return Ok(ConnectStatusView {
                connected: false,
                needs_reconnect: false,
                organization_name: None,
                profile_id: None,
                connected_at: None,
            });
        };
        let usable = account.is_connected() && (account.token_is_fresh(now) || account.can_refresh());
        Ok(ConnectStatusView {
            connected: usable,
            needs_reconnect: account.status == ConnectStatus::Connected && !usable,
            organization_name: account.organization_name,
            profile_id: account.profile_id,
            connected_at: Some(account.connected_at),
        })
    }

    /// Tenants whose organization is currently connected.
    pub async fn connected_tenants(&self) -> Result<Vec<String>, BillingError> {
        Ok(self
            .store
            .list_connected_accounts()
            .await?
            .into_iter()
            .map(|account| account.tenant_id)
            .collect())
    }
}
