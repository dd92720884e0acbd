//! OAuth client for Mollie Connect.

use super::{decode, read_json, CredentialCache, ProviderError};
use crate::models::ProviderKind;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Arc;

/// Permissions requested from a creator's Mollie organization.
pub const CONNECT_SCOPES: &[&str] = &[
    "payments.read",
    "payments.write",
    "customers.read",
    "customers.write",
    "mandates.read",
    "mandates.write",
    "subscriptions.read",
    "subscriptions.write",
    "profiles.read",
    "organizations.read",
];

#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Clone)]
pub struct MollieOAuthClient {
    client: Client,
    authorize_url: String,
    token_url: String,
    redirect_uri: String,
    credentials: Arc<CredentialCache>,
}

impl MollieOAuthClient {
    pub fn new(
        client: Client,
        authorize_url: &str,
        token_url: &str,
        redirect_uri: &str,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            client,
            authorize_url: authorize_url.to_string(),
            token_url: token_url.to_string(),
            redirect_uri: redirect_uri.to_string(),
            credentials,
        }
    }

    pub async fn authorize_url(&self, state: &str) -> Result<String, ProviderError> {
        let credentials = self.credentials.get(ProviderKind::MollieConnect).await?;
        let client_id = credentials.client_id.unwrap_or_default();
        let scope = CONNECT_SCOPES.join(" ");
        let query = serde_urlencoded::to_string([
            ("client_id", client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("state", state),
            ("scope", scope.as_str()),
            ("response_type", "code"),
            ("approval_prompt", "auto"),
        ])
        .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(format!("{}?{}", self.authorize_url, query))
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ProviderError> {
        self.token_request(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ],
            "mollie_connect.exchange_code",
        )
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        self.token_request(
            &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
            "mollie_connect.refresh",
        )
        .await
    }

    /// Codes and refresh tokens are single use, so token requests are never retried here.
    async fn token_request(
        &self,
        form: &[(&str, &str)],
        operation: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let credentials = self.credentials.get(ProviderKind::MollieConnect).await?;
        let client_id = credentials.client_id.clone().unwrap_or_default();

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(client_id, Some(credentials.secret.expose_secret()))
            .form(form)
            .send()
            .await?;
        let result = read_json(ProviderKind::MollieConnect, operation, response).await;
        if matches!(&result, Err(e) if e.is_auth_failure()) {
            self.credentials.invalidate(ProviderKind::MollieConnect);
        }
        decode(result?)
    }
}
