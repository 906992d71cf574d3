// Token exchange logic
// One network round trip per fetch; retry policy lives in the token manager

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::jwt;
use super::types::{
    ApiKeyTokenResponse, ExchangeOptions, ExchangeSettings, PasswordTokenResponse, Token,
};
use crate::error::TokenError;

/// Default API-key exchange endpoint
pub const DEFAULT_API_KEY_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

const API_KEY_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/// Appended to the service URL for username/password exchange
pub const PASSWORD_AUTH_PATH: &str = "/v1/preauth/validateAuth";

const EXCHANGE_TIMEOUT_SECS: u64 = 30;

/// Exchanges a long-lived secret for a short-lived [`Token`]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Token, TokenError>;
}

/// Build a client honouring the TLS toggle of this fetch's settings
fn build_client(settings: &ExchangeSettings) -> Result<Client, TokenError> {
    Client::builder()
        .timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
        .danger_accept_invalid_certs(settings.disable_ssl_verification)
        .build()
        .map_err(|e| TokenError::Request(format!("Failed to create HTTP client: {}", e)))
}

fn with_exchange_headers(mut builder: RequestBuilder, settings: &ExchangeSettings) -> RequestBuilder {
    for (name, value) in &settings.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Send, reject non-2xx, and decode the JSON body
async fn send_exchange<T: DeserializeOwned>(
    builder: RequestBuilder,
    flavor: &str,
) -> Result<T, TokenError> {
    let response: Response = builder.send().await.map_err(|e| {
        tracing::warn!(error = %e, "{} token request failed", flavor);
        TokenError::Request(e.to_string())
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %body,
            "{} token exchange rejected",
            flavor
        );
        return Err(TokenError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| TokenError::Request(format!("Failed to read token response: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Decode(format!("{} token response: {}", flavor, e)))
}

/// API-key exchange: form POST, JSON response with `expires_in`/`expiration`
pub struct ApiKeyTokenSource {
    api_key: String,
    url: String,
    options: Arc<ExchangeOptions>,
}

impl ApiKeyTokenSource {
    pub fn new(api_key: impl Into<String>, url: impl Into<String>, options: Arc<ExchangeOptions>) -> Self {
        Self {
            api_key: api_key.into(),
            url: url.into(),
            options,
        }
    }
}

impl fmt::Debug for ApiKeyTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyTokenSource")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenSource for ApiKeyTokenSource {
    async fn fetch_token(&self) -> Result<Token, TokenError> {
        let settings = self.options.snapshot();
        tracing::info!(url = %self.url, "Requesting access token via API key exchange...");

        let client = build_client(&settings)?;

        let form = [
            ("grant_type", API_KEY_GRANT_TYPE),
            ("apikey", self.api_key.as_str()),
            ("response_type", "cloud_iam"),
        ];

        let mut builder = client
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&form);

        if let (Some(client_id), Some(client_secret)) = (&settings.client_id, &settings.client_secret) {
            builder = builder.basic_auth(client_id, Some(client_secret));
        }

        let builder = with_exchange_headers(builder, &settings);
        let data: ApiKeyTokenResponse = send_exchange(builder, "API key").await?;

        if data.access_token.is_empty() {
            return Err(TokenError::Decode(
                "API key token response does not contain access_token".to_string(),
            ));
        }

        let token = data.into_token(Utc::now().timestamp());

        tracing::info!(
            expires_in = token.expires_in,
            expiration = token.expiration,
            "Access token obtained via API key exchange"
        );

        Ok(token)
    }
}

/// Username/password exchange; expiry comes from the JWT's own `exp` claim
pub struct PasswordTokenSource {
    username: String,
    password: String,
    url: String,
    options: Arc<ExchangeOptions>,
}

impl PasswordTokenSource {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        url: impl Into<String>,
        options: Arc<ExchangeOptions>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            url: url.into(),
            options,
        }
    }

    fn auth_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), PASSWORD_AUTH_PATH)
    }
}

impl fmt::Debug for PasswordTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordTokenSource")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenSource for PasswordTokenSource {
    async fn fetch_token(&self) -> Result<Token, TokenError> {
        let settings = self.options.snapshot();
        let url = self.auth_url();
        tracing::info!(url = %url, username = %self.username, "Requesting access token via password exchange...");

        let client = build_client(&settings)?;

        let builder = client
            .get(&url)
            .header(ACCEPT, "application/json")
            .basic_auth(&self.username, Some(&self.password));

        let builder = with_exchange_headers(builder, &settings);
        let data: PasswordTokenResponse = send_exchange(builder, "Password").await?;

        if data.access_token.is_empty() {
            return Err(TokenError::Decode(
                "Password token response does not contain accessToken".to_string(),
            ));
        }

        let expiration = jwt::token_expiration(&data.access_token)?;
        let expires_in = (expiration - Utc::now().timestamp()).max(0);

        tracing::info!(expiration, "Access token obtained via password exchange");

        Ok(Token {
            access_token: data.access_token,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_in,
            expiration,
        })
    }
}
