// Authentication types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Access token minted by a token exchange.
///
/// Never mutated after creation; a refresh replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Lifetime the server stated when the token was minted
    pub expires_in: i64,
    /// Unix time at which the token stops being valid
    pub expiration: i64,
}

impl Token {
    /// Token whose only expiry information is its lifetime, counted from now
    pub fn expiring_in(access_token: impl Into<String>, expires_in: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_in,
            expiration: Utc::now().timestamp() + expires_in,
        }
    }

    /// Usable when `now + margin` is still strictly before expiration
    pub fn is_usable_at(&self, now: i64, safety_margin: i64) -> bool {
        now.saturating_add(safety_margin) < self.expiration
    }

    pub fn is_usable(&self, safety_margin: i64) -> bool {
        self.is_usable_at(Utc::now().timestamp(), safety_margin)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expiration, 0).single()
    }

    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        let token_type = if self.token_type.is_empty() {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{} {}", token_type, self.access_token)
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// API-key exchange response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyTokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
}

impl ApiKeyTokenResponse {
    /// Convert into a [`Token`]. The server's absolute `expiration` wins when
    /// present; otherwise it is `received_at + expires_in`.
    pub fn into_token(self, received_at: i64) -> Token {
        let expiration = self
            .expiration
            .unwrap_or_else(|| received_at.saturating_add(self.expires_in));

        Token {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            expires_in: self.expires_in,
            expiration,
        }
    }
}

/// Password exchange (`validateAuth`) response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Per-authenticator settings read at the start of every exchange
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExchangeSettings {
    /// Extra headers sent on the exchange call itself
    pub headers: BTreeMap<String, String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub disable_ssl_verification: bool,
}

impl fmt::Debug for ExchangeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeSettings")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("disable_ssl_verification", &self.disable_ssl_verification)
            .finish()
    }
}

/// Mutable exchange configuration shared between an authenticator and its
/// token source. Writes take effect on the next fetch; a fetch already in
/// flight keeps the snapshot it started with.
#[derive(Debug, Default)]
pub struct ExchangeOptions {
    settings: RwLock<ExchangeSettings>,
}

impl ExchangeOptions {
    pub fn new(settings: ExchangeSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> ExchangeSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_headers(&self, headers: BTreeMap<String, String>) {
        self.update(|s| s.headers = headers);
    }

    pub fn set_client_credentials(&self, client_id: String, client_secret: String) {
        self.update(|s| {
            s.client_id = Some(client_id);
            s.client_secret = Some(client_secret);
        });
    }

    pub fn set_disable_ssl_verification(&self, disable: bool) {
        if disable {
            tracing::warn!("TLS certificate verification disabled for token exchange");
        }
        self.update(|s| s.disable_ssl_verification = disable);
    }

    fn update(&self, f: impl FnOnce(&mut ExchangeSettings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings);
    }
}
