// Credential strategies and the authenticator facade

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::manager::{TokenManager, DEFAULT_SAFETY_MARGIN_SECS};
use super::refresh::{ApiKeyTokenSource, PasswordTokenSource, DEFAULT_API_KEY_TOKEN_URL};
use super::types::{ExchangeOptions, ExchangeSettings, Token};
use crate::error::Result;
use crate::request::{RestRequest, AUTHORIZATION};

/// Settings for exchanging an API key for an access token
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyExchange {
    pub api_key: String,
    pub url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Extra headers sent on the exchange call
    pub headers: BTreeMap<String, String>,
    pub disable_ssl_verification: bool,
}

impl ApiKeyExchange {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: DEFAULT_API_KEY_TOKEN_URL.to_string(),
            client_id: None,
            client_secret: None,
            headers: BTreeMap::new(),
            disable_ssl_verification: false,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_client_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }
}

/// Settings for exchanging a username/password for an access token
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordExchange {
    pub username: String,
    pub password: String,
    /// Service URL; the login path is appended to it
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub disable_ssl_verification: bool,
}

impl PasswordExchange {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            disable_ssl_verification: false,
        }
    }
}

/// How an authenticator proves identity. Fixed for the authenticator's lifetime.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialStrategy {
    NoAuth,
    Basic { username: String, password: String },
    BearerToken { token: String },
    ApiKeyExchange(ApiKeyExchange),
    PasswordExchange(PasswordExchange),
}

impl CredentialStrategy {
    /// Name used in logs and configuration
    pub fn name(&self) -> &'static str {
        match self {
            CredentialStrategy::NoAuth => "noauth",
            CredentialStrategy::Basic { .. } => "basic",
            CredentialStrategy::BearerToken { .. } => "bearerToken",
            CredentialStrategy::ApiKeyExchange(_) => "iam",
            CredentialStrategy::PasswordExchange(_) => "cp4d",
        }
    }

    /// True for strategies that mint short-lived tokens
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            CredentialStrategy::ApiKeyExchange(_) | CredentialStrategy::PasswordExchange(_)
        )
    }
}

impl fmt::Debug for CredentialStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStrategy::NoAuth => f.write_str("NoAuth"),
            CredentialStrategy::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            CredentialStrategy::BearerToken { .. } => f
                .debug_struct("BearerToken")
                .field("token", &"[REDACTED]")
                .finish(),
            CredentialStrategy::ApiKeyExchange(cfg) => f
                .debug_struct("ApiKeyExchange")
                .field("url", &cfg.url)
                .field("client_id", &cfg.client_id)
                .field("api_key", &"[REDACTED]")
                .finish(),
            CredentialStrategy::PasswordExchange(cfg) => f
                .debug_struct("PasswordExchange")
                .field("url", &cfg.url)
                .field("username", &cfg.username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Token cache plus the mutable settings its source reads
struct TokenExchange {
    options: Arc<ExchangeOptions>,
    tokens: TokenManager,
}

/// What `authenticate` does, resolved once from the strategy
enum Scheme {
    Passthrough,
    Static(String),
    Exchange(TokenExchange),
}

/// Stamps outgoing requests with credentials for one strategy
pub struct Authenticator {
    strategy: CredentialStrategy,
    scheme: Scheme,
}

impl Authenticator {
    pub fn new(strategy: CredentialStrategy) -> Self {
        Self::with_safety_margin(strategy, DEFAULT_SAFETY_MARGIN_SECS)
    }

    /// Build with a custom refresh margin (seconds before expiry)
    pub fn with_safety_margin(strategy: CredentialStrategy, safety_margin: i64) -> Self {
        let scheme = match &strategy {
            CredentialStrategy::NoAuth => Scheme::Passthrough,
            CredentialStrategy::Basic { username, password } => {
                Scheme::Static(basic_header(username, password))
            }
            CredentialStrategy::BearerToken { token } => Scheme::Static(format!("Bearer {}", token)),
            CredentialStrategy::ApiKeyExchange(cfg) => {
                let options = Arc::new(ExchangeOptions::new(ExchangeSettings {
                    headers: cfg.headers.clone(),
                    client_id: cfg.client_id.clone(),
                    client_secret: cfg.client_secret.clone(),
                    disable_ssl_verification: cfg.disable_ssl_verification,
                }));
                let source = ApiKeyTokenSource::new(cfg.api_key.clone(), cfg.url.clone(), options.clone());
                Scheme::Exchange(TokenExchange {
                    options,
                    tokens: TokenManager::with_safety_margin(Arc::new(source), safety_margin),
                })
            }
            CredentialStrategy::PasswordExchange(cfg) => {
                let options = Arc::new(ExchangeOptions::new(ExchangeSettings {
                    headers: cfg.headers.clone(),
                    disable_ssl_verification: cfg.disable_ssl_verification,
                    ..ExchangeSettings::default()
                }));
                let source = PasswordTokenSource::new(
                    cfg.username.clone(),
                    cfg.password.clone(),
                    cfg.url.clone(),
                    options.clone(),
                );
                Scheme::Exchange(TokenExchange {
                    options,
                    tokens: TokenManager::with_safety_margin(Arc::new(source), safety_margin),
                })
            }
        };

        tracing::debug!(strategy = strategy.name(), "Authenticator created");
        Self { strategy, scheme }
    }

    pub fn no_auth() -> Self {
        Self::new(CredentialStrategy::NoAuth)
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(CredentialStrategy::Basic {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(CredentialStrategy::BearerToken {
            token: token.into(),
        })
    }

    pub fn api_key(api_key: impl Into<String>) -> Self {
        Self::new(CredentialStrategy::ApiKeyExchange(ApiKeyExchange::new(api_key)))
    }

    pub fn password(
        username: impl Into<String>,
        password: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self::new(CredentialStrategy::PasswordExchange(PasswordExchange::new(
            username, password, url,
        )))
    }

    /// The strategy as constructed. Later `set_*` calls are not reflected
    /// here; see [`exchange_settings`](Self::exchange_settings).
    pub fn strategy(&self) -> &CredentialStrategy {
        &self.strategy
    }

    /// Settings the next token exchange will use, `None` for static strategies
    pub fn exchange_settings(&self) -> Option<ExchangeSettings> {
        match &self.scheme {
            Scheme::Exchange(exchange) => Some(exchange.options.snapshot()),
            _ => None,
        }
    }

    /// Headers sent on the token exchange call (not on business requests).
    /// Applies from the next exchange.
    pub fn set_headers(&self, headers: BTreeMap<String, String>) {
        match &self.scheme {
            Scheme::Exchange(exchange) => exchange.options.set_headers(headers),
            _ => tracing::debug!(strategy = self.strategy.name(), "Exchange headers ignored"),
        }
    }

    /// Client credentials sent as HTTP Basic auth on API-key exchanges.
    /// Applies from the next exchange.
    pub fn set_client_credentials(&self, client_id: impl Into<String>, client_secret: impl Into<String>) {
        match (&self.scheme, &self.strategy) {
            (Scheme::Exchange(exchange), CredentialStrategy::ApiKeyExchange(_)) => exchange
                .options
                .set_client_credentials(client_id.into(), client_secret.into()),
            _ => tracing::debug!(strategy = self.strategy.name(), "Client credentials ignored"),
        }
    }

    /// Stop verifying TLS certificates of the token endpoint. Development use only.
    pub fn disable_ssl_verification(&self) {
        match &self.scheme {
            Scheme::Exchange(exchange) => exchange.options.set_disable_ssl_verification(true),
            _ => tracing::debug!(strategy = self.strategy.name(), "TLS toggle ignored"),
        }
    }

    /// Value for the `Authorization` header, or `None` when no header is sent
    pub async fn authorization_header(&self) -> Result<Option<String>> {
        let (header, _) = self.resolve().await?;
        Ok(header)
    }

    /// Stamp `request` with credentials. Only the header map is touched.
    pub async fn authenticate(&self, request: RestRequest) -> Result<RestRequest> {
        let (request, _) = self.authenticate_tracked(request).await?;
        Ok(request)
    }

    /// Like [`authenticate`](Self::authenticate), also returning the token used
    pub(crate) async fn authenticate_tracked(
        &self,
        mut request: RestRequest,
    ) -> Result<(RestRequest, Option<Token>)> {
        let (header, token) = self.resolve().await?;
        if let Some(header) = header {
            request.set_header(AUTHORIZATION, header);
        }
        Ok((request, token))
    }

    /// Forget `token` after the server rejected it
    pub(crate) async fn invalidate(&self, token: &Token) {
        if let Scheme::Exchange(exchange) = &self.scheme {
            exchange.tokens.invalidate(token).await;
        }
    }

    async fn resolve(&self) -> Result<(Option<String>, Option<Token>)> {
        match &self.scheme {
            Scheme::Passthrough => Ok((None, None)),
            Scheme::Static(header) => Ok((Some(header.clone()), None)),
            Scheme::Exchange(exchange) => {
                let token = exchange.tokens.get_token().await?;
                Ok((Some(token.authorization_header()), Some(token)))
            }
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// `Basic base64(username:password)`
fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}
