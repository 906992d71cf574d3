// Authentication module
// Credential strategies, token lifecycle and credential discovery

mod authenticator;
mod credentials;
mod jwt;
mod manager;
mod refresh;
mod types;

pub use authenticator::{ApiKeyExchange, Authenticator, CredentialStrategy, PasswordExchange};
pub use credentials::{
    authenticator_from_credentials, discover_credentials, get_authenticator, service_url,
    service_url_from, strategy_from_credentials, AuthType, CredentialMap, CredentialSources,
    CREDENTIALS_FILE_ENV, CREDENTIALS_FILE_NAME, VCAP_SERVICES_ENV,
};
pub use jwt::token_expiration;
pub use manager::{TokenManager, DEFAULT_SAFETY_MARGIN_SECS};
pub use refresh::{
    ApiKeyTokenSource, PasswordTokenSource, TokenSource, DEFAULT_API_KEY_TOKEN_URL,
    PASSWORD_AUTH_PATH,
};
pub use types::{
    ApiKeyTokenResponse, ExchangeOptions, ExchangeSettings, PasswordTokenResponse, Token,
};
