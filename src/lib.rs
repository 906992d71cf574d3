// restauth - library root
// Credential strategies, single-flight token caching and an authenticated request pipeline

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod request;

pub use auth::{Authenticator, CredentialStrategy, Token, TokenManager};
pub use error::{RestError, Result, TokenError};
pub use http_client::{RestClient, RestResponse};
pub use request::RestRequest;
