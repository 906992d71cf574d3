// Error handling module
// Defines the request pipeline and token exchange error types

use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;

/// Errors from building, authenticating, sending, or decoding a request
#[derive(Error, Debug)]
pub enum RestError {
    /// The transport failed before any response was received
    #[error("No response was received from the server: {0}")]
    NoResponse(String),

    /// A response arrived but carried no body where one was required
    #[error("No data was returned by the server")]
    NoData,

    /// The success body could not be decoded into the requested shape
    #[error("Failed to deserialize response: {0}")]
    Serialization(String),

    /// An outgoing header or path component could not be encoded
    #[error("Failed to encode request component: {0}")]
    Encoding(String),

    /// The request URL could not be parsed
    #[error("Malformed URL: {0}")]
    BadUrl(String),

    /// Non-2xx response, with the headers it arrived with
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        metadata: Option<Value>,
        headers: HeaderMap,
    },

    /// A downloaded body could not be written to its destination.
    /// The file may already exist or the disk may be full.
    #[error("Failed to save the downloaded data: {0}")]
    SaveData(String),

    /// A required credential field was absent from discovered configuration
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    /// `auth_type` named a scheme this crate does not implement
    #[error("Unrecognized authentication type: {0}")]
    UnrecognizedAuthType(String),

    /// `auth_type` was present but empty
    #[error("Authentication type is not defined")]
    AuthTypeNotDefined,

    /// No credential source produced anything for the prefix
    #[error("No configuration found for credentials prefix: {0}")]
    NoConfigurationFound(String),

    /// The token exchange behind a dynamic credential strategy failed
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(#[source] TokenError),
}

impl RestError {
    /// Status code of an HTTP error, if this is one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RestError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response headers of an HTTP error, if this is one
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            RestError::Http { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// True when the failure happened before any request reached the network
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RestError::TokenExchangeFailed(_))
    }
}

impl From<TokenError> for RestError {
    fn from(err: TokenError) -> Self {
        RestError::TokenExchangeFailed(err)
    }
}

/// Token source failures.
///
/// `Clone` because a single failed refresh is delivered to every caller
/// that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Network failure talking to the token endpoint
    #[error("Token request failed: {0}")]
    Request(String),

    /// Token endpoint answered with a non-2xx status
    #[error("Token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Token endpoint answered 2xx but the body was unusable
    #[error("Invalid token response: {0}")]
    Decode(String),

    /// The background refresh task died before producing a result
    #[error("Token refresh interrupted: {0}")]
    Interrupted(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, RestError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_messages() {
        let err = RestError::NoData;
        assert_eq!(err.to_string(), "No data was returned by the server");

        let err = RestError::BadUrl("not a url".to_string());
        assert_eq!(err.to_string(), "Malformed URL: not a url");

        let err = RestError::Http {
            status: 404,
            message: "Not Found".to_string(),
            metadata: None,
            headers: HeaderMap::new(),
        };
        assert_eq!(err.to_string(), "HTTP 404: Not Found");
    }

    #[test]
    fn test_configuration_error_messages() {
        let err = RestError::MissingCredential("apikey".to_string());
        assert_eq!(err.to_string(), "Missing credential: apikey");

        let err = RestError::UnrecognizedAuthType("kerberos".to_string());
        assert_eq!(err.to_string(), "Unrecognized authentication type: kerberos");

        let err = RestError::AuthTypeNotDefined;
        assert_eq!(err.to_string(), "Authentication type is not defined");

        let err = RestError::SaveData("/tmp/out.json: File exists".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to save the downloaded data: /tmp/out.json: File exists"
        );
    }

    #[test]
    fn test_status_code() {
        let err = RestError::Http {
            status: 503,
            message: "Service Unavailable".to_string(),
            metadata: Some(json!({"trace": "abc"})),
            headers: HeaderMap::from_iter([(
                reqwest::header::RETRY_AFTER,
                reqwest::header::HeaderValue::from_static("30"),
            )]),
        };
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.headers().unwrap()["retry-after"], "30");
        assert_eq!(RestError::NoData.status_code(), None);
        assert!(RestError::NoData.headers().is_none());
        assert_eq!(RestError::NoResponse("reset".to_string()).status_code(), None);
    }

    #[test]
    fn test_token_error_wrapping() {
        let err: RestError = TokenError::Status {
            status: 400,
            body: "bad apikey".to_string(),
        }
        .into();
        assert!(err.is_auth_failure());
        assert_eq!(
            err.to_string(),
            "Token exchange failed: Token endpoint returned 400: bad apikey"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
