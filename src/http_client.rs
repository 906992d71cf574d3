// HTTP request pipeline
// Authenticate, send, classify. Retry policy belongs to the caller.

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::auth::Authenticator;
use crate::error::{RestError, Result};
use crate::request::RestRequest;

/// Sent unless the caller sets its own `User-Agent`
pub fn user_agent() -> String {
    format!(
        "restauth/{} {}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

/// What a transport hands back when the server answered at all
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends one fully-stamped request. No retries, no status interpretation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RestRequest) -> Result<TransportResponse>;
}

/// [`Transport`] backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with connection pooling and the given timeouts
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        disable_ssl_verification: bool,
    ) -> anyhow::Result<Self> {
        if disable_ssl_verification {
            tracing::warn!("TLS certificate verification disabled for service requests");
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .danger_accept_invalid_certs(disable_ssl_verification)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: RestRequest) -> Result<TransportResponse> {
        let url = request.build_url()?;
        let headers = encode_headers(&request.headers)?;

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(
                error_kind = error_kind(&e),
                error = %e,
                url = %url,
                "HTTP request error"
            );
            RestError::NoResponse(format!("{} (kind: {})", e, error_kind(&e)))
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| RestError::NoResponse(format!("failed to read response body: {}", e)))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn encode_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RestError::Encoding(format!("header name {:?}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| RestError::Encoding(format!("value of header {}: {}", name, e)))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else {
        "unknown"
    }
}

/// Turns a non-2xx status, headers and non-empty body into an error.
/// An `Http` error returned with empty headers gets the response headers.
pub type ErrorDecoder = Arc<dyn Fn(StatusCode, &HeaderMap, &[u8]) -> RestError + Send + Sync>;

/// Decoded response with the transport-level status and headers
#[derive(Debug, Clone)]
pub struct RestResponse<T> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub result: T,
}

impl<T> RestResponse<T> {
    fn from_parts(response: TransportResponse, result: T) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            result,
        }
    }
}

/// Fields tried in order when looking for an error message
const MESSAGE_POINTERS: &[&str] = &[
    "/error",
    "/error/message",
    "/message",
    "/errorMessage",
    "/errors/0/message",
    "/error_description",
];

/// Default error-body decoder.
///
/// A JSON object body becomes the metadata and supplies the message; anything
/// else falls back to the status reason phrase.
pub fn decode_error_body(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> RestError {
    let json = serde_json::from_slice::<Value>(body)
        .ok()
        .filter(Value::is_object);

    let message = json.as_ref().and_then(|json| {
        MESSAGE_POINTERS
            .iter()
            .find_map(|pointer| json.pointer(pointer).and_then(Value::as_str))
            .map(str::to_string)
    });

    RestError::Http {
        status: status.as_u16(),
        message: message.unwrap_or_else(|| reason_phrase(status)),
        metadata: json,
        headers: headers.clone(),
    }
}

fn reason_phrase(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Unknown Status").to_string()
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Executes requests on behalf of one authenticator
pub struct RestClient {
    transport: Arc<dyn Transport>,
    authenticator: Arc<Authenticator>,
    error_decoder: ErrorDecoder,
    default_headers: BTreeMap<String, String>,
    refresh_on_unauthorized: bool,
}

impl RestClient {
    /// Client over a [`ReqwestTransport`] with default timeouts
    pub fn new(authenticator: Arc<Authenticator>) -> anyhow::Result<Self> {
        let transport =
            ReqwestTransport::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, false)?;
        Ok(Self::with_transport(authenticator, Arc::new(transport)))
    }

    pub fn with_transport(authenticator: Arc<Authenticator>, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            authenticator,
            error_decoder: Arc::new(decode_error_body),
            default_headers: BTreeMap::new(),
            refresh_on_unauthorized: false,
        }
    }

    /// Replace the error-body decoder
    pub fn with_error_decoder<F>(mut self, decoder: F) -> Self
    where
        F: Fn(StatusCode, &HeaderMap, &[u8]) -> RestError + Send + Sync + 'static,
    {
        self.error_decoder = Arc::new(decoder);
        self
    }

    /// Header added to every request that does not already carry it
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// On a 401 for a token-exchange strategy, drop the rejected token and
    /// send the request once more with a fresh one. Off by default.
    pub fn with_refresh_on_unauthorized(mut self, enabled: bool) -> Self {
        self.refresh_on_unauthorized = enabled;
        self
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    /// Run the pipeline and return the raw 2xx response.
    ///
    /// Authentication failures return before anything is sent.
    pub async fn execute(&self, request: RestRequest) -> Result<TransportResponse> {
        let request = self.with_defaults(request);
        let method = request.method.clone();
        let url = request.url.clone();

        let (stamped, token) = self
            .authenticator
            .authenticate_tracked(request.clone())
            .await
            .inspect_err(|e| {
                tracing::warn!(method = %method, url = %url, error = %e, "Authentication failed");
            })?;

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");
        let mut response = self.transport.send(stamped).await?;

        if response.status == StatusCode::UNAUTHORIZED && self.refresh_on_unauthorized {
            if let Some(token) = token {
                tracing::info!(url = %url, "Received 401, refreshing token and retrying");
                self.authenticator.invalidate(&token).await;
                let (stamped, _) = self.authenticator.authenticate_tracked(request).await?;
                response = self.transport.send(stamped).await?;
            }
        }

        tracing::debug!(status = %response.status, "Received HTTP response");
        self.classify(response)
    }

    /// Raw body bytes; an empty body is a successful empty result
    pub async fn response_data(&self, request: RestRequest) -> Result<RestResponse<Bytes>> {
        let response = self.execute(request).await?;
        let body = response.body.clone();
        Ok(RestResponse::from_parts(response, body))
    }

    /// Body as UTF-8 text
    pub async fn response_string(&self, request: RestRequest) -> Result<RestResponse<String>> {
        let response = self.execute(request).await?;
        let text = String::from_utf8(response.body.to_vec())
            .map_err(|e| RestError::Serialization(format!("response body is not UTF-8: {}", e)))?;
        Ok(RestResponse::from_parts(response, text))
    }

    /// Body decoded from JSON into `T`. Decode errors name the offending
    /// field path, e.g. `status.updated`.
    pub async fn response_object<T: DeserializeOwned>(
        &self,
        request: RestRequest,
    ) -> Result<RestResponse<T>> {
        let response = self.execute(request).await?;
        if response.body.is_empty() {
            return Err(RestError::NoData);
        }

        let mut deserializer = serde_json::Deserializer::from_slice(&response.body);
        let object: T = serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
            RestError::Serialization(format!(
                "{} at {}: {}",
                std::any::type_name::<T>(),
                e.path(),
                e.inner()
            ))
        })?;
        deserializer.end().map_err(|e| {
            RestError::Serialization(format!("{}: {}", std::any::type_name::<T>(), e))
        })?;
        Ok(RestResponse::from_parts(response, object))
    }

    /// Save the body to `path`, which must not exist yet.
    ///
    /// Nothing is written unless the response is 2xx.
    pub async fn download(
        &self,
        request: RestRequest,
        path: impl AsRef<Path>,
    ) -> Result<RestResponse<PathBuf>> {
        let path = path.as_ref().to_path_buf();
        let response = self.execute(request).await?;

        let save_error = |e: std::io::Error| {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save downloaded data");
            RestError::SaveData(format!("{}: {}", path.display(), e))
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(save_error)?;
        file.write_all(&response.body).await.map_err(save_error)?;
        file.flush().await.map_err(save_error)?;

        tracing::debug!(path = %path.display(), bytes = response.body.len(), "Saved response body");
        Ok(RestResponse::from_parts(response, path))
    }

    /// Status and headers only; the body is discarded
    pub async fn response_void(&self, request: RestRequest) -> Result<RestResponse<()>> {
        let response = self.execute(request).await?;
        Ok(RestResponse::from_parts(response, ()))
    }

    fn with_defaults(&self, mut request: RestRequest) -> RestRequest {
        for (name, value) in &self.default_headers {
            if request.header_value(name).is_none() {
                request.set_header(name.clone(), value.clone());
            }
        }
        if request.header_value(USER_AGENT.as_str()).is_none() {
            request.set_header("User-Agent", user_agent());
        }
        request
    }

    fn classify(&self, response: TransportResponse) -> Result<TransportResponse> {
        if response.status.is_success() {
            return Ok(response);
        }

        let mut error = if response.body.is_empty() {
            RestError::Http {
                status: response.status.as_u16(),
                message: reason_phrase(response.status),
                metadata: None,
                headers: response.headers.clone(),
            }
        } else {
            (self.error_decoder)(response.status, &response.headers, &response.body)
        };

        if let RestError::Http { headers, .. } = &mut error {
            if headers.is_empty() {
                *headers = response.headers;
            }
        }

        tracing::warn!(status = %response.status, error = %error, "Received error response");
        Err(error)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("authenticator", &self.authenticator)
            .field("default_headers", &self.default_headers)
            .field("refresh_on_unauthorized", &self.refresh_on_unauthorized)
            .finish_non_exhaustive()
    }
}
