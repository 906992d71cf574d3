// Outgoing request value object
// Built by callers, stamped by the authenticator, sent by the pipeline

use bytes::Bytes;
use reqwest::{Method, Url};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{RestError, Result};

/// Header the authenticator writes
pub const AUTHORIZATION: &str = "Authorization";

/// A logical HTTP request before it is handed to a transport.
///
/// The authenticator only ever touches `headers`; method, URL, query and
/// body pass through it unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl RestRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header, replacing any existing header with the same name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Append a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set `Content-Type`
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| RestError::Serialization(format!("request body: {}", e)))?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    /// Set a header; names compare case-insensitively
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
    }

    /// Look up a header value by case-insensitive name
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn authorization(&self) -> Option<&str> {
        self.header_value(AUTHORIZATION)
    }

    /// Resolve `url` plus query parameters into a full URL.
    ///
    /// Query values are form-encoded, so a literal `+` goes out as `%2B`.
    pub fn build_url(&self) -> Result<Url> {
        let mut url =
            Url::parse(&self.url).map_err(|e| RestError::BadUrl(format!("{}: {}", self.url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(RestError::BadUrl(format!(
                "{}: unsupported scheme {}",
                self.url,
                url.scheme()
            )));
        }

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }

        Ok(url)
    }
}
