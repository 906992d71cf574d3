use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Method;
use std::collections::BTreeMap;

use crate::auth::DEFAULT_SAFETY_MARGIN_SECS;

/// restauth - send an authenticated request using discovered service credentials
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Credential prefix to discover (e.g. ASSISTANT reads ASSISTANT_APIKEY)
    #[arg(short, long, env = "RESTAUTH_SERVICE")]
    pub service: String,

    /// Request URL, or a path relative to the discovered service URL
    #[arg(short, long, env = "RESTAUTH_URL")]
    pub url: Option<String>,

    /// HTTP method
    #[arg(short = 'X', long, env = "RESTAUTH_METHOD", default_value = "GET")]
    pub method: String,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "300")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub connect_timeout: u64,

    /// Refresh tokens this many seconds before they expire
    #[arg(long, env = "TOKEN_MARGIN", default_value_t = DEFAULT_SAFETY_MARGIN_SECS)]
    pub token_margin: i64,

    /// Skip TLS certificate verification (development only)
    #[arg(long, env = "DISABLE_SSL_VERIFICATION")]
    pub disable_ssl_verification: bool,

    /// Print the Authorization header instead of sending a request
    #[arg(long)]
    pub print_header: bool,

    /// Refresh the token and retry once when the service answers 401
    #[arg(long, env = "REFRESH_ON_UNAUTHORIZED")]
    pub refresh_on_unauthorized: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Credentials
    pub service: String,

    // Request
    pub url: Option<String>,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub disable_ssl_verification: bool,
    pub refresh_on_unauthorized: bool,

    // Tokens
    pub token_margin: i64,

    // Output
    pub print_header: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method: {}", args.method))?;

        let headers = args
            .headers
            .iter()
            .map(String::as_str)
            .map(parse_header)
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Config {
            service: args.service,
            url: args.url,
            method,
            headers,
            body: args.data,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            disable_ssl_verification: args.disable_ssl_verification,
            refresh_on_unauthorized: args.refresh_on_unauthorized,
            token_margin: args.token_margin,
            print_header: args.print_header,
            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            anyhow::bail!("RESTAUTH_SERVICE must not be empty");
        }
        if self.token_margin < 0 {
            anyhow::bail!("TOKEN_MARGIN must not be negative: {}", self.token_margin);
        }
        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }

    /// Final request URL. Relative paths are joined onto `service_url`.
    pub fn resolve_url(&self, service_url: Option<&str>) -> Result<String> {
        match (self.url.as_deref(), service_url) {
            (Some(url), _) if is_absolute(url) => Ok(url.to_string()),
            (Some(path), Some(base)) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            )),
            (None, Some(base)) => Ok(base.to_string()),
            (Some(path), None) => anyhow::bail!(
                "Relative URL {} needs a service URL ({}_URL)",
                path,
                self.service.to_ascii_uppercase()
            ),
            (None, None) => anyhow::bail!(
                "No URL given and no service URL configured for {}",
                self.service
            ),
        }
    }
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Parse a "Name: value" header argument
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header must look like \"Name: value\": {}", raw))?;

    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header name is empty: {}", raw);
    }

    Ok((name.to_string(), value.trim().to_string()))
}
