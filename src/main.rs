use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use restauth::auth::{discover_credentials, service_url_from, strategy_from_credentials, Authenticator};
use restauth::config::Config;
use restauth::http_client::{ReqwestTransport, RestClient};
use restauth::request::RestRequest;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Resolve credentials
    let credentials = discover_credentials(&config.service).with_context(|| {
        format!(
            "No credentials found for {} (checked credentials.env files, environment, VCAP_SERVICES)",
            config.service
        )
    })?;
    let strategy = strategy_from_credentials(&credentials)
        .with_context(|| format!("Invalid credentials for {}", config.service))?;
    tracing::info!(strategy = strategy.name(), service = %config.service, "Credentials resolved");

    let authenticator = Arc::new(Authenticator::with_safety_margin(strategy, config.token_margin));
    if config.disable_ssl_verification {
        authenticator.disable_ssl_verification();
    }

    if config.print_header {
        match authenticator.authorization_header().await? {
            Some(header) => println!("Authorization: {}", header),
            None => tracing::warn!("Strategy sends no Authorization header"),
        }
        return Ok(());
    }

    // Send the request
    let url = config.resolve_url(service_url_from(&credentials).as_deref())?;
    let transport = ReqwestTransport::new(
        Duration::from_secs(config.http_connect_timeout),
        Duration::from_secs(config.http_request_timeout),
        config.disable_ssl_verification,
    )?;
    let client = RestClient::with_transport(authenticator, Arc::new(transport))
        .with_refresh_on_unauthorized(config.refresh_on_unauthorized);

    let mut request = RestRequest::new(config.method.clone(), url);
    for (name, value) in &config.headers {
        request.set_header(name.clone(), value.clone());
    }
    if let Some(body) = &config.body {
        request = request.body(body.clone());
    }

    let response = client.response_string(request).await?;
    tracing::info!(status = %response.status, "Request completed");
    println!("{}", response.result);

    Ok(())
}
