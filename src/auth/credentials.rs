// Credential discovery
// Resolves a credential map for a service prefix and builds an authenticator from it

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::authenticator::{ApiKeyExchange, Authenticator, CredentialStrategy, PasswordExchange};
use crate::error::{RestError, Result};

/// File looked up in the working directory and the home directory
pub const CREDENTIALS_FILE_NAME: &str = "credentials.env";

/// Environment variable naming an explicit credentials file
pub const CREDENTIALS_FILE_ENV: &str = "RESTAUTH_CREDENTIALS_FILE";

/// Cloud Foundry service bindings
pub const VCAP_SERVICES_ENV: &str = "VCAP_SERVICES";

/// Lower-cased credential keys to values, prefix already stripped
pub type CredentialMap = BTreeMap<String, String>;

/// Authentication types recognised in `auth_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Iam,
    Basic,
    Cp4d,
    NoAuth,
    BearerToken,
}

impl AuthType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Err(RestError::AuthTypeNotDefined),
            "iam" => Ok(AuthType::Iam),
            "basic" => Ok(AuthType::Basic),
            "cp4d" => Ok(AuthType::Cp4d),
            "noauth" => Ok(AuthType::NoAuth),
            "bearertoken" => Ok(AuthType::BearerToken),
            _ => Err(RestError::UnrecognizedAuthType(value.to_string())),
        }
    }
}

/// Where discovery looks, in order. Built from the process environment by
/// [`CredentialSources::from_environment`]; tests build it by hand.
#[derive(Debug, Clone, Default)]
pub struct CredentialSources {
    pub local_file: Option<PathBuf>,
    pub user_file: Option<PathBuf>,
    pub home_file: Option<PathBuf>,
    pub env_vars: Vec<(String, String)>,
    pub vcap_services: Option<String>,
}

impl CredentialSources {
    pub fn from_environment() -> Self {
        Self {
            local_file: Some(PathBuf::from(CREDENTIALS_FILE_NAME)),
            user_file: std::env::var_os(CREDENTIALS_FILE_ENV).map(PathBuf::from),
            home_file: dirs::home_dir().map(|home| home.join(CREDENTIALS_FILE_NAME)),
            env_vars: std::env::vars().collect(),
            vcap_services: std::env::var(VCAP_SERVICES_ENV).ok(),
        }
    }

    /// First source that yields credentials for `prefix` wins
    pub fn discover(&self, prefix: &str) -> Option<CredentialMap> {
        let files = [&self.local_file, &self.user_file, &self.home_file];
        for path in files.into_iter().flatten() {
            if let Some(credentials) = read_credentials_file(path, prefix) {
                tracing::debug!(path = %path.display(), prefix, "Credentials loaded from file");
                return Some(credentials);
            }
        }

        let from_env = filter_prefixed(self.env_vars.iter().cloned(), prefix);
        if !from_env.is_empty() {
            tracing::debug!(prefix, "Credentials loaded from environment");
            return Some(from_env);
        }

        let from_vcap = self
            .vcap_services
            .as_deref()
            .and_then(|raw| read_vcap_services(raw, prefix));
        if from_vcap.is_some() {
            tracing::debug!(prefix, "Credentials loaded from VCAP_SERVICES");
        }
        from_vcap
    }
}

/// Discover credentials for `prefix` from the process environment
pub fn discover_credentials(prefix: &str) -> Option<CredentialMap> {
    CredentialSources::from_environment().discover(prefix)
}

/// Discover credentials for `prefix` and build the matching authenticator
pub fn get_authenticator(prefix: &str) -> Result<Authenticator> {
    let credentials = discover_credentials(prefix)
        .ok_or_else(|| RestError::NoConfigurationFound(prefix.to_string()))?;
    authenticator_from_credentials(&credentials)
}

/// Service URL configured alongside the credentials, if any
pub fn service_url(prefix: &str) -> Option<String> {
    discover_credentials(prefix).and_then(|credentials| service_url_from(&credentials))
}

pub fn service_url_from(credentials: &CredentialMap) -> Option<String> {
    let credentials = lowercase_keys(credentials);
    credentials
        .get("url")
        .or_else(|| credentials.get("service_url"))
        .cloned()
}

/// Build an authenticator from a resolved credential map.
///
/// A missing `auth_type` means API-key exchange.
pub fn authenticator_from_credentials(credentials: &CredentialMap) -> Result<Authenticator> {
    strategy_from_credentials(credentials).map(Authenticator::new)
}

/// Resolve the credential strategy a map describes
pub fn strategy_from_credentials(credentials: &CredentialMap) -> Result<CredentialStrategy> {
    let credentials = lowercase_keys(credentials);
    let auth_type = match credentials.get("auth_type") {
        Some(value) => AuthType::parse(value)?,
        None => AuthType::Iam,
    };

    let disable_ssl = credentials
        .get("auth_disable_ssl")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let strategy = match auth_type {
        AuthType::NoAuth => CredentialStrategy::NoAuth,
        AuthType::Basic => CredentialStrategy::Basic {
            username: required(&credentials, "username")?,
            password: required(&credentials, "password")?,
        },
        AuthType::BearerToken => CredentialStrategy::BearerToken {
            token: required(&credentials, "bearer_token")?,
        },
        AuthType::Iam => {
            let mut exchange = ApiKeyExchange::new(required(&credentials, "apikey")?);
            if let Some(url) = credentials.get("auth_url") {
                exchange = exchange.with_url(url.clone());
            }
            if let (Some(id), Some(secret)) =
                (credentials.get("client_id"), credentials.get("client_secret"))
            {
                exchange = exchange.with_client_credentials(id.clone(), secret.clone());
            }
            exchange.disable_ssl_verification = disable_ssl;
            CredentialStrategy::ApiKeyExchange(exchange)
        }
        AuthType::Cp4d => {
            let mut exchange = PasswordExchange::new(
                required(&credentials, "username")?,
                required(&credentials, "password")?,
                required(&credentials, "url")?,
            );
            exchange.disable_ssl_verification = disable_ssl;
            CredentialStrategy::PasswordExchange(exchange)
        }
    };

    Ok(strategy)
}

fn required(credentials: &CredentialMap, key: &str) -> Result<String> {
    credentials
        .get(key)
        .cloned()
        .ok_or_else(|| RestError::MissingCredential(key.to_string()))
}

fn lowercase_keys(credentials: &CredentialMap) -> CredentialMap {
    credentials
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

/// Keep `PREFIX_KEY` entries, strip the prefix and lower-case the key
fn filter_prefixed(
    entries: impl IntoIterator<Item = (String, String)>,
    prefix: &str,
) -> CredentialMap {
    let wanted = format!("{}_", prefix.to_ascii_lowercase());
    entries
        .into_iter()
        .filter_map(|(key, value)| {
            let key = key.to_ascii_lowercase();
            let stripped = key.strip_prefix(&wanted)?;
            (!stripped.is_empty()).then(|| (stripped.to_string(), value))
        })
        .collect()
}

/// `KEY=value` lines split once on `=`, values kept as written;
/// `None` when the file is missing or holds nothing for `prefix`
fn read_credentials_file(path: &Path, prefix: &str) -> Option<CredentialMap> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read credentials file");
            return None;
        }
    };

    let credentials = filter_prefixed(parse_credential_lines(&contents), prefix);
    (!credentials.is_empty()).then_some(credentials)
}

/// No quoting, escaping or `$VAR` expansion
fn parse_credential_lines(contents: &str) -> impl Iterator<Item = (String, String)> + '_ {
    contents.lines().filter_map(|line| {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            return None;
        }
        match line.split_once('=') {
            Some((key, value)) => Some((key.trim().to_string(), value.to_string())),
            None => {
                tracing::debug!(line = %line.trim(), "Skipping credentials line without '='");
                None
            }
        }
    })
}

/// `{"<prefix>": [{"credentials": {...}}]}`, auth type inferred from the fields
fn read_vcap_services(raw: &str, prefix: &str) -> Option<CredentialMap> {
    let services: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "VCAP_SERVICES is not valid JSON");
            return None;
        }
    };

    let fields = services.get(prefix)?.get(0)?.get("credentials")?.as_object()?;
    let mut credentials: CredentialMap = fields
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.to_ascii_lowercase(), s.to_string())))
        .collect();

    let auth_type = if credentials.contains_key("apikey") || credentials.contains_key("iam_apikey") {
        if let Some(key) = credentials.get("iam_apikey").cloned() {
            credentials.entry("apikey".to_string()).or_insert(key);
        }
        "iam"
    } else if credentials.contains_key("username") && credentials.contains_key("password") {
        "basic"
    } else {
        return None;
    };

    credentials.insert("auth_type".to_string(), auth_type.to_string());
    Some(credentials)
}
