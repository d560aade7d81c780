//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from the OAUTH_CLIENT_SECRET env var or
//! client_secret_file, never stored in the TOML directly to avoid leaking it.
//! Everything here is fixed for the lifetime of the process.

use common::Secret;
use oauth_exchange::{ClientCredentials, DEFAULT_AUTHORIZE_URL, DEFAULT_TOKEN_URL};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest token endpoint round-trip we allow, in seconds.
const MAX_TIMEOUT_SECS: u64 = 10;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub server: ServerConfig,
}

/// OAuth client registration with the provider
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to the env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    pub redirect_uri: String,
    /// Normalized to a space-delimited list on load
    #[serde(default)]
    pub scopes: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_authorize_url() -> String {
    DEFAULT_AUTHORIZE_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_timeout() -> u64 {
    MAX_TIMEOUT_SECS
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    let parsed = reqwest::Url::parse(value)
        .map_err(|e| common::Error::Config(format!("{field} is not a valid URL ({e}): {value}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        require_http_url("redirect_uri", &config.oauth.redirect_uri)?;
        require_http_url("authorize_url", &config.oauth.authorize_url)?;
        require_http_url("token_url", &config.oauth.token_url)?;

        if !(1..=MAX_TIMEOUT_SECS).contains(&config.oauth.timeout_secs) {
            return Err(common::Error::Config(format!(
                "timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}, got: {}",
                config.oauth.timeout_secs
            )));
        }

        if config.server.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        config.oauth.scopes = oauth_exchange::normalize_scopes(&config.oauth.scopes);

        // Resolve client secret: env var takes precedence over file
        if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        if config.oauth.client_secret.is_none() {
            return Err(common::Error::Config(
                "client secret missing: set OAUTH_CLIENT_SECRET or client_secret_file".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth-gateway.toml")
    }
}

impl OAuthConfig {
    /// Client identification sent with every grant.
    pub fn client_credentials(&self) -> common::Result<ClientCredentials> {
        let secret = self
            .client_secret
            .clone()
            .ok_or_else(|| common::Error::Config("client secret not resolved".into()))?;
        Ok(ClientCredentials::new(
            self.client_id.clone(),
            secret,
            self.redirect_uri.clone(),
        ))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
