//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "books.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://books.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Inbox processing and outbound federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum inbox tasks processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Inbox tasks buffered before the inbox answers 503
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum clock skew accepted on signed `Date` headers
    #[serde(default = "default_signature_max_age_seconds")]
    pub signature_max_age_seconds: i64,
    /// TTL of fetched public keys
    #[serde(default = "default_key_cache_ttl_seconds")]
    pub key_cache_ttl_seconds: u64,
    /// Timeout for actor/key fetches and deliveries
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    /// Allow fetching actors on loopback/private hosts (development only)
    #[serde(default)]
    pub allow_private_addresses: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            signature_max_age_seconds: default_signature_max_age_seconds(),
            key_cache_ttl_seconds: default_key_cache_ttl_seconds(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            allow_private_addresses: false,
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_signature_max_age_seconds() -> i64 {
    300
}

fn default_key_cache_ttl_seconds() -> u64 {
    3600
}

fn default_fetch_timeout_seconds() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIREADS__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedireads.db")?
            .set_default("federation.workers", default_workers() as i64)?
            .set_default("federation.queue_capacity", default_queue_capacity() as i64)?
            .set_default(
                "federation.signature_max_age_seconds",
                default_signature_max_age_seconds(),
            )?
            .set_default(
                "federation.key_cache_ttl_seconds",
                default_key_cache_ttl_seconds() as i64,
            )?
            .set_default(
                "federation.fetch_timeout_seconds",
                default_fetch_timeout_seconds() as i64,
            )?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDIREADS__*)
            .add_source(
                Environment::with_prefix("FEDIREADS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.federation.workers == 0 {
            return Err(AppError::Config(
                "federation.workers must be greater than 0".to_string(),
            ));
        }

        if self.federation.queue_capacity == 0 {
            return Err(AppError::Config(
                "federation.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.federation.signature_max_age_seconds <= 0 {
            return Err(AppError::Config(
                "federation.signature_max_age_seconds must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Running with a local server domain; remote servers cannot reach this instance"
            );
        } else if self.server.protocol != "https" {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
