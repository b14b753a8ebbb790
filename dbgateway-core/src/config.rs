//! Process-level gateway configuration.
//!
//! Everything here is read once at startup: where the vault lives, the
//! secret the credential cipher derives its key from, and the default
//! engine timeouts applied to every outbound connection.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::Result;
use crate::error::{GatewayError, redact_database_url};

/// Environment variable naming the vault database URL.
pub const ENV_VAULT_URL: &str = "DBGATEWAY_VAULT_URL";
/// Environment variable holding the encryption secret.
pub const ENV_ENCRYPTION_KEY: &str = "DBGATEWAY_ENCRYPTION_KEY";
/// Environment variable overriding the connect timeout, in seconds.
pub const ENV_CONNECT_TIMEOUT: &str = "DBGATEWAY_CONNECT_TIMEOUT_SECS";
/// Environment variable setting a statement timeout, in seconds.
pub const ENV_QUERY_TIMEOUT: &str = "DBGATEWAY_QUERY_TIMEOUT_SECS";

/// Default vault location when nothing else is configured.
pub const DEFAULT_VAULT_URL: &str = "sqlite://dbgateway.db";

const MIN_ENCRYPTION_KEY_LEN: usize = 16;

/// Gateway configuration.
///
/// # Security
/// The encryption secret is held in a zeroizing container and is omitted
/// from both `Debug` and `Display`.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Vault database URL (`sqlite://path` or `sqlite::memory:`)
    pub vault_url: String,
    /// Secret the credential cipher derives its key from
    pub encryption_key: Zeroizing<String>,
    /// Deadline for establishing engine connections
    pub connect_timeout: Duration,
    /// Optional deadline for individual statements
    pub query_timeout: Option<Duration>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("vault_url", &redact_database_url(&self.vault_url))
            .field("encryption_key", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl std::fmt::Display for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GatewayConfig(vault={}, connect_timeout={}s{})",
            redact_database_url(&self.vault_url),
            self.connect_timeout.as_secs(),
            self.query_timeout
                .map_or_else(String::new, |t| format!(", query_timeout={}s", t.as_secs()))
        )
        // Never include the encryption secret
    }
}

impl GatewayConfig {
    /// Creates a configuration with default timeouts.
    pub fn new(vault_url: impl Into<String>, encryption_key: impl Into<String>) -> Self {
        Self {
            vault_url: vault_url.into(),
            encryption_key: Zeroizing::new(encryption_key.into()),
            connect_timeout: Duration::from_secs(10),
            query_timeout: None,
        }
    }

    /// Builder method to set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to set the statement timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Builds a configuration from the process environment.
    ///
    /// There is no fallback encryption secret: a missing
    /// `DBGATEWAY_ENCRYPTION_KEY` is a configuration error.
    ///
    /// # Errors
    /// Returns error if the secret is missing or a timeout is not a number
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// `from_env` delegates here; tests pass a closure over a map instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault_url = lookup(ENV_VAULT_URL).unwrap_or_else(|| DEFAULT_VAULT_URL.to_string());
        let encryption_key = lookup(ENV_ENCRYPTION_KEY).ok_or_else(|| {
            GatewayError::configuration(format!("{ENV_ENCRYPTION_KEY} must be set"))
        })?;

        let mut config = Self::new(vault_url, encryption_key);

        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = Duration::from_secs(parse_seconds(ENV_CONNECT_TIMEOUT, &raw)?);
        }
        if let Some(raw) = lookup(ENV_QUERY_TIMEOUT) {
            config.query_timeout = Some(Duration::from_secs(parse_seconds(ENV_QUERY_TIMEOUT, &raw)?));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration parameters.
    ///
    /// # Errors
    /// Returns error if configuration values are invalid or unsafe
    pub fn validate(&self) -> Result<()> {
        if self.vault_url.trim().is_empty() {
            return Err(GatewayError::configuration("vault_url cannot be empty"));
        }

        if !self.vault_url.starts_with("sqlite:") {
            return Err(GatewayError::configuration(format!(
                "vault_url must be a sqlite URL, got {}",
                redact_database_url(&self.vault_url)
            )));
        }

        if self.encryption_key.chars().count() < MIN_ENCRYPTION_KEY_LEN {
            return Err(GatewayError::configuration(format!(
                "encryption key must be at least {MIN_ENCRYPTION_KEY_LEN} characters"
            )));
        }

        if self.connect_timeout.is_zero() {
            return Err(GatewayError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }

        if let Some(timeout) = self.query_timeout
            && timeout.is_zero()
        {
            return Err(GatewayError::configuration(
                "query_timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn parse_seconds(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|_| {
        GatewayError::configuration(format!("{name} must be a whole number of seconds"))
    })
}
