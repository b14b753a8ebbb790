//! Per-operation engine connection configuration.
//!
//! A [`ConnectionConfig`] is built fresh for every gateway call, either from
//! a decrypted vault record or directly by a caller that wants to test
//! connectivity before anything is stored.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::error::GatewayError;
use crate::models::{Connection, ConnectionDraft, EngineFamily, TlsMode, TlsSettings};
use crate::security::ConnectionSecrets;

/// Default deadline for establishing an engine connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for one engine operation.
///
/// # Security
/// Secrets travel in [`ConnectionSecrets`], whose `Debug` output is
/// redacted. `Display` shows only the family, host, port and database.
///
/// # Example
/// ```rust
/// use dbgateway_core::adapters::ConnectionConfig;
/// use dbgateway_core::models::EngineFamily;
///
/// let config = ConnectionConfig::network(EngineFamily::Postgres, "localhost")
///     .with_database("app")
///     .with_username("app")
///     .with_password("secret");
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.to_string(), "postgres://localhost:5432/app");
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Engine family
    pub family: EngineFamily,
    /// Network host
    pub host: Option<String>,
    /// Network port; the family default applies when unset
    pub port: Option<u16>,
    /// Database name
    pub database: Option<String>,
    /// Login name
    pub username: Option<String>,
    /// Database file (SQLite)
    pub file_path: Option<String>,
    /// TLS switches
    pub tls: TlsSettings,
    /// Password and TLS material
    pub secrets: ConnectionSecrets,
    /// Deadline for establishing the connection
    pub connect_timeout: Duration,
    /// Optional deadline for a single statement
    pub query_timeout: Option<Duration>,
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.family.is_file_based() {
            return write!(
                f,
                "{}:{}",
                self.family,
                self.file_path.as_deref().unwrap_or("<unset>")
            );
        }
        write!(
            f,
            "{}://{}{}{}",
            self.family,
            self.host.as_deref().unwrap_or("<unset>"),
            self.effective_port()
                .map_or_else(String::new, |p| format!(":{p}")),
            self.database
                .as_ref()
                .map_or_else(String::new, |db| format!("/{db}"))
        )
        // Intentionally omit username and never include credentials
    }
}

impl ConnectionConfig {
    fn empty(family: EngineFamily) -> Self {
        Self {
            family,
            host: None,
            port: None,
            database: None,
            username: None,
            file_path: None,
            tls: TlsSettings::default(),
            secrets: ConnectionSecrets::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: None,
        }
    }

    /// Creates a config for a network family.
    pub fn network(family: EngineFamily, host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::empty(family)
        }
    }

    /// Creates a config for a SQLite file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Self::empty(EngineFamily::Sqlite)
        }
    }

    /// Builds a config from a decrypted vault record.
    pub fn from_connection(connection: &Connection) -> Self {
        Self {
            family: connection.family,
            host: connection.host.clone(),
            port: connection.port,
            database: connection.database.clone(),
            username: connection.username.clone(),
            file_path: connection.file_path.clone(),
            tls: connection.tls,
            secrets: connection.secrets.clone(),
            ..Self::empty(connection.family)
        }
    }

    /// Builds a config from a not-yet-stored draft.
    pub fn from_draft(draft: &ConnectionDraft) -> Self {
        Self {
            family: draft.family,
            host: draft.host.clone(),
            port: draft.port,
            database: draft.database.clone(),
            username: draft.username.clone(),
            file_path: draft.file_path.clone(),
            tls: draft.tls,
            secrets: draft.secrets.clone(),
            ..Self::empty(draft.family)
        }
    }

    /// Builder method to set port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder method to set database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Builder method to set username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Builder method to set password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.secrets.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Builder method to set TLS switches.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Builder method to set the connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to set the statement deadline.
    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Port to dial, falling back to the family default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.family.default_port())
    }

    /// TLS mode handed to the driver.
    ///
    /// Disabled TLS wins over the mode; with `reject_unauthorized` off the
    /// verifying modes degrade to plain `require`.
    pub fn effective_tls_mode(&self) -> TlsMode {
        if !self.tls.enabled {
            return TlsMode::Disable;
        }
        match self.tls.mode {
            TlsMode::VerifyCa | TlsMode::VerifyFull if !self.tls.reject_unauthorized => {
                TlsMode::Require
            }
            mode => mode,
        }
    }

    /// Validates connection configuration parameters.
    ///
    /// # Errors
    /// Returns error if a required part for the family is missing
    pub fn validate(&self) -> crate::Result<()> {
        if self.family.is_file_based() {
            if self.file_path.as_deref().is_none_or(|p| p.trim().is_empty()) {
                return Err(GatewayError::configuration(
                    "file_path is required for sqlite connections",
                ));
            }
        } else if self.host.as_deref().is_none_or(|h| h.trim().is_empty()) {
            return Err(GatewayError::configuration("host cannot be empty"));
        }

        if self.port == Some(0) {
            return Err(GatewayError::configuration("port must be greater than 0"));
        }

        if self.connect_timeout.is_zero() {
            return Err(GatewayError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }

        if self.query_timeout.is_some_and(|t| t.is_zero()) {
            return Err(GatewayError::configuration(
                "query_timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_validation() {
        let config = ConnectionConfig::network(EngineFamily::Mysql, "localhost");
        assert!(config.validate().is_ok());

        let config = ConnectionConfig::network(EngineFamily::Mysql, "  ");
        assert!(config.validate().is_err());

        let config = ConnectionConfig::network(EngineFamily::Postgres, "localhost").with_port(0);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::sqlite("");
        assert!(config.validate().is_err());

        let config = ConnectionConfig::sqlite("/tmp/app.db")
            .with_connect_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_config_display_hides_credentials() {
        let config = ConnectionConfig::network(EngineFamily::Mysql, "db.internal")
            .with_port(3307)
            .with_database("shop")
            .with_username("admin")
            .with_password("hunter2");

        let display = config.to_string();
        assert_eq!(display, "mysql://db.internal:3307/shop");
        assert!(!display.contains("admin"));
        assert!(!format!("{config:?}").contains("hunter2"));

        assert_eq!(ConnectionConfig::sqlite("/data/app.db").to_string(), "sqlite:/data/app.db");
    }

    #[test]
    fn test_effective_tls_mode() {
        let mut config = ConnectionConfig::network(EngineFamily::Postgres, "localhost");
        config.tls.mode = TlsMode::VerifyFull;
        assert_eq!(config.effective_tls_mode(), TlsMode::Disable);

        config.tls.enabled = true;
        assert_eq!(config.effective_tls_mode(), TlsMode::VerifyFull);

        config.tls.reject_unauthorized = false;
        assert_eq!(config.effective_tls_mode(), TlsMode::Require);

        config.tls.mode = TlsMode::Allow;
        assert_eq!(config.effective_tls_mode(), TlsMode::Allow);
    }

    #[test]
    fn test_effective_port_defaults() {
        assert_eq!(
            ConnectionConfig::network(EngineFamily::Postgres, "h").effective_port(),
            Some(5432)
        );
        assert_eq!(
            ConnectionConfig::network(EngineFamily::Mysql, "h")
                .with_port(3307)
                .effective_port(),
            Some(3307)
        );
        assert_eq!(ConnectionConfig::sqlite("a.db").effective_port(), None);
    }
}
