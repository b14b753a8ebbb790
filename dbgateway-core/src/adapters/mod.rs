//! Engine adapters and the gateway facade.
//!
//! Every engine family implements [`EngineAdapter`]. Adapters are
//! stateless: each call opens its own connection from the supplied
//! [`ConnectionConfig`], uses it and releases it on every exit path. No
//! adapter operation returns an `Err`; failures come back as values
//! carrying an [`EngineError`](crate::error::EngineError).
//!
//! # Module Structure
//! - `config`: per-operation connection configuration
//! - `helpers`: error classification, deadlines, result draining
//! - `postgres`, `mysql`: network families (feature-gated)
//! - `sqlite`: file family (always compiled)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::GatewayConfig;
use crate::error::{EngineError, GatewayError};
use crate::models::{Connection, ConnectionTest, EngineFamily, NormalizedSchema, QueryOutcome};
use crate::validation::validate_table_name;

pub mod config;
pub(crate) mod helpers;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgresql")]
pub mod postgres;
pub mod sqlite;

pub use config::ConnectionConfig;

/// Rows returned by a sample read.
pub const SAMPLE_ROW_LIMIT: u32 = 10;

/// Capability set every engine family provides.
///
/// # Object Safety
/// This trait is object-safe; [`adapter_for`] hands out `&'static dyn
/// EngineAdapter` values.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Engine family this adapter handles.
    fn family(&self) -> EngineFamily;

    /// Opens the cheapest possible round trip and closes it immediately.
    async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTest;

    /// Executes the statement text verbatim; never retries.
    async fn execute_query(&self, config: &ConnectionConfig, sql: &str) -> QueryOutcome;

    /// Produces the normalized schema, or a degraded one on failure.
    async fn introspect_schema(&self, config: &ConnectionConfig) -> NormalizedSchema;

    /// Catalog query listing user tables with engine-specific statistics.
    fn statistics_sql(&self) -> &'static str;
}

#[cfg(feature = "postgresql")]
static POSTGRES: postgres::PostgresAdapter = postgres::PostgresAdapter;
#[cfg(feature = "mysql")]
static MYSQL: mysql::MySqlAdapter = mysql::MySqlAdapter;
static SQLITE: sqlite::SqliteAdapter = sqlite::SqliteAdapter;

/// Selects the adapter for an engine family.
///
/// # Errors
/// Returns `EngineError::UnsupportedEngine` when the family's driver was
/// not compiled in
pub fn adapter_for(family: EngineFamily) -> Result<&'static dyn EngineAdapter, EngineError> {
    match family {
        #[cfg(feature = "postgresql")]
        EngineFamily::Postgres => Ok(&POSTGRES),
        #[cfg(not(feature = "postgresql"))]
        EngineFamily::Postgres => Err(EngineError::UnsupportedEngine(
            "PostgreSQL support not compiled in (enable the postgresql feature)".to_string(),
        )),
        #[cfg(feature = "mysql")]
        EngineFamily::Mysql => Ok(&MYSQL),
        #[cfg(not(feature = "mysql"))]
        EngineFamily::Mysql => Err(EngineError::UnsupportedEngine(
            "MySQL support not compiled in (enable the mysql feature)".to_string(),
        )),
        EngineFamily::Sqlite => Ok(&SQLITE),
    }
}

/// Entry point for engine operations.
///
/// Holds the process-wide timeouts and dispatches each call to the adapter
/// of the config's family.
#[derive(Debug, Clone)]
pub struct Gateway {
    connect_timeout: Duration,
    query_timeout: Option<Duration>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            connect_timeout: config::DEFAULT_CONNECT_TIMEOUT,
            query_timeout: None,
        }
    }
}

impl Gateway {
    /// Creates a gateway with explicit timeouts.
    pub fn new(connect_timeout: Duration, query_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            query_timeout,
        }
    }

    /// Creates a gateway from the process configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.connect_timeout, config.query_timeout)
    }

    /// Builds the per-operation config for a stored connection.
    pub fn config_for(&self, connection: &Connection) -> ConnectionConfig {
        self.with_timeouts(ConnectionConfig::from_connection(connection))
    }

    /// Applies this gateway's timeouts to a config.
    pub fn with_timeouts(&self, config: ConnectionConfig) -> ConnectionConfig {
        config
            .with_connect_timeout(self.connect_timeout)
            .with_query_timeout(self.query_timeout)
    }

    fn dispatch(config: &ConnectionConfig) -> Result<&'static dyn EngineAdapter, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::ConnectionFailed(e.to_string()))?;
        adapter_for(config.family)
    }

    /// Tests connectivity; never fails, always reports.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTest {
        tracing::debug!("Testing connection to {}", config);
        let test = match Self::dispatch(config) {
            Ok(adapter) => adapter.test_connection(config).await,
            Err(e) => ConnectionTest::failed(e),
        };
        if let Some(error) = &test.error {
            tracing::info!("Connection test for {} failed: {}", config, error);
        }
        test
    }

    /// Executes a statement verbatim.
    pub async fn execute_query(&self, config: &ConnectionConfig, sql: &str) -> QueryOutcome {
        match Self::dispatch(config) {
            Ok(adapter) => adapter.execute_query(config, sql).await,
            Err(e) => QueryOutcome::Failure(e),
        }
    }

    /// Introspects the schema; failures yield a degraded schema.
    pub async fn introspect_schema(&self, config: &ConnectionConfig) -> NormalizedSchema {
        let schema = match Self::dispatch(config) {
            Ok(adapter) => adapter.introspect_schema(config).await,
            Err(e) => NormalizedSchema::degraded(config.family, e.message()),
        };
        if let Some(error) = &schema.error {
            tracing::warn!("Schema introspection for {} degraded: {}", config, error);
        }
        schema
    }

    /// Reads the first rows of a table.
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` if the table name is not a plain
    /// identifier; engine failures come back inside the outcome
    pub async fn sample_table(
        &self,
        config: &ConnectionConfig,
        table: &str,
    ) -> crate::Result<QueryOutcome> {
        validate_table_name(table)?;
        let sql = format!("SELECT * FROM {table} LIMIT {SAMPLE_ROW_LIMIT}");
        Ok(self.execute_query(config, &sql).await)
    }

    /// Lists user tables with engine-specific statistics.
    ///
    /// Failures are logged and produce an empty list.
    pub async fn table_statistics(&self, config: &ConnectionConfig) -> Vec<Map<String, Value>> {
        let adapter = match Self::dispatch(config) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!("Table statistics unavailable for {}: {}", config, e);
                return Vec::new();
            }
        };

        match adapter.execute_query(config, adapter.statistics_sql()).await {
            QueryOutcome::Success(rows) => rows.data,
            QueryOutcome::Failure(e) => {
                tracing::warn!("Table statistics query for {} failed: {}", config, e);
                Vec::new()
            }
        }
    }
}

/// Converts a failed connection test into the service-level error.
pub(crate) fn require_connectivity(test: ConnectionTest) -> crate::Result<()> {
    match test.error {
        None if test.success => Ok(()),
        Some(source) => Err(GatewayError::ConnectionTestFailed { source }),
        None => Err(GatewayError::ConnectionTestFailed {
            source: EngineError::ConnectionFailed("connection test failed".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_for_matches_family() {
        assert_eq!(
            adapter_for(EngineFamily::Sqlite).unwrap().family(),
            EngineFamily::Sqlite
        );
        #[cfg(feature = "postgresql")]
        assert_eq!(
            adapter_for(EngineFamily::Postgres).unwrap().family(),
            EngineFamily::Postgres
        );
        #[cfg(feature = "mysql")]
        assert_eq!(
            adapter_for(EngineFamily::Mysql).unwrap().family(),
            EngineFamily::Mysql
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported_not_raised() {
        let gateway = Gateway::default();
        let config = ConnectionConfig::sqlite("");

        let test = gateway.test_connection(&config).await;
        assert!(!test.success);

        let schema = gateway.introspect_schema(&config).await;
        assert_eq!(schema.database_type, EngineFamily::Sqlite);
        assert!(schema.error.is_some());
        assert!(schema.tables.is_empty());

        assert!(gateway.table_statistics(&config).await.is_empty());
    }

    #[tokio::test]
    async fn test_sample_table_rejects_injection() {
        let gateway = Gateway::default();
        let config = ConnectionConfig::sqlite("/tmp/whatever.db");

        let result = gateway.sample_table(&config, "users; DROP TABLE users").await;
        assert!(matches!(result, Err(GatewayError::Validation { .. })));
    }

    #[test]
    fn test_require_connectivity() {
        assert!(require_connectivity(ConnectionTest::ok()).is_ok());
        let err = require_connectivity(ConnectionTest::failed(EngineError::AuthenticationFailed(
            "bad password".into(),
        )))
        .unwrap_err();
        assert!(err.to_string().contains("bad password"));
    }
}
