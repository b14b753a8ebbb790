//! PostgreSQL engine adapter.
//!
//! Every operation opens a single `PgConnection`, uses it and closes it.
//! Introspection reads `information_schema` for the `public` schema;
//! statements run through the simple query protocol so they are executed
//! exactly as submitted.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgQueryResult, PgRow, PgSslMode};
use sqlx::{Column, ConnectOptions, Row, TypeInfo};

use super::helpers::{
    Phase, classify, described_columns, drain_results, release, stronger_constraint, text_value_to_json, with_deadline,
};
use super::{ConnectionConfig, EngineAdapter};
use crate::error::EngineError;
use crate::models::{
    ColumnSchema, ConnectionTest, EngineFamily, NormalizedSchema, QueryOutcome, ResultSet, TlsMode,
};

const COLUMNS_QUERY: &str = r"
SELECT
    c.table_name::text AS table_name,
    c.column_name::text AS column_name,
    c.data_type::text AS data_type,
    c.is_nullable::text AS is_nullable,
    c.column_default::text AS column_default,
    tc.constraint_type::text AS constraint_type
FROM information_schema.columns c
JOIN information_schema.tables t
    ON t.table_schema = c.table_schema
    AND t.table_name = c.table_name
LEFT JOIN information_schema.key_column_usage kcu
    ON kcu.table_schema = c.table_schema
    AND kcu.table_name = c.table_name
    AND kcu.column_name = c.column_name
LEFT JOIN information_schema.table_constraints tc
    ON tc.constraint_schema = kcu.constraint_schema
    AND tc.constraint_name = kcu.constraint_name
    AND tc.table_name = kcu.table_name
WHERE c.table_schema = 'public'
    AND t.table_type = 'BASE TABLE'
ORDER BY c.table_name, c.ordinal_position
";

/// PostgreSQL adapter (engine family A).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

fn ssl_mode(mode: TlsMode) -> PgSslMode {
    match mode {
        TlsMode::Disable => PgSslMode::Disable,
        TlsMode::Allow => PgSslMode::Allow,
        TlsMode::Prefer => PgSslMode::Prefer,
        TlsMode::Require => PgSslMode::Require,
        TlsMode::VerifyCa => PgSslMode::VerifyCa,
        TlsMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Builds driver options from the config without ever formatting a URL.
pub(crate) fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(config.host.as_deref().unwrap_or("localhost"))
        .port(config.effective_port().unwrap_or(5432))
        .ssl_mode(ssl_mode(config.effective_tls_mode()))
        .application_name("dbgateway");

    if let Some(username) = &config.username {
        options = options.username(username);
    }
    if let Some(password) = config.secrets.password() {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(ca) = &config.secrets.tls_ca_cert {
        options = options.ssl_root_cert_from_pem(ca.as_bytes().to_vec());
    }
    if let Some(cert) = &config.secrets.tls_client_cert {
        options = options.ssl_client_cert_from_pem(cert.as_bytes());
    }
    if let Some(key) = &config.secrets.tls_client_key {
        options = options.ssl_client_key_from_pem(key.as_bytes());
    }

    options.disable_statement_logging()
}

async fn connect(config: &ConnectionConfig) -> Result<PgConnection, EngineError> {
    let options = connect_options(config);
    with_deadline(Some(config.connect_timeout), "connect", async {
        options
            .connect()
            .await
            .map_err(|e| classify(&e, Phase::Connect))
    })
    .await
}

fn decode_row(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_unchecked::<Option<String>, _>(index) {
            Ok(Some(text)) => text_value_to_json(column.type_info().name(), text),
            Ok(None) => Value::Null,
            Err(e) => {
                tracing::debug!("Undecodable value in column '{}': {}", column.name(), e);
                Value::Null
            }
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

async fn run_statement(connection: &mut PgConnection, sql: &str) -> Result<ResultSet, EngineError> {
    let stream = sqlx::raw_sql(sql).fetch_many(&mut *connection);
    let mut result = drain_results(stream, PgQueryResult::rows_affected, decode_row)
        .await
        .map_err(|e| classify(&e, Phase::Execute))?;

    if result.data.is_empty() {
        result.columns = described_columns(&mut *connection, sql).await;
    }
    Ok(result)
}

async fn collect_columns(
    connection: &mut PgConnection,
    schema: &mut NormalizedSchema,
) -> Result<(), sqlx::Error> {
    let rows = sqlx::query(COLUMNS_QUERY).fetch_all(&mut *connection).await?;

    let mut last: Option<(String, String)> = None;
    for row in rows {
        let table: String = row.try_get("table_name")?;
        let name: String = row.try_get("column_name")?;
        let constraint: Option<String> = row.try_get("constraint_type")?;

        // A column in several constraints comes back once per constraint
        if last.as_ref() == Some(&(table.clone(), name.clone()))
            && let Some(existing) = schema
                .tables
                .get_mut(&table)
                .and_then(|t| t.columns.last_mut())
        {
            let merged = stronger_constraint(existing.constraint.take(), constraint);
            *existing = existing.clone().with_constraint(merged);
            continue;
        }

        let column = ColumnSchema::new(name.clone(), row.try_get::<String, _>("data_type")?)
            .with_nullable(row.try_get::<String, _>("is_nullable")? == "YES")
            .with_default(row.try_get("column_default")?)
            .with_constraint(constraint);
        schema.push_column(&table, column);
        last = Some((table, name));
    }

    Ok(())
}

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn family(&self) -> EngineFamily {
        EngineFamily::Postgres
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTest {
        let mut connection = match connect(config).await {
            Ok(connection) => connection,
            Err(e) => return ConnectionTest::failed(e),
        };

        let outcome = with_deadline(config.query_timeout, "connection test", async {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&mut connection)
                .await
                .map_err(|e| classify(&e, Phase::Execute))
        })
        .await;
        release(connection).await;

        match outcome {
            Ok(_) => ConnectionTest::ok(),
            Err(e) => ConnectionTest::failed(e),
        }
    }

    async fn execute_query(&self, config: &ConnectionConfig, sql: &str) -> QueryOutcome {
        let mut connection = match connect(config).await {
            Ok(connection) => connection,
            Err(e) => return QueryOutcome::Failure(e),
        };

        let outcome = with_deadline(
            config.query_timeout,
            "statement",
            run_statement(&mut connection, sql),
        )
        .await;

        match outcome {
            // A timed-out statement may still be running; dropping closes the socket
            Err(EngineError::Timeout(message)) => {
                drop(connection);
                QueryOutcome::Failure(EngineError::Timeout(message))
            }
            Ok(rows) => {
                release(connection).await;
                QueryOutcome::Success(rows)
            }
            Err(e) => {
                release(connection).await;
                QueryOutcome::Failure(e)
            }
        }
    }

    async fn introspect_schema(&self, config: &ConnectionConfig) -> NormalizedSchema {
        let mut connection = match connect(config).await {
            Ok(connection) => connection,
            Err(e) => return NormalizedSchema::degraded(self.family(), e.message()),
        };

        let mut schema = NormalizedSchema::new(self.family(), config.database.clone());
        let collected = collect_columns(&mut connection, &mut schema).await;
        release(connection).await;

        match collected {
            Ok(()) => {
                tracing::debug!("Introspected {} PostgreSQL tables", schema.tables.len());
                schema
            }
            Err(e) => {
                NormalizedSchema::degraded(self.family(), classify(&e, Phase::Execute).message())
            }
        }
    }

    fn statistics_sql(&self) -> &'static str {
        "SELECT schemaname, tablename, tableowner FROM pg_tables \
         WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
         ORDER BY schemaname, tablename"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TlsSettings;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(TlsMode::Disable), PgSslMode::Disable));
        assert!(matches!(ssl_mode(TlsMode::Prefer), PgSslMode::Prefer));
        assert!(matches!(ssl_mode(TlsMode::VerifyCa), PgSslMode::VerifyCa));
        assert!(matches!(ssl_mode(TlsMode::VerifyFull), PgSslMode::VerifyFull));
    }

    #[test]
    fn test_connect_options_from_config() {
        let config = ConnectionConfig::network(EngineFamily::Postgres, "db.internal")
            .with_database("reports")
            .with_username("reader")
            .with_password("secret")
            .with_tls(TlsSettings {
                enabled: true,
                mode: TlsMode::VerifyFull,
                reject_unauthorized: false,
            });

        let options = connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("reports"));
        assert_eq!(options.get_username(), "reader");
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Require));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_reported_not_raised() {
        // Port 1 on loopback is closed on any sane test host
        let config = ConnectionConfig::network(EngineFamily::Postgres, "127.0.0.1")
            .with_port(1)
            .with_database("none")
            .with_username("none")
            .with_connect_timeout(std::time::Duration::from_secs(2));

        let test = PostgresAdapter.test_connection(&config).await;
        assert!(!test.success);
        assert!(matches!(
            test.error,
            Some(
                EngineError::ConnectionRefused(_)
                    | EngineError::Timeout(_)
                    | EngineError::ConnectionFailed(_)
            )
        ));

        let schema = PostgresAdapter.introspect_schema(&config).await;
        assert!(schema.is_degraded());
        assert!(schema.tables.is_empty());
    }
}
