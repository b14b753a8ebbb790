//! MySQL engine adapter.
//!
//! One `MySqlConnection` per operation. Introspection reads
//! `INFORMATION_SCHEMA.COLUMNS` for the connected database and maps the
//! `COLUMN_KEY` flag onto the normalized key slots.
//!
//! Catalog columns are cast to `CHAR` because MySQL 8 reports several of
//! them as binary strings.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlQueryResult, MySqlRow, MySqlSslMode};
use sqlx::{Column, ConnectOptions, Row, TypeInfo};

use super::helpers::{
    Phase, bytes_to_json, classify, described_columns, drain_results, release, text_value_to_json, with_deadline,
};
use super::{ConnectionConfig, EngineAdapter};
use crate::error::EngineError;
use crate::models::{
    ColumnSchema, ConnectionTest, EngineFamily, NormalizedSchema, QueryOutcome, ResultSet, TlsMode,
};

const COLUMNS_QUERY: &str = r"
SELECT
    CAST(TABLE_NAME AS CHAR) AS table_name,
    CAST(COLUMN_NAME AS CHAR) AS column_name,
    CAST(DATA_TYPE AS CHAR) AS data_type,
    CAST(IS_NULLABLE AS CHAR) AS is_nullable,
    CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
    CAST(COLUMN_KEY AS CHAR) AS column_key
FROM INFORMATION_SCHEMA.COLUMNS
WHERE TABLE_SCHEMA = DATABASE()
ORDER BY TABLE_NAME, ORDINAL_POSITION
";

/// MySQL adapter (engine family B).
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

fn ssl_mode(mode: TlsMode) -> MySqlSslMode {
    match mode {
        TlsMode::Disable => MySqlSslMode::Disabled,
        TlsMode::Allow | TlsMode::Prefer => MySqlSslMode::Preferred,
        TlsMode::Require => MySqlSslMode::Required,
        TlsMode::VerifyCa => MySqlSslMode::VerifyCa,
        TlsMode::VerifyFull => MySqlSslMode::VerifyIdentity,
    }
}

pub(crate) fn connect_options(config: &ConnectionConfig) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(config.host.as_deref().unwrap_or("localhost"))
        .port(config.effective_port().unwrap_or(3306))
        .ssl_mode(ssl_mode(config.effective_tls_mode()));

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
        options = options.ssl_ca_from_pem(ca.as_bytes().to_vec());
    }
    if let Some(cert) = &config.secrets.tls_client_cert {
        options = options.ssl_client_cert_from_pem(cert.as_bytes());
    }
    if let Some(key) = &config.secrets.tls_client_key {
        options = options.ssl_client_key_from_pem(key.as_bytes());
    }

    options.disable_statement_logging()
}

async fn connect(config: &ConnectionConfig) -> Result<MySqlConnection, EngineError> {
    let options = connect_options(config);
    with_deadline(Some(config.connect_timeout), "connect", async {
        options
            .connect()
            .await
            .map_err(|e| classify(&e, Phase::Connect))
    })
    .await
}

fn decode_row(row: &MySqlRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_unchecked::<Option<String>, _>(index) {
            Ok(Some(text)) => text_value_to_json(column.type_info().name(), text),
            Ok(None) => Value::Null,
            // Binary columns that are not valid UTF-8
            Err(_) => match row.try_get_unchecked::<Option<Vec<u8>>, _>(index) {
                Ok(Some(bytes)) => bytes_to_json(&bytes),
                _ => Value::Null,
            },
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

async fn run_statement(
    connection: &mut MySqlConnection,
    sql: &str,
) -> Result<ResultSet, EngineError> {
    let stream = sqlx::raw_sql(sql).fetch_many(&mut *connection);
    let mut result = drain_results(stream, MySqlQueryResult::rows_affected, decode_row)
        .await
        .map_err(|e| classify(&e, Phase::Execute))?;

    if result.data.is_empty() {
        result.columns = described_columns(&mut *connection, sql).await;
    }
    Ok(result)
}

async fn collect_columns(
    connection: &mut MySqlConnection,
    schema: &mut NormalizedSchema,
) -> Result<(), sqlx::Error> {
    let rows = sqlx::query(COLUMNS_QUERY)
        .fetch_all(&mut *connection)
        .await?;

    for row in rows {
        let table: String = row.try_get("table_name")?;
        let column = ColumnSchema::new(
            row.try_get::<String, _>("column_name")?,
            row.try_get::<String, _>("data_type")?,
        )
        .with_nullable(row.try_get::<String, _>("is_nullable")? == "YES")
        .with_default(row.try_get("column_default")?)
        .with_key(row.try_get("column_key")?);
        schema.push_column(&table, column);
    }

    Ok(())
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    fn family(&self) -> EngineFamily {
        EngineFamily::Mysql
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTest {
        let mut connection = match connect(config).await {
            Ok(connection) => connection,
            Err(e) => return ConnectionTest::failed(e),
        };

        let outcome = with_deadline(config.query_timeout, "connection test", async {
            sqlx::query("SELECT 1")
                .execute(&mut connection)
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
                tracing::debug!("Introspected {} MySQL tables", schema.tables.len());
                schema
            }
            Err(e) => {
                NormalizedSchema::degraded(self.family(), classify(&e, Phase::Execute).message())
            }
        }
    }

    fn statistics_sql(&self) -> &'static str {
        "SELECT TABLE_SCHEMA AS schema_name, TABLE_NAME AS table_name, \
         TABLE_ROWS AS approximate_rows, DATA_LENGTH AS data_bytes \
         FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys') \
         ORDER BY TABLE_SCHEMA, TABLE_NAME"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TlsSettings;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(TlsMode::Disable), MySqlSslMode::Disabled));
        assert!(matches!(ssl_mode(TlsMode::Allow), MySqlSslMode::Preferred));
        assert!(matches!(ssl_mode(TlsMode::Require), MySqlSslMode::Required));
        assert!(matches!(
            ssl_mode(TlsMode::VerifyFull),
            MySqlSslMode::VerifyIdentity
        ));
    }

    #[test]
    fn test_connect_options_from_config() {
        let config = ConnectionConfig::network(EngineFamily::Mysql, "db.internal")
            .with_database("shop")
            .with_username("app")
            .with_tls(TlsSettings {
                enabled: true,
                mode: TlsMode::VerifyCa,
                reject_unauthorized: true,
            });

        let options = connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 3306);
        assert_eq!(options.get_database(), Some("shop"));
        assert_eq!(options.get_username(), "app");
        assert!(matches!(options.get_ssl_mode(), MySqlSslMode::VerifyCa));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_reported_not_raised() {
        let config = ConnectionConfig::network(EngineFamily::Mysql, "127.0.0.1")
            .with_port(1)
            .with_connect_timeout(std::time::Duration::from_secs(2));

        let outcome = MySqlAdapter.execute_query(&config, "SELECT 1").await;
        assert!(!outcome.is_success());

        let schema = MySqlAdapter.introspect_schema(&config).await;
        assert_eq!(schema.database_type, EngineFamily::Mysql);
        assert!(schema.error.is_some());
    }
}
