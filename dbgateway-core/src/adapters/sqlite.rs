//! SQLite engine adapter.
//!
//! The target is a database file. Opening never creates a missing file, so
//! a wrong path fails the connection test instead of silently producing an
//! empty database. File engines have no connect or statement deadline;
//! OS-level I/O errors are the only bound.
//!
//! # SQLite System Tables
//! - `sqlite_master`: schema definitions for all database objects
//! - `PRAGMA table_info()`: column information for a table

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteQueryResult, SqliteRow};
use sqlx::{Column, ConnectOptions, Row, TypeInfo, ValueRef};

use super::helpers::{
    Phase, bytes_to_json, classify, described_columns, drain_results, quote_identifier, release,
};
use super::{ConnectionConfig, EngineAdapter};
use crate::error::EngineError;
use crate::models::{ColumnSchema, ConnectionTest, EngineFamily, NormalizedSchema, QueryOutcome};

const TABLES_QUERY: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// SQLite adapter (engine family C).
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

async fn connect(config: &ConnectionConfig) -> Result<SqliteConnection, EngineError> {
    let path = config.file_path.as_deref().unwrap_or_default();
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .disable_statement_logging()
        .connect()
        .await
        .map_err(|e| match e {
            // Opening the file is the whole handshake
            sqlx::Error::Database(db) => EngineError::ConnectionRefused(db.message().to_string()),
            other => EngineError::ConnectionRefused(other.to_string()),
        })
}

fn decode_value(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    match type_name.as_str() {
        "INTEGER" => row
            .try_get_unchecked::<i64, _>(index)
            .map_or(Value::Null, Value::from),
        "REAL" => row
            .try_get_unchecked::<f64, _>(index)
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map_or(Value::Null, |bytes| bytes_to_json(&bytes)),
        _ => row
            .try_get_unchecked::<String, _>(index)
            .map_or(Value::Null, Value::String),
    }
}

fn decode_row(row: &SqliteRow) -> Map<String, Value> {
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode_value(row, column.ordinal())))
        .collect()
}

async fn collect_columns(
    connection: &mut SqliteConnection,
    schema: &mut NormalizedSchema,
) -> Result<(), sqlx::Error> {
    let tables: Vec<String> = sqlx::query_scalar(TABLES_QUERY)
        .fetch_all(&mut *connection)
        .await?;

    for table in tables {
        let pragma = format!("PRAGMA table_info({})", quote_identifier(&table));
        let rows = sqlx::query(&pragma).fetch_all(&mut *connection).await?;

        for row in rows {
            let not_null: i64 = row.try_get("notnull")?;
            let pk: i64 = row.try_get("pk")?;
            let column = ColumnSchema::new(
                row.try_get::<String, _>("name")?,
                row.try_get::<String, _>("type")?,
            )
            .with_nullable(not_null == 0)
            .with_default(row.try_get("dflt_value")?)
            .with_key((pk > 0).then(|| "PRI".to_string()));
            schema.push_column(&table, column);
        }
    }

    Ok(())
}

#[async_trait]
impl EngineAdapter for SqliteAdapter {
    fn family(&self) -> EngineFamily {
        EngineFamily::Sqlite
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTest {
        match connect(config).await {
            Ok(connection) => {
                release(connection).await;
                ConnectionTest::ok()
            }
            Err(e) => ConnectionTest::failed(e),
        }
    }

    async fn execute_query(&self, config: &ConnectionConfig, sql: &str) -> QueryOutcome {
        let mut connection = match connect(config).await {
            Ok(connection) => connection,
            Err(e) => return QueryOutcome::Failure(e),
        };

        let stream = sqlx::raw_sql(sql).fetch_many(&mut connection);
        let mut outcome = drain_results(stream, SqliteQueryResult::rows_affected, decode_row).await;
        if let Ok(rows) = &mut outcome
            && rows.data.is_empty()
        {
            rows.columns = described_columns(&mut connection, sql).await;
        }
        release(connection).await;

        match outcome {
            Ok(rows) => QueryOutcome::Success(rows),
            Err(e) => QueryOutcome::Failure(classify(&e, Phase::Execute)),
        }
    }

    async fn introspect_schema(&self, config: &ConnectionConfig) -> NormalizedSchema {
        let mut connection = match connect(config).await {
            Ok(connection) => connection,
            Err(e) => return NormalizedSchema::degraded(self.family(), e.message()),
        };

        let mut schema = NormalizedSchema::new(self.family(), config.file_path.clone());
        let collected = collect_columns(&mut connection, &mut schema).await;
        release(connection).await;

        match collected {
            Ok(()) => {
                tracing::debug!("Introspected {} SQLite tables", schema.tables.len());
                schema
            }
            Err(e) => {
                NormalizedSchema::degraded(self.family(), classify(&e, Phase::Execute).message())
            }
        }
    }

    fn statistics_sql(&self) -> &'static str {
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
    }
}
