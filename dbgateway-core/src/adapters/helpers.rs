//! Helper utilities shared by the engine adapters.
//!
//! - error classification onto [`EngineError`]
//! - deadlines around connect and statement futures
//! - draining a raw multi-result stream into a [`ResultSet`]
//! - recovering column names of statements that returned no rows

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Number, Value};
use sqlx::{Column, Either, Row};

use crate::error::EngineError;
use crate::models::ResultSet;

/// Where in an operation an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Establishing the connection (handshake, auth, TLS)
    Connect,
    /// Running a statement on an open connection
    Execute,
}

/// Maps a driver error onto the uniform engine taxonomy.
///
/// SQLSTATE `28000`/`28P01` mean rejected credentials on both network
/// engines; `57014` is a server-side statement cancellation.
pub(crate) fn classify(error: &sqlx::Error, phase: Phase) -> EngineError {
    match error {
        sqlx::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => EngineError::ConnectionRefused(io.to_string()),
            std::io::ErrorKind::TimedOut => EngineError::Timeout(io.to_string()),
            _ => EngineError::ConnectionFailed(io.to_string()),
        },
        sqlx::Error::PoolTimedOut => EngineError::Timeout(error.to_string()),
        sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => {
            EngineError::ConnectionFailed(error.to_string())
        }
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("28000" | "28P01") => EngineError::AuthenticationFailed(message),
                Some("57014") => EngineError::Timeout(message),
                _ if phase == Phase::Connect => EngineError::ConnectionFailed(message),
                _ => EngineError::Execution(message),
            }
        }
        other => match phase {
            Phase::Connect => EngineError::ConnectionFailed(other.to_string()),
            Phase::Execute => EngineError::Execution(other.to_string()),
        },
    }
}

/// Runs `fut` under an optional deadline, reporting expiry as `Timeout`.
pub(crate) async fn with_deadline<T, F>(
    limit: Option<Duration>,
    what: &str,
    fut: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(EngineError::Timeout(format!(
                "{what} did not complete within {}ms",
                limit.as_millis()
            )))
        }),
        None => fut.await,
    }
}

/// Closes an engine connection, logging (not returning) failures.
pub(crate) async fn release<C: sqlx::Connection>(connection: C) {
    if let Err(e) = connection.close().await {
        tracing::debug!("Closing engine connection failed: {}", e);
    }
}

/// Drains the result stream of a raw (possibly multi-statement) execution.
///
/// Rows of every statement are collected in order; column names come from
/// the first row seen (see [`described_columns`] for empty results). `row_count` is the number of rows returned, or the
/// total of affected rows when no statement produced any.
pub(crate) async fn drain_results<Q, R, A, D>(
    mut stream: BoxStream<'_, Result<Either<Q, R>, sqlx::Error>>,
    affected: A,
    decode_row: D,
) -> Result<ResultSet, sqlx::Error>
where
    R: Row,
    A: Fn(&Q) -> u64,
    D: Fn(&R) -> Map<String, Value>,
{
    let mut result = ResultSet::default();
    let mut rows_affected: u64 = 0;

    while let Some(item) = stream.next().await {
        match item? {
            Either::Left(done) => {
                rows_affected = rows_affected.saturating_add(affected(&done));
            }
            Either::Right(row) => {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                result.data.push(decode_row(&row));
            }
        }
    }

    result.row_count = if result.data.is_empty() {
        rows_affected
    } else {
        u64::try_from(result.data.len()).unwrap_or(u64::MAX)
    };

    Ok(result)
}

/// Column names of a statement, read from its prepared description.
///
/// Used when execution produced no rows. Statement text the engine cannot
/// prepare on its own (several statements, some DDL) yields no columns.
pub(crate) fn described_columns<'c, E>(executor: E, sql: &'c str) -> BoxFuture<'c, Vec<String>>
where
    E: sqlx::Executor<'c> + 'c,
{
    Box::pin(async move {
        match executor.describe(sql).await {
            Ok(description) => description
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            Err(e) => {
                tracing::debug!("Statement could not be described for column names: {}", e);
                Vec::new()
            }
        }
    })
}

/// Converts a text-protocol value to JSON using the column's type name.
///
/// Both network engines return every value as text when a statement runs
/// through the simple query path, so typing is recovered from the name.
pub(crate) fn text_value_to_json(type_name: &str, text: String) -> Value {
    let upper = type_name.to_ascii_uppercase();

    if upper == "BOOL" || upper == "BOOLEAN" {
        return match text.as_str() {
            "t" | "true" | "1" => Value::Bool(true),
            "f" | "false" | "0" => Value::Bool(false),
            _ => Value::String(text),
        };
    }

    if upper.contains("INT") || upper == "OID" || upper == "YEAR" {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Number(n.into());
        }
        if let Ok(n) = text.parse::<u64>() {
            return Value::Number(n.into());
        }
        return Value::String(text);
    }

    if upper.starts_with("FLOAT") || upper == "DOUBLE" || upper == "REAL" {
        return text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::String(text), Value::Number);
    }

    if upper == "JSON" || upper == "JSONB" {
        return serde_json::from_str(&text).unwrap_or(Value::String(text));
    }

    // NUMERIC/DECIMAL stay strings to keep their precision
    Value::String(text)
}

/// Renders binary data as a tagged base64 string.
pub(crate) fn bytes_to_json(bytes: &[u8]) -> Value {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Value::String(format!("base64:{encoded}"))
}

/// Keeps the strongest constraint seen for a column (PK > UNIQUE > FK).
pub(crate) fn stronger_constraint(current: Option<String>, candidate: Option<String>) -> Option<String> {
    fn rank(constraint: Option<&str>) -> u8 {
        match constraint {
            Some("PRIMARY KEY") => 3,
            Some("UNIQUE") => 2,
            Some(_) => 1,
            None => 0,
        }
    }
    if rank(candidate.as_deref()) > rank(current.as_deref()) {
        candidate
    } else {
        current
    }
}

/// Quotes an identifier with double quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
