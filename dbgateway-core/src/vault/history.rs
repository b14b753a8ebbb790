//! Append-only query history.
//!
//! History is diagnostic: [`QueryHistoryStore::record`] writes in the
//! background and only logs failures.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{page_bounds, uuid_column};
use crate::Result;
use crate::error::GatewayError;
use crate::models::{NewQueryHistory, Page, QueryHistoryEntry};

/// Page used when a history listing does not ask for one.
pub const DEFAULT_HISTORY_PAGE: Page = Page {
    limit: 10,
    offset: 0,
};

const ENTRY_COLUMNS: &str = "id, user_id, connection_id, question, generated_sql, result, \
     execution_time, success, error_message, created_at";

/// Per-user record of question/statement attempts.
#[derive(Debug, Clone)]
pub struct QueryHistoryStore {
    pool: SqlitePool,
}

fn entry_from_row(row: &SqliteRow) -> std::result::Result<QueryHistoryEntry, sqlx::Error> {
    let result: Option<String> = row.try_get("result")?;
    Ok(QueryHistoryEntry {
        id: uuid_column(row, "id")?,
        user_id: row.try_get("user_id")?,
        connection_id: uuid_column(row, "connection_id")?,
        question: row.try_get("question")?,
        generated_sql: row.try_get("generated_sql")?,
        // A result that no longer parses is surfaced as a plain string
        result: result.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text))),
        execution_time_ms: row.try_get("execution_time")?,
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

impl QueryHistoryStore {
    /// Creates a store over the vault pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists one attempt and returns the stored entry.
    ///
    /// # Errors
    /// Returns error if the result cannot be serialized or the write fails
    pub async fn save(&self, entry: NewQueryHistory) -> Result<QueryHistoryEntry> {
        let result = entry
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| GatewayError::serialization("Failed to serialize query result", e))?;

        let sql = format!(
            "INSERT INTO query_history ({ENTRY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().hyphenated())
            .bind(entry.user_id.as_str())
            .bind(entry.connection_id.hyphenated())
            .bind(entry.question.as_str())
            .bind(entry.generated_sql.as_str())
            .bind(result)
            .bind(entry.execution_time_ms)
            .bind(entry.success)
            .bind(entry.error_message.as_deref())
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to save query history", e))?;

        entry_from_row(&row).map_err(|e| GatewayError::storage("Failed to decode query history", e))
    }

    /// Saves an entry in the background.
    ///
    /// The caller never observes a failure; it is logged under
    /// `dbgateway::history` and dropped. The handle is only for callers
    /// (mostly tests and shutdown paths) that want to wait for the write.
    pub fn record(&self, entry: NewQueryHistory) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let user_id = entry.user_id.clone();
            if let Err(e) = store.save(entry).await {
                tracing::error!(
                    target: "dbgateway::history",
                    "Could not save query history for user {}: {}",
                    user_id,
                    e
                );
            }
        })
    }

    /// Lists a user's history, newest first.
    ///
    /// # Errors
    /// Returns error if the vault cannot be read
    pub async fn list(&self, user_id: &str, page: Option<Page>) -> Result<Vec<QueryHistoryEntry>> {
        let (limit, offset) = page_bounds(page.unwrap_or(DEFAULT_HISTORY_PAGE));
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM query_history WHERE user_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to list query history", e))?;

        rows.iter()
            .map(entry_from_row)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| GatewayError::storage("Failed to decode query history", e))
    }

    /// Fetches one owned entry.
    ///
    /// # Errors
    /// Returns `NotFound` if the entry does not exist or belongs to someone else
    pub async fn get(&self, id: Uuid, user_id: &str) -> Result<QueryHistoryEntry> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM query_history WHERE id = ? AND user_id = ?");
        let row = sqlx::query(&sql)
            .bind(id.hyphenated())
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to read query history", e))?
            .ok_or(GatewayError::NotFound {
                entity: "Query history entry",
            })?;

        entry_from_row(&row).map_err(|e| GatewayError::storage("Failed to decode query history", e))
    }

    /// Deletes one owned entry; `false` if nothing matched.
    ///
    /// # Errors
    /// Returns error if the vault cannot be written
    pub async fn delete(&self, id: Uuid, user_id: &str) -> Result<bool> {
        let deleted =
            sqlx::query("DELETE FROM query_history WHERE id = ? AND user_id = ? RETURNING id")
                .bind(id.hyphenated())
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| GatewayError::storage("Failed to delete query history", e))?
                .is_some();
        Ok(deleted)
    }
}
