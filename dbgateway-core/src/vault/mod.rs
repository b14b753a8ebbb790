//! SQLite-backed vault holding connections, query history and audit logs.
//!
//! # Tables
//! - `connections`: one row per registered connection, secret columns sealed
//! - `query_history`: append-only record of executed questions
//! - `audit_logs`: append-only record of security-relevant actions
//!
//! All list reads are newest first; `rowid` breaks ties between rows that
//! share a timestamp.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use uuid::Uuid;
use uuid::fmt::Hyphenated;

use crate::Result;
use crate::error::{GatewayError, redact_database_url};
use crate::security::Cipher;

mod audit;
mod history;
mod registry;

pub use audit::{AuditRecorder, AuditedAction, DEFAULT_AUDIT_PAGE, RequestContext, ResponseOutcome};
pub use history::{DEFAULT_HISTORY_PAGE, QueryHistoryStore};
pub use registry::ConnectionRegistry;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    host TEXT,
    port INTEGER,
    database TEXT,
    username TEXT,
    password_encrypted TEXT,
    file_path TEXT,
    ssl_enabled BOOLEAN NOT NULL DEFAULT 0,
    ssl_mode TEXT NOT NULL DEFAULT 'prefer',
    ssl_reject_unauthorized BOOLEAN NOT NULL DEFAULT 1,
    ssl_ca_cert TEXT,
    ssl_client_cert TEXT,
    ssl_client_key TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_connections_user ON connections (user_id, created_at);

CREATE TABLE IF NOT EXISTS query_history (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    question TEXT NOT NULL,
    generated_sql TEXT NOT NULL,
    result TEXT,
    execution_time REAL,
    success BOOLEAN NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_history_user ON query_history (user_id, created_at);

CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT,
    action TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT,
    details TEXT,
    ip_address TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_user ON audit_logs (user_id, created_at);
";

/// Handle on the vault database.
///
/// Cheap to clone; all stores created from one vault share its pool.
#[derive(Debug, Clone)]
pub struct Vault {
    pool: SqlitePool,
}

impl Vault {
    /// Opens (creating if needed) the vault and ensures its tables exist.
    ///
    /// `sqlite::memory:` URLs get a single, never-recycled connection so the
    /// in-memory database lives as long as the vault.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the database cannot be opened
    pub async fn open(url: &str) -> Result<Self> {
        if !url.starts_with("sqlite:") {
            return Err(GatewayError::configuration(format!(
                "Vault URL must use the sqlite scheme, got {}",
                redact_database_url(url)
            )));
        }

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| {
                GatewayError::configuration(format!(
                    "Invalid vault URL {}: {e}",
                    redact_database_url(url)
                ))
            })?
            .create_if_missing(true)
            .disable_statement_logging();

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::storage("Failed to open vault database", e))?;

        let vault = Self { pool };
        vault.initialize().await?;
        tracing::debug!("Vault ready at {}", redact_database_url(url));
        Ok(vault)
    }

    /// Opens a private in-memory vault.
    ///
    /// # Errors
    /// Returns error if SQLite cannot be initialized
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to create vault tables", e))?;
        Ok(())
    }

    /// Connection registry sealing secrets with `cipher`.
    pub fn registry(&self, cipher: Arc<Cipher>) -> ConnectionRegistry {
        ConnectionRegistry::new(self.pool.clone(), cipher)
    }

    /// Query history store.
    pub fn history(&self) -> QueryHistoryStore {
        QueryHistoryStore::new(self.pool.clone())
    }

    /// Audit recorder.
    pub fn audit(&self) -> AuditRecorder {
        AuditRecorder::new(self.pool.clone())
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Reads a hyphenated UUID column.
pub(crate) fn uuid_column(row: &SqliteRow, column: &str) -> std::result::Result<Uuid, sqlx::Error> {
    row.try_get::<Hyphenated, _>(column).map(Hyphenated::into_uuid)
}

/// Clamps a page window to SQLite's signed integer range.
pub(crate) fn page_bounds(page: crate::models::Page) -> (i64, i64) {
    (i64::from(page.limit), i64::from(page.offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_tables() {
        let vault = Vault::in_memory().await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(vault.pool())
        .await
        .unwrap();

        assert_eq!(tables, vec!["audit_logs", "connections", "query_history"]);
    }

    #[tokio::test]
    async fn test_open_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("vault.db").display());

        let first = Vault::open(&url).await.unwrap();
        first.close().await;
        let second = Vault::open(&url).await.unwrap();
        second.close().await;
    }

    #[tokio::test]
    async fn test_open_rejects_bad_url() {
        let result = Vault::open("postgres://user:pw@localhost/db").await;
        let err = result.unwrap_err();
        assert!(!err.to_string().contains(":pw@"));
    }
}
