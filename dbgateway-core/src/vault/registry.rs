//! Owner-scoped connection registry.
//!
//! # Security
//! - Every read, update and delete filters on `(id, user_id)`; a record
//!   owned by someone else is indistinguishable from a missing one
//! - Each secret column is sealed with its own cipher call on write and
//!   opened on owner-scoped reads only; list reads never select them

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::uuid_column;
use crate::Result;
use crate::error::GatewayError;
use crate::models::{
    Connection, ConnectionDraft, ConnectionSummary, ConnectionUpdate, TlsSettings,
};
use crate::security::{Cipher, ConnectionSecrets};
use crate::validation::{validate_draft, validate_stored};

const SUMMARY_COLUMNS: &str = "id, user_id, name, type, host, port, database, username, \
     file_path, ssl_enabled, ssl_mode, ssl_reject_unauthorized, created_at, updated_at";

const SECRET_COLUMNS: &str = "password_encrypted, ssl_ca_cert, ssl_client_cert, ssl_client_key";

/// Connection records of all users.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    pool: SqlitePool,
    cipher: Arc<Cipher>,
}

fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> GatewayError {
    move |e| GatewayError::storage(context, e)
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| GatewayError::storage(format!("Failed to decode connections.{name}"), e))
}

fn summary_from_row(row: &SqliteRow) -> Result<ConnectionSummary> {
    let family: String = column(row, "type")?;
    let mode: String = column(row, "ssl_mode")?;
    let port: Option<i64> = column(row, "port")?;

    Ok(ConnectionSummary {
        id: uuid_column(row, "id").map_err(storage("Failed to decode connections.id"))?,
        owner_id: column(row, "user_id")?,
        name: column(row, "name")?,
        engine_family: family.parse()?,
        host: column(row, "host")?,
        port: port.and_then(|p| u16::try_from(p).ok()),
        database_name: column(row, "database")?,
        username: column(row, "username")?,
        file_path: column(row, "file_path")?,
        tls: TlsSettings {
            enabled: column(row, "ssl_enabled")?,
            mode: mode.parse()?,
            reject_unauthorized: column(row, "ssl_reject_unauthorized")?,
        },
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    })
}

impl ConnectionRegistry {
    /// Creates a registry over the vault pool.
    pub fn new(pool: SqlitePool, cipher: Arc<Cipher>) -> Self {
        Self { pool, cipher }
    }

    fn seal(&self, value: Option<&str>) -> Result<Option<String>> {
        value.map(|plain| self.cipher.encrypt(plain)).transpose()
    }

    fn open_secret(&self, row: &SqliteRow, name: &str) -> Result<Option<Zeroizing<String>>> {
        let sealed: Option<String> = column(row, name)?;
        sealed
            .map(|token| {
                self.cipher
                    .decrypt(&token)
                    .map_err(|_| GatewayError::decryption(format!("stored {name} could not be decrypted")))
            })
            .transpose()
    }

    /// Lists a user's connections, newest first, without any secrets.
    ///
    /// # Errors
    /// Returns error if the vault cannot be read
    pub async fn list_for_user(&self, owner_id: &str) -> Result<Vec<ConnectionSummary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM connections WHERE user_id = ? \
             ORDER BY created_at DESC, rowid DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Failed to list connections"))?;

        rows.iter().map(summary_from_row).collect()
    }

    /// Fetches one connection with its secrets decrypted.
    ///
    /// # Errors
    /// Returns `NotFound` if no row matches `(id, owner_id)` (including rows
    /// owned by someone else) and `Decryption` if a stored secret is corrupt
    pub async fn get_by_id(&self, id: Uuid, owner_id: &str) -> Result<Connection> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS}, {SECRET_COLUMNS} FROM connections \
             WHERE id = ? AND user_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(id.hyphenated())
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to read connection"))?
            .ok_or(GatewayError::NotFound {
                entity: "Connection",
            })?;

        let summary = summary_from_row(&row)?;
        let secrets = ConnectionSecrets {
            password: self.open_secret(&row, "password_encrypted")?,
            tls_ca_cert: self.open_secret(&row, "ssl_ca_cert")?,
            tls_client_cert: self.open_secret(&row, "ssl_client_cert")?,
            tls_client_key: self.open_secret(&row, "ssl_client_key")?,
        };

        Ok(Connection {
            id: summary.id,
            owner_id: summary.owner_id,
            name: summary.name,
            family: summary.engine_family,
            host: summary.host,
            port: summary.port,
            database: summary.database_name,
            username: summary.username,
            file_path: summary.file_path,
            tls: summary.tls,
            secrets,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
        })
    }

    /// Stores a new connection, sealing each secret field.
    ///
    /// # Errors
    /// Returns `Validation` for an inconsistent draft, or a storage error
    pub async fn save(&self, draft: &ConnectionDraft) -> Result<ConnectionSummary> {
        validate_draft(draft)?;

        let [password, ca_cert, client_cert, client_key] = draft.secrets.fields();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let sql = format!(
            "INSERT INTO connections (id, user_id, name, type, host, port, database, username, \
             file_path, ssl_enabled, ssl_mode, ssl_reject_unauthorized, created_at, updated_at, \
             {SECRET_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {SUMMARY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.hyphenated())
            .bind(draft.owner_id.as_str())
            .bind(draft.name.trim())
            .bind(draft.family.as_str())
            .bind(draft.host.as_deref())
            .bind(draft.port.map(i64::from))
            .bind(draft.database.as_deref())
            .bind(draft.username.as_deref())
            .bind(draft.file_path.as_deref())
            .bind(draft.tls.enabled)
            .bind(draft.tls.mode.as_str())
            .bind(draft.tls.reject_unauthorized)
            .bind(now)
            .bind(now)
            .bind(self.seal(password.1)?)
            .bind(self.seal(ca_cert.1)?)
            .bind(self.seal(client_cert.1)?)
            .bind(self.seal(client_key.1)?)
            .fetch_one(&self.pool)
            .await
            .map_err(storage("Failed to save connection"))?;

        let summary = summary_from_row(&row)?;
        tracing::info!(
            "Saved {} connection {} for user {}",
            summary.engine_family,
            summary.id,
            summary.owner_id
        );
        Ok(summary)
    }

    /// Applies a partial update to an owned connection.
    ///
    /// Only present fields are written; `updated_at` is always touched.
    ///
    /// # Errors
    /// Returns `NoFieldsToUpdate` for an empty update and
    /// `NotFoundOrUnauthorized` when the write matched no `(id, owner_id)` row,
    /// and `Validation` (with nothing written) when the updated record would
    /// no longer fit its engine family
    pub async fn update(
        &self,
        id: Uuid,
        owner_id: &str,
        update: &ConnectionUpdate,
    ) -> Result<ConnectionSummary> {
        if update.is_empty() {
            return Err(GatewayError::NoFieldsToUpdate);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE connections SET ");
        let mut set = builder.separated(", ");

        if let Some(name) = &update.name {
            set.push("name = ").push_bind_unseparated(name.trim().to_string());
        }
        if let Some(host) = &update.host {
            set.push("host = ").push_bind_unseparated(host.clone());
        }
        if let Some(port) = update.port {
            set.push("port = ").push_bind_unseparated(i64::from(port));
        }
        if let Some(database) = &update.database {
            set.push("database = ").push_bind_unseparated(database.clone());
        }
        if let Some(username) = &update.username {
            set.push("username = ").push_bind_unseparated(username.clone());
        }
        if let Some(path) = &update.file_path {
            set.push("file_path = ").push_bind_unseparated(path.clone());
        }
        if let Some(enabled) = update.tls_enabled {
            set.push("ssl_enabled = ").push_bind_unseparated(enabled);
        }
        if let Some(mode) = update.tls_mode {
            set.push("ssl_mode = ").push_bind_unseparated(mode.as_str());
        }
        if let Some(reject) = update.tls_reject_unauthorized {
            set.push("ssl_reject_unauthorized = ").push_bind_unseparated(reject);
        }

        for (secret_column, value) in [
            ("password_encrypted", &update.password),
            ("ssl_ca_cert", &update.tls_ca_cert),
            ("ssl_client_cert", &update.tls_client_cert),
            ("ssl_client_key", &update.tls_client_key),
        ] {
            if let Some(secret) = value {
                let sealed = self.cipher.encrypt(secret)?;
                set.push(format!("{secret_column} = ")).push_bind_unseparated(sealed);
            }
        }

        set.push("updated_at = ").push_bind_unseparated(Utc::now());

        builder
            .push(" WHERE id = ")
            .push_bind(id.hyphenated())
            .push(" AND user_id = ")
            .push_bind(owner_id.to_string())
            .push(" RETURNING ")
            .push(SUMMARY_COLUMNS);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage("Failed to begin connection update"))?;

        let row = builder
            .build()
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("Failed to update connection"))?
            .ok_or(GatewayError::NotFoundOrUnauthorized)?;
        let summary = summary_from_row(&row)?;

        if let Err(e) = validate_stored(&summary) {
            tx.rollback()
                .await
                .map_err(storage("Failed to roll back connection update"))?;
            tracing::debug!("Rejected update of connection {}: {}", id, e);
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(storage("Failed to commit connection update"))?;

        tracing::info!(
            "Updated connection {} ({})",
            id,
            update.present_fields().join(", ")
        );
        Ok(summary)
    }

    /// Deletes an owned connection.
    ///
    /// # Returns
    /// `true` if a row was removed, `false` if none matched `(id, owner_id)`
    ///
    /// # Errors
    /// Returns error if the vault cannot be written
    pub async fn delete(&self, id: Uuid, owner_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM connections WHERE id = ? AND user_id = ? RETURNING id")
            .bind(id.hyphenated())
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to delete connection"))?
            .is_some();

        if deleted {
            tracing::info!("Deleted connection {}", id);
        }
        Ok(deleted)
    }
}
