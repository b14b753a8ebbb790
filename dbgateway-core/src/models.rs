//! Data model shared by the gateway, the vault and the service layer.
//!
//! Serialized shapes use camelCase keys. Types that carry secrets
//! ([`Connection`], [`ConnectionDraft`], [`ConnectionUpdate`]) are
//! deliberately not `Serialize`; [`ConnectionSummary`] is their
//! outward-facing form.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{EngineError, GatewayError};
use crate::security::ConnectionSecrets;

// =============================================================================
// Engine families and TLS
// =============================================================================

/// Supported engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFamily {
    /// PostgreSQL (network, catalog-view introspection)
    #[serde(alias = "postgresql")]
    Postgres,
    /// MySQL (network, information-schema introspection)
    Mysql,
    /// SQLite (file backed, pragma introspection)
    #[serde(alias = "sqlite3")]
    Sqlite,
}

impl EngineFamily {
    /// Wire tag stored in the vault.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Whether connections of this family point at a file instead of a host.
    pub fn is_file_based(self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Port used when a network connection leaves it unset.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::Mysql => Some(3306),
            Self::Sqlite => None,
        }
    }
}

impl std::fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineFamily {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            _ => Err(GatewayError::UnsupportedEngine {
                engine: s.to_string(),
            }),
        }
    }
}

/// TLS negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Never negotiate TLS
    Disable,
    /// Try plaintext first, fall back to TLS
    Allow,
    /// Try TLS first, fall back to plaintext
    #[default]
    Prefer,
    /// Require TLS without verifying the server
    Require,
    /// Require TLS and verify the certificate chain
    VerifyCa,
    /// Require TLS and verify the chain and host name
    VerifyFull,
}

impl TlsMode {
    /// All accepted modes in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Disable,
        Self::Allow,
        Self::Prefer,
        Self::Require,
        Self::VerifyCa,
        Self::VerifyFull,
    ];

    /// Wire tag stored in the vault.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| {
                GatewayError::invalid_field(
                    "tlsMode",
                    format!(
                        "must be one of disable, allow, prefer, require, verify-ca, verify-full (got '{s}')"
                    ),
                )
            })
    }
}

/// TLS switches of a connection (certificates live in the secrets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    /// Whether TLS is requested at all
    #[serde(rename = "tlsEnabled")]
    pub enabled: bool,
    /// Negotiation mode when enabled
    #[serde(rename = "tlsMode")]
    pub mode: TlsMode,
    /// Whether certificate verification failures abort the connection
    #[serde(rename = "tlsRejectUnauthorized")]
    pub reject_unauthorized: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TlsMode::Prefer,
            reject_unauthorized: true,
        }
    }
}

// =============================================================================
// Connection records
// =============================================================================

/// A stored connection with its secrets decrypted.
///
/// Only produced by an owner-scoped vault read. `Debug` is safe to log
/// because [`ConnectionSecrets`] redacts itself.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Record identifier
    pub id: Uuid,
    /// Owning user; the sole authorization key
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Engine family
    pub family: EngineFamily,
    /// Network host (families A and B)
    pub host: Option<String>,
    /// Network port (families A and B)
    pub port: Option<u16>,
    /// Database name (families A and B)
    pub database: Option<String>,
    /// Login name (families A and B)
    pub username: Option<String>,
    /// Database file (family C)
    pub file_path: Option<String>,
    /// TLS switches
    pub tls: TlsSettings,
    /// Decrypted secrets
    pub secrets: ConnectionSecrets,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Secret-free view of this record.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id,
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            engine_family: self.family,
            host: self.host.clone(),
            port: self.port,
            database_name: self.database.clone(),
            username: self.username.clone(),
            file_path: self.file_path.clone(),
            tls: self.tls,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Returns a copy with the update's present fields applied.
    ///
    /// Used to test connectivity of the merged record before it is written.
    pub fn merged_with(&self, update: &ConnectionUpdate) -> Self {
        let mut merged = self.clone();
        if let Some(name) = &update.name {
            merged.name.clone_from(name);
        }
        if update.host.is_some() {
            merged.host.clone_from(&update.host);
        }
        if update.port.is_some() {
            merged.port = update.port;
        }
        if update.database.is_some() {
            merged.database.clone_from(&update.database);
        }
        if update.username.is_some() {
            merged.username.clone_from(&update.username);
        }
        if update.file_path.is_some() {
            merged.file_path.clone_from(&update.file_path);
        }
        if let Some(enabled) = update.tls_enabled {
            merged.tls.enabled = enabled;
        }
        if let Some(mode) = update.tls_mode {
            merged.tls.mode = mode;
        }
        if let Some(reject) = update.tls_reject_unauthorized {
            merged.tls.reject_unauthorized = reject;
        }
        if update.password.is_some() {
            merged.secrets.password.clone_from(&update.password);
        }
        if update.tls_ca_cert.is_some() {
            merged.secrets.tls_ca_cert.clone_from(&update.tls_ca_cert);
        }
        if update.tls_client_cert.is_some() {
            merged
                .secrets
                .tls_client_cert
                .clone_from(&update.tls_client_cert);
        }
        if update.tls_client_key.is_some() {
            merged.secrets.tls_client_key.clone_from(&update.tls_client_key);
        }
        merged
    }
}

/// Outward-facing connection record without any secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Record identifier
    pub id: Uuid,
    /// Owning user
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Engine family
    pub engine_family: EngineFamily,
    /// Network host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Network port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Login name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Database file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// TLS switches
    #[serde(flatten)]
    pub tls: TlsSettings,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a connection.
///
/// # Example
/// ```rust
/// use dbgateway_core::models::{ConnectionDraft, EngineFamily, TlsMode};
///
/// let draft = ConnectionDraft::new("user-1", "reporting", EngineFamily::Postgres)
///     .with_host("db.internal")
///     .with_database("reports")
///     .with_username("reader")
///     .with_password("hunter2")
///     .with_tls(TlsMode::Require);
///
/// assert!(draft.tls.enabled);
/// assert!(!format!("{draft:?}").contains("hunter2"));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionDraft {
    /// Owning user
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Engine family
    pub family: EngineFamily,
    /// Network host
    pub host: Option<String>,
    /// Network port
    pub port: Option<u16>,
    /// Database name
    pub database: Option<String>,
    /// Login name
    pub username: Option<String>,
    /// Database file
    pub file_path: Option<String>,
    /// TLS switches
    pub tls: TlsSettings,
    /// Plaintext secrets, sealed before storage
    pub secrets: ConnectionSecrets,
}

impl ConnectionDraft {
    /// Creates an empty draft with default TLS settings.
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>, family: EngineFamily) -> Self {
        Self {
            owner_id: owner_id.into(),
            name: name.into(),
            family,
            host: None,
            port: None,
            database: None,
            username: None,
            file_path: None,
            tls: TlsSettings::default(),
            secrets: ConnectionSecrets::default(),
        }
    }

    /// Builder method to set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Builder method to set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder method to set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Builder method to set the login name.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Builder method to set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.secrets.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Builder method to set the database file.
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Enables TLS with the given mode.
    pub fn with_tls(mut self, mode: TlsMode) -> Self {
        self.tls.enabled = mode != TlsMode::Disable;
        self.tls.mode = mode;
        self
    }

    /// Builder method to relax certificate verification.
    pub fn with_reject_unauthorized(mut self, reject: bool) -> Self {
        self.tls.reject_unauthorized = reject;
        self
    }

    /// Builder method to attach PEM material.
    pub fn with_tls_material(
        mut self,
        ca_cert: Option<String>,
        client_cert: Option<String>,
        client_key: Option<String>,
    ) -> Self {
        self.secrets.tls_ca_cert = ca_cert.map(Zeroizing::new);
        self.secrets.tls_client_cert = client_cert.map(Zeroizing::new);
        self.secrets.tls_client_key = client_key.map(Zeroizing::new);
        self
    }

    /// Parses a connection URL into a draft.
    ///
    /// Accepts `postgres://`, `postgresql://`, `mysql://` and `sqlite://`
    /// URLs; an `sslmode` query parameter sets the TLS mode.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or names an unsupported engine
    pub fn from_url(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        url: &str,
    ) -> crate::Result<Self> {
        let parsed = crate::security::parse_connection_url(url)?;
        let mut draft = Self::new(owner_id, name, parsed.family);
        draft.host = parsed.host;
        draft.port = parsed.port;
        draft.database = parsed.database;
        draft.username = parsed.username;
        draft.file_path = parsed.file_path;
        draft.secrets = parsed.secrets;
        if let Some(mode) = parsed.tls_mode {
            draft = draft.with_tls(mode);
        }
        Ok(draft)
    }
}

/// Partial update of a stored connection; `None` leaves a field untouched.
#[derive(Clone, Default)]
pub struct ConnectionUpdate {
    /// New display name
    pub name: Option<String>,
    /// New host
    pub host: Option<String>,
    /// New port
    pub port: Option<u16>,
    /// New database name
    pub database: Option<String>,
    /// New login name
    pub username: Option<String>,
    /// New database file
    pub file_path: Option<String>,
    /// New password
    pub password: Option<Zeroizing<String>>,
    /// TLS on/off
    pub tls_enabled: Option<bool>,
    /// TLS mode
    pub tls_mode: Option<TlsMode>,
    /// Certificate verification switch
    pub tls_reject_unauthorized: Option<bool>,
    /// New CA certificate
    pub tls_ca_cert: Option<Zeroizing<String>>,
    /// New client certificate
    pub tls_client_cert: Option<Zeroizing<String>>,
    /// New client key
    pub tls_client_key: Option<Zeroizing<String>>,
}

impl ConnectionUpdate {
    /// Names of the fields this update sets, in vault column terms.
    pub fn present_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        let mut push = |present: bool, name: &'static str| {
            if present {
                fields.push(name);
            }
        };
        push(self.name.is_some(), "name");
        push(self.host.is_some(), "host");
        push(self.port.is_some(), "port");
        push(self.database.is_some(), "database");
        push(self.username.is_some(), "username");
        push(self.file_path.is_some(), "file_path");
        push(self.password.is_some(), "password");
        push(self.tls_enabled.is_some(), "ssl_enabled");
        push(self.tls_mode.is_some(), "ssl_mode");
        push(self.tls_reject_unauthorized.is_some(), "ssl_reject_unauthorized");
        push(self.tls_ca_cert.is_some(), "ssl_ca_cert");
        push(self.tls_client_cert.is_some(), "ssl_client_cert");
        push(self.tls_client_key.is_some(), "ssl_client_key");
        fields
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.present_fields().is_empty()
    }

    /// True when any field other than the display name is set.
    pub fn touches_connectivity(&self) -> bool {
        self.present_fields().iter().any(|field| *field != "name")
    }
}

impl std::fmt::Debug for ConnectionUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionUpdate")
            .field("fields", &self.present_fields())
            .finish()
    }
}

// =============================================================================
// Normalized schema
// =============================================================================

/// Engine-independent schema description.
///
/// A failed introspection still produces this shape, with `error` set and no
/// tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSchema {
    /// Engine family tag
    pub database_type: EngineFamily,
    /// Database name or file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Native error message of a failed introspection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tables keyed by name
    pub tables: BTreeMap<String, TableSchema>,
}

impl NormalizedSchema {
    /// Creates an empty schema.
    pub fn new(database_type: EngineFamily, database_name: Option<String>) -> Self {
        Self {
            database_type,
            database_name,
            error: None,
            tables: BTreeMap::new(),
        }
    }

    /// Creates a degraded schema carrying the failure message.
    pub fn degraded(database_type: EngineFamily, error: impl Into<String>) -> Self {
        Self {
            database_type,
            database_name: None,
            error: Some(error.into()),
            tables: BTreeMap::new(),
        }
    }

    /// Whether this schema came from a failed introspection.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// Appends a column to a table, creating the table on first use.
    pub fn push_column(&mut self, table: &str, column: ColumnSchema) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .columns
            .push(column);
    }
}

/// Columns of one table in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Column list
    pub columns: Vec<ColumnSchema>,
}

/// Normalized column description.
///
/// `constraint`, `key` and `primary_key` are filled for every family even
/// though each engine only exposes one of them natively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Native type name
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Default expression
    pub default: Option<String>,
    /// Constraint type (`PRIMARY KEY`, `UNIQUE`, `FOREIGN KEY`)
    pub constraint: Option<String>,
    /// Column key flag (`PRI`, `UNI`, `MUL`)
    pub key: Option<String>,
    /// Whether the column is part of the primary key
    pub primary_key: bool,
}

impl ColumnSchema {
    /// Creates a nullable column without key information.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            constraint: None,
            key: None,
            primary_key: false,
        }
    }

    /// Builder method to set nullability.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Builder method to set the default expression.
    pub fn with_default(mut self, default: Option<String>) -> Self {
        self.default = default;
        self
    }

    /// Fills all three key slots from a constraint type.
    pub fn with_constraint(mut self, constraint: Option<String>) -> Self {
        self.key = constraint.as_deref().and_then(key_for_constraint).map(str::to_string);
        self.primary_key = constraint.as_deref() == Some("PRIMARY KEY");
        self.constraint = constraint;
        self
    }

    /// Fills all three key slots from a column-key flag.
    pub fn with_key(mut self, key: Option<String>) -> Self {
        let key = key.filter(|k| !k.is_empty());
        self.constraint = key.as_deref().and_then(constraint_for_key).map(str::to_string);
        self.primary_key = key.as_deref() == Some("PRI");
        self.key = key;
        self
    }
}

fn key_for_constraint(constraint: &str) -> Option<&'static str> {
    match constraint {
        "PRIMARY KEY" => Some("PRI"),
        "UNIQUE" => Some("UNI"),
        "FOREIGN KEY" => Some("MUL"),
        _ => None,
    }
}

fn constraint_for_key(key: &str) -> Option<&'static str> {
    match key {
        "PRI" => Some("PRIMARY KEY"),
        "UNI" => Some("UNIQUE"),
        _ => None,
    }
}

// =============================================================================
// Engine operation results
// =============================================================================

/// Rows returned by a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    /// One object per row, keyed by column name
    pub data: Vec<Map<String, Value>>,
    /// Column names in engine order
    pub columns: Vec<String>,
    /// Rows returned, or rows affected for statements without a result set
    pub row_count: u64,
}

/// Outcome of `execute_query`: never an `Err`, always a value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Statement completed
    Success(ResultSet),
    /// Statement or connection failed
    Failure(EngineError),
}

impl QueryOutcome {
    /// Whether the statement completed.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Reported row count (zero on failure).
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Success(rows) => rows.row_count,
            Self::Failure(_) => 0,
        }
    }

    /// Converts into a `Result` for `?` chaining.
    pub fn into_result(self) -> Result<ResultSet, EngineError> {
        match self {
            Self::Success(rows) => Ok(rows),
            Self::Failure(error) => Err(error),
        }
    }
}

impl Serialize for QueryOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Success(rows) => {
                let mut state = serializer.serialize_struct("QueryOutcome", 4)?;
                state.serialize_field("success", &true)?;
                state.serialize_field("data", &rows.data)?;
                state.serialize_field("columns", &rows.columns)?;
                state.serialize_field("rowCount", &rows.row_count)?;
                state.end()
            }
            Self::Failure(error) => {
                let mut state = serializer.serialize_struct("QueryOutcome", 3)?;
                state.serialize_field("success", &false)?;
                state.serialize_field("error", error.message())?;
                state.serialize_field("errorKind", error.kind())?;
                state.end()
            }
        }
    }
}

/// Outcome of `test_connection`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTest {
    /// Whether the round trip succeeded
    pub success: bool,
    /// Failure classification
    pub error: Option<EngineError>,
}

impl ConnectionTest {
    /// Successful test.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed test.
    pub fn failed(error: EngineError) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

impl Serialize for ConnectionTest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.error.is_some() { 3 } else { 1 };
        let mut state = serializer.serialize_struct("ConnectionTest", len)?;
        state.serialize_field("success", &self.success)?;
        if let Some(error) = &self.error {
            state.serialize_field("error", error.message())?;
            state.serialize_field("errorKind", error.kind())?;
        }
        state.end()
    }
}

// =============================================================================
// History and audit records
// =============================================================================

/// Stored query history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHistoryEntry {
    /// Entry identifier
    pub id: Uuid,
    /// Asking user
    pub user_id: String,
    /// Connection the statement ran against
    pub connection_id: Uuid,
    /// Natural-language question
    pub question: String,
    /// Statement that was (or would have been) executed
    pub generated_sql: String,
    /// Serialized result, if execution happened
    pub result: Option<Value>,
    /// Execution time in milliseconds
    pub execution_time_ms: Option<f64>,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Failure message
    pub error_message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Input for a new history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueryHistory {
    /// Asking user
    pub user_id: String,
    /// Connection the statement ran against
    pub connection_id: Uuid,
    /// Natural-language question
    pub question: String,
    /// Generated statement
    pub generated_sql: String,
    /// Serialized result
    pub result: Option<Value>,
    /// Execution time in milliseconds
    pub execution_time_ms: Option<f64>,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Failure message
    pub error_message: Option<String>,
}

/// Stored audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Entry identifier
    pub id: Uuid,
    /// Acting user, unknown for pre-authentication actions
    pub user_id: Option<String>,
    /// Action tag, `FAILED_` prefixed on error paths
    pub action: String,
    /// Kind of target
    pub target_type: String,
    /// Target identifier
    pub target_id: Option<String>,
    /// Structured details
    pub details: Option<Value>,
    /// Caller address
    pub ip_address: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Input for a new audit entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuditEvent {
    /// Acting user
    pub user_id: Option<String>,
    /// Action tag
    pub action: String,
    /// Kind of target
    pub target_type: String,
    /// Target identifier
    pub target_id: Option<String>,
    /// Structured details
    pub details: Option<Value>,
    /// Caller address
    pub ip_address: Option<String>,
}

impl AuditEvent {
    /// Creates an event with no user, target or details.
    pub fn new(action: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target_type: target_type.into(),
            ..Self::default()
        }
    }

    /// Builder method to set the acting user.
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Builder method to set the target identifier.
    pub fn with_target(mut self, target_id: Option<String>) -> Self {
        self.target_id = target_id;
        self
    }

    /// Builder method to set the details payload.
    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }

    /// Builder method to set the caller address.
    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }
}

// =============================================================================
// Paging and caller identity
// =============================================================================

/// Limit/offset window for list reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of entries
    pub limit: u32,
    /// Entries to skip
    pub offset: u32,
}

impl Page {
    /// Creates a page window.
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// First page of the given size.
    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Caller role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular user
    #[default]
    User,
    /// Administrator, may read the audit trail
    Admin,
}

impl FromStr for Role {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(GatewayError::invalid_field(
                "role",
                format!("unknown role '{other}'"),
            )),
        }
    }
}

/// Authenticated caller identity supplied by the request boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// User identifier
    pub user_id: String,
    /// Role
    pub role: Role,
}

impl Caller {
    /// Regular user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
        }
    }

    /// Administrator.
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    /// Whether the caller may read the audit trail.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_family_parsing() {
        assert_eq!("postgresql".parse::<EngineFamily>().unwrap(), EngineFamily::Postgres);
        assert_eq!("POSTGRES".parse::<EngineFamily>().unwrap(), EngineFamily::Postgres);
        assert_eq!("mysql".parse::<EngineFamily>().unwrap(), EngineFamily::Mysql);
        assert_eq!("sqlite".parse::<EngineFamily>().unwrap(), EngineFamily::Sqlite);

        let err = "oracle".parse::<EngineFamily>().unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedEngine { engine } if engine == "oracle"));
    }

    #[test]
    fn test_tls_mode_parsing() {
        for mode in TlsMode::ALL {
            assert_eq!(mode.as_str().parse::<TlsMode>().unwrap(), mode);
        }
        assert!("strict".parse::<TlsMode>().is_err());
        assert_eq!(
            serde_json::to_value(TlsMode::VerifyFull).unwrap(),
            serde_json::json!("verify-full")
        );
    }

    #[test]
    fn test_draft_with_tls_disable_keeps_tls_off() {
        let draft = ConnectionDraft::new("u", "n", EngineFamily::Postgres).with_tls(TlsMode::Disable);
        assert!(!draft.tls.enabled);
        assert_eq!(draft.tls.mode, TlsMode::Disable);
    }

    #[test]
    fn test_column_slots_from_constraint() {
        let column = ColumnSchema::new("id", "integer").with_constraint(Some("PRIMARY KEY".into()));
        assert_eq!(column.key.as_deref(), Some("PRI"));
        assert!(column.primary_key);

        let column = ColumnSchema::new("email", "text").with_constraint(Some("UNIQUE".into()));
        assert_eq!(column.key.as_deref(), Some("UNI"));
        assert!(!column.primary_key);
    }

    #[test]
    fn test_column_slots_from_key() {
        let column = ColumnSchema::new("id", "int").with_key(Some("PRI".into()));
        assert_eq!(column.constraint.as_deref(), Some("PRIMARY KEY"));
        assert!(column.primary_key);

        let column = ColumnSchema::new("name", "varchar").with_key(Some(String::new()));
        assert!(column.key.is_none());
        assert!(column.constraint.is_none());
        assert!(!column.primary_key);
    }

    #[test]
    fn test_schema_serialization_shape() {
        let mut schema = NormalizedSchema::new(EngineFamily::Sqlite, Some("app.db".into()));
        schema.push_column(
            "users",
            ColumnSchema::new("id", "INTEGER")
                .with_nullable(false)
                .with_key(Some("PRI".into())),
        );

        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["databaseType"], "sqlite");
        assert_eq!(json["databaseName"], "app.db");
        assert!(json.get("error").is_none());
        let column = &json["tables"]["users"]["columns"][0];
        assert_eq!(column["type"], "INTEGER");
        assert_eq!(column["primaryKey"], true);
        assert_eq!(column["nullable"], false);
    }

    #[test]
    fn test_degraded_schema() {
        let schema = NormalizedSchema::degraded(EngineFamily::Mysql, "Access denied");
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["error"], "Access denied");
        assert_eq!(json["tables"], serde_json::json!({}));
        assert!(schema.is_degraded());
    }

    #[test]
    fn test_query_outcome_serialization() {
        let mut row = Map::new();
        row.insert("one".into(), Value::from(1));
        let outcome = QueryOutcome::Success(ResultSet {
            data: vec![row],
            columns: vec!["one".into()],
            row_count: 1,
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["rowCount"], 1);
        assert_eq!(json["data"][0]["one"], 1);

        let failed = QueryOutcome::Failure(EngineError::Execution("syntax error".into()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "syntax error");
        assert_eq!(failed.row_count(), 0);
    }

    #[test]
    fn test_connection_test_serialization() {
        let json = serde_json::to_value(ConnectionTest::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"success": true}));

        let json = serde_json::to_value(ConnectionTest::failed(EngineError::Timeout(
            "connect timed out".into(),
        )))
        .unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "connect timed out");
        assert_eq!(json["errorKind"], "timeout");
    }

    #[test]
    fn test_update_field_tracking() {
        let update = ConnectionUpdate::default();
        assert!(update.is_empty());
        assert!(!update.touches_connectivity());

        let rename = ConnectionUpdate {
            name: Some("renamed".into()),
            ..ConnectionUpdate::default()
        };
        assert!(!rename.touches_connectivity());

        let repoint = ConnectionUpdate {
            password: Some(Zeroizing::new("pw".into())),
            ..ConnectionUpdate::default()
        };
        assert!(repoint.touches_connectivity());
        assert!(!format!("{repoint:?}").contains("pw\""));
    }

    #[test]
    fn test_summary_serialization_has_no_secrets() {
        let now = Utc::now();
        let connection = Connection {
            id: Uuid::new_v4(),
            owner_id: "user-1".into(),
            name: "prod".into(),
            family: EngineFamily::Postgres,
            host: Some("db".into()),
            port: Some(5432),
            database: Some("app".into()),
            username: Some("app".into()),
            file_path: None,
            tls: TlsSettings::default(),
            secrets: ConnectionSecrets::with_password("topsecret"),
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_string(&connection.summary()).unwrap();
        assert!(!json.contains("topsecret"));
        assert!(json.contains("\"engineFamily\":\"postgres\""));
        assert!(json.contains("\"tlsMode\":\"prefer\""));
        assert!(!json.contains("filePath"));
    }

    #[test]
    fn test_merged_with_applies_present_fields() {
        let now = Utc::now();
        let connection = Connection {
            id: Uuid::new_v4(),
            owner_id: "user-1".into(),
            name: "prod".into(),
            family: EngineFamily::Mysql,
            host: Some("db".into()),
            port: None,
            database: Some("app".into()),
            username: Some("app".into()),
            file_path: None,
            tls: TlsSettings::default(),
            secrets: ConnectionSecrets::with_password("old"),
            created_at: now,
            updated_at: now,
        };
        let update = ConnectionUpdate {
            host: Some("replica".into()),
            password: Some(Zeroizing::new("new".into())),
            tls_mode: Some(TlsMode::Require),
            ..ConnectionUpdate::default()
        };

        let merged = connection.merged_with(&update);
        assert_eq!(merged.host.as_deref(), Some("replica"));
        assert_eq!(merged.database.as_deref(), Some("app"));
        assert_eq!(merged.secrets.password(), Some("new"));
        assert_eq!(merged.tls.mode, TlsMode::Require);
        assert_eq!(merged.name, "prod");
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
        assert!(Caller::admin("a").is_admin());
        assert!(!Caller::user("u").is_admin());
    }
}
