//! Core library for dbgateway.
//!
//! dbgateway lets many users register connections to their own relational
//! databases, run statements against them and inspect their schemas, while
//! keeping every stored credential encrypted at rest and recording who did
//! what.
//!
//! # Security Guarantees
//! - Passwords and TLS material are sealed with AES-GCM under an
//!   Argon2id-derived key before they reach the vault
//! - Plaintext secrets only live in zeroizing containers and never appear in
//!   `Debug`, `Display`, logs or serialized output
//! - Every registry read and write is scoped by `(id, owner)`
//!
//! # Architecture
//! - [`adapters`]: one engine adapter per family (PostgreSQL, MySQL, SQLite)
//!   behind a single trait, plus the [`adapters::Gateway`] facade
//! - [`vault`]: SQLite-backed stores for connections, query history and the
//!   audit trail
//! - [`service`]: the request-level workflows that tie the two together

pub mod adapters;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod security;
pub mod service;
pub mod validation;
pub mod vault;

// Re-export commonly used types
pub use adapters::{ConnectionConfig, EngineAdapter, Gateway};
pub use config::GatewayConfig;
pub use error::{EngineError, FieldError, GatewayError, Result};
pub use models::{
    AuditLogEntry, Caller, ColumnSchema, Connection, ConnectionDraft, ConnectionSummary,
    ConnectionTest, ConnectionUpdate, EngineFamily, NormalizedSchema, Page, QueryHistoryEntry,
    QueryOutcome, ResultSet, Role, TableSchema, TlsMode,
};
pub use security::Cipher;
pub use service::{AskOutcome, GatewayService, SqlGenerator, VerbatimSql};
pub use vault::{AuditRecorder, ConnectionRegistry, QueryHistoryStore, Vault};
