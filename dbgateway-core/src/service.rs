//! Request-level workflows over the gateway and the vault.
//!
//! [`GatewayService`] is what a request boundary (the CLI, or an HTTP
//! layer) talks to. Every method takes the authenticated [`Caller`]; the
//! caller's user id is the only ownership key ever passed to the vault.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::Result;
use crate::adapters::{ConnectionConfig, Gateway, require_connectivity};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{
    AuditLogEntry, Caller, ConnectionDraft, ConnectionSummary, ConnectionTest, ConnectionUpdate,
    EngineFamily, NewQueryHistory, NormalizedSchema, Page, QueryHistoryEntry, QueryOutcome,
    ResultSet,
};
use crate::security::Cipher;
use crate::validation::{validate_draft, validate_update};
use crate::vault::{AuditRecorder, ConnectionRegistry, QueryHistoryStore, Vault};

/// Natural-language to SQL collaborator.
///
/// The gateway treats the generator as opaque: whatever text it returns is
/// executed verbatim.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Produces a statement answering `question` against `schema`.
    ///
    /// # Errors
    /// Implementations report failures as `GatewayError::Generation`
    async fn generate(
        &self,
        question: &str,
        schema: &NormalizedSchema,
        family: EngineFamily,
    ) -> Result<String>;
}

/// Generator that treats the question itself as the statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbatimSql;

#[async_trait]
impl SqlGenerator for VerbatimSql {
    async fn generate(
        &self,
        question: &str,
        _schema: &NormalizedSchema,
        _family: EngineFamily,
    ) -> Result<String> {
        let sql = question.trim();
        if sql.is_empty() {
            return Err(GatewayError::Generation {
                message: "no statement to run".to_string(),
            });
        }
        Ok(sql.to_string())
    }
}

/// Result of [`GatewayService::ask`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskOutcome {
    /// Question as asked
    pub question: String,
    /// Statement produced by the generator
    #[serde(rename = "generatedSQL")]
    pub generated_sql: String,
    /// Rows, when the statement was executed
    pub result: Option<ResultSet>,
    /// Whether the statement was executed
    pub auto_executed: bool,
    /// Execution time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

/// Connection, query, history and audit workflows for authenticated callers.
#[derive(Debug, Clone)]
pub struct GatewayService {
    registry: ConnectionRegistry,
    gateway: Gateway,
    history: QueryHistoryStore,
    audit: AuditRecorder,
    side_writes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl GatewayService {
    /// Creates a service from its parts.
    pub fn new(
        registry: ConnectionRegistry,
        gateway: Gateway,
        history: QueryHistoryStore,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            registry,
            gateway,
            history,
            audit,
            side_writes: Arc::default(),
        }
    }

    /// Wires a service over an already opened vault.
    pub fn with_vault(vault: &Vault, cipher: Arc<Cipher>, gateway: Gateway) -> Self {
        Self::new(vault.registry(cipher), gateway, vault.history(), vault.audit())
    }

    /// Validates the configuration, derives the cipher key and opens the vault.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the vault cannot be opened
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let cipher = Arc::new(Cipher::new(&config.encryption_key)?);
        let vault = Vault::open(&config.vault_url).await?;
        tracing::info!("Gateway service ready ({})", config);
        Ok(Self::with_vault(&vault, cipher, Gateway::from_config(config)))
    }

    /// Connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Engine gateway.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Query history store.
    pub fn history(&self) -> &QueryHistoryStore {
        &self.history
    }

    /// Audit recorder.
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Keeps a background vault write alive until [`flush`](Self::flush).
    pub async fn track(&self, write: JoinHandle<()>) {
        let mut pending = self.side_writes.lock().await;
        pending.retain(|handle| !handle.is_finished());
        pending.push(write);
    }

    /// Waits for tracked background writes (history, and audit entries
    /// handed over by the caller).
    ///
    /// Responses never wait for these writes; a short-lived process calls
    /// this before exiting so they are not cancelled with the runtime.
    pub async fn flush(&self) {
        let pending = std::mem::take(&mut *self.side_writes.lock().await);
        for handle in pending {
            if let Err(e) = handle.await {
                tracing::error!("Background vault write task failed: {}", e);
            }
        }
    }

    async fn owned_config(&self, caller: &Caller, id: Uuid) -> Result<ConnectionConfig> {
        let connection = self.registry.get_by_id(id, &caller.user_id).await?;
        Ok(self.gateway.config_for(&connection))
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Lists the caller's connections.
    ///
    /// # Errors
    /// Returns error if the vault cannot be read
    pub async fn list(&self, caller: &Caller) -> Result<Vec<ConnectionSummary>> {
        self.registry.list_for_user(&caller.user_id).await
    }

    /// Shows one of the caller's connections without secrets.
    ///
    /// # Errors
    /// Returns `NotFound` if the caller does not own the connection
    pub async fn show(&self, caller: &Caller, id: Uuid) -> Result<ConnectionSummary> {
        let connection = self.registry.get_by_id(id, &caller.user_id).await?;
        Ok(connection.summary())
    }

    /// Tests a draft before it is registered.
    ///
    /// # Errors
    /// Returns `Validation` if the draft is inconsistent; engine failures are
    /// reported inside the returned value
    pub async fn test_draft(&self, draft: &ConnectionDraft) -> Result<ConnectionTest> {
        validate_draft(draft)?;
        let config = self.gateway.with_timeouts(ConnectionConfig::from_draft(draft));
        Ok(self.gateway.test_connection(&config).await)
    }

    /// Registers a connection after proving it is reachable.
    ///
    /// The draft's owner is always replaced by the caller.
    ///
    /// # Errors
    /// Returns `Validation` for a bad draft and `ConnectionTestFailed` with
    /// the native driver message if the target cannot be reached
    pub async fn register(&self, caller: &Caller, mut draft: ConnectionDraft) -> Result<ConnectionSummary> {
        draft.owner_id.clone_from(&caller.user_id);
        let test = self.test_draft(&draft).await?;
        require_connectivity(test)?;
        self.registry.save(&draft).await
    }

    /// Applies a partial update, re-testing connectivity when it changes.
    ///
    /// # Errors
    /// Returns `NoFieldsToUpdate`, `NotFound`, `Validation`,
    /// `ConnectionTestFailed` or `NotFoundOrUnauthorized`
    pub async fn modify(
        &self,
        caller: &Caller,
        id: Uuid,
        update: &ConnectionUpdate,
    ) -> Result<ConnectionSummary> {
        if update.is_empty() {
            return Err(GatewayError::NoFieldsToUpdate);
        }

        let existing = self.registry.get_by_id(id, &caller.user_id).await?;
        validate_update(existing.family, update)?;

        if update.touches_connectivity() {
            let merged = existing.merged_with(update);
            let test = self
                .gateway
                .test_connection(&self.gateway.config_for(&merged))
                .await;
            require_connectivity(test)?;
        }

        self.registry.update(id, &caller.user_id, update).await
    }

    /// Removes one of the caller's connections.
    ///
    /// # Errors
    /// Returns error if the vault cannot be written
    pub async fn remove(&self, caller: &Caller, id: Uuid) -> Result<bool> {
        self.registry.delete(id, &caller.user_id).await
    }

    /// Tests a stored connection.
    ///
    /// # Errors
    /// Returns `NotFound` if the caller does not own the connection
    pub async fn test(&self, caller: &Caller, id: Uuid) -> Result<ConnectionTest> {
        let config = self.owned_config(caller, id).await?;
        Ok(self.gateway.test_connection(&config).await)
    }

    // -------------------------------------------------------------------------
    // Schema and data
    // -------------------------------------------------------------------------

    /// Introspects a stored connection; engine failures yield a degraded schema.
    ///
    /// # Errors
    /// Returns `NotFound` if the caller does not own the connection
    pub async fn schema(&self, caller: &Caller, id: Uuid) -> Result<NormalizedSchema> {
        let config = self.owned_config(caller, id).await?;
        Ok(self.gateway.introspect_schema(&config).await)
    }

    /// Reads the first rows of a table.
    ///
    /// # Errors
    /// Returns `NotFound` or `Validation` (bad table name); engine failures
    /// come back inside the outcome
    pub async fn sample(&self, caller: &Caller, id: Uuid, table: &str) -> Result<QueryOutcome> {
        let config = self.owned_config(caller, id).await?;
        self.gateway.sample_table(&config, table).await
    }

    /// Lists tables with engine-specific statistics.
    ///
    /// # Errors
    /// Returns `NotFound` if the caller does not own the connection
    pub async fn statistics(&self, caller: &Caller, id: Uuid) -> Result<Vec<Map<String, Value>>> {
        let config = self.owned_config(caller, id).await?;
        Ok(self.gateway.table_statistics(&config).await)
    }

    // -------------------------------------------------------------------------
    // Questions and history
    // -------------------------------------------------------------------------

    /// Turns a question into SQL and optionally runs it.
    ///
    /// Once the connection is resolved, every attempt leaves exactly one
    /// history entry, written in the background. A statement that is only
    /// generated is recorded as unsuccessful.
    ///
    /// # Errors
    /// Returns `Validation` for an empty question, `NotFound` for a foreign
    /// connection, the generator's error, or `Execution` carrying the native
    /// message and the generated statement
    pub async fn ask(
        &self,
        caller: &Caller,
        connection_id: Uuid,
        question: &str,
        auto_execute: bool,
        generator: &dyn SqlGenerator,
    ) -> Result<AskOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(GatewayError::invalid_field("question", "must not be empty"));
        }

        let connection = self.registry.get_by_id(connection_id, &caller.user_id).await?;
        let config = self.gateway.config_for(&connection);
        let schema = self.gateway.introspect_schema(&config).await;

        let mut attempt = NewQueryHistory {
            user_id: caller.user_id.clone(),
            connection_id,
            question: question.to_string(),
            generated_sql: String::new(),
            result: None,
            execution_time_ms: None,
            success: false,
            error_message: None,
        };

        let sql = match generator.generate(question, &schema, connection.family).await {
            Ok(sql) => sql,
            Err(e) => {
                attempt.error_message = Some(e.to_string());
                self.track(self.history.record(attempt)).await;
                return Err(e);
            }
        };
        attempt.generated_sql.clone_from(&sql);

        if !auto_execute {
            self.track(self.history.record(attempt)).await;
            return Ok(AskOutcome {
                question: question.to_string(),
                generated_sql: sql,
                result: None,
                auto_executed: false,
                execution_time_ms: None,
            });
        }

        let started = Instant::now();
        let outcome = self.gateway.execute_query(&config, &sql).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        attempt.execution_time_ms = Some(elapsed_ms);
        attempt.result = serde_json::to_value(&outcome).ok();

        match outcome {
            QueryOutcome::Success(rows) => {
                attempt.success = true;
                self.track(self.history.record(attempt)).await;
                tracing::debug!(
                    "Question on connection {} returned {} rows in {:.1} ms",
                    connection_id,
                    rows.row_count,
                    elapsed_ms
                );
                Ok(AskOutcome {
                    question: question.to_string(),
                    generated_sql: sql,
                    result: Some(rows),
                    auto_executed: true,
                    execution_time_ms: Some(elapsed_ms),
                })
            }
            QueryOutcome::Failure(error) => {
                attempt.error_message = Some(error.message().to_string());
                self.track(self.history.record(attempt)).await;
                Err(GatewayError::Execution {
                    message: error.message().to_string(),
                    generated_sql: Some(sql),
                })
            }
        }
    }

    /// Lists the caller's query history.
    ///
    /// # Errors
    /// Returns error if the vault cannot be read
    pub async fn query_history(&self, caller: &Caller, page: Option<Page>) -> Result<Vec<QueryHistoryEntry>> {
        self.history.list(&caller.user_id, page).await
    }

    /// Fetches one of the caller's history entries.
    ///
    /// # Errors
    /// Returns `NotFound` if the entry is missing or foreign
    pub async fn history_entry(&self, caller: &Caller, id: Uuid) -> Result<QueryHistoryEntry> {
        self.history.get(id, &caller.user_id).await
    }

    /// Deletes one of the caller's history entries.
    ///
    /// # Errors
    /// Returns error if the vault cannot be written
    pub async fn remove_history(&self, caller: &Caller, id: Uuid) -> Result<bool> {
        self.history.delete(id, &caller.user_id).await
    }

    // -------------------------------------------------------------------------
    // Audit trail (admin only)
    // -------------------------------------------------------------------------

    fn require_admin(caller: &Caller) -> Result<()> {
        if caller.is_admin() {
            Ok(())
        } else {
            Err(GatewayError::Forbidden {
                required: "admin".to_string(),
            })
        }
    }

    /// Lists the whole audit trail.
    ///
    /// # Errors
    /// Returns `Forbidden` unless the caller is an administrator
    pub async fn audit_log(&self, caller: &Caller, page: Option<Page>) -> Result<Vec<AuditLogEntry>> {
        Self::require_admin(caller)?;
        self.audit.list(page).await
    }

    /// Lists the audit entries of one user.
    ///
    /// # Errors
    /// Returns `Forbidden` unless the caller is an administrator
    pub async fn audit_for_user(
        &self,
        caller: &Caller,
        user_id: &str,
        page: Option<Page>,
    ) -> Result<Vec<AuditLogEntry>> {
        Self::require_admin(caller)?;
        self.audit.list_for_user(user_id, page).await
    }
}
