//! Audit trail recording and the post-handler audit hook.
//!
//! The request boundary builds an [`AuditedAction`] per audited operation
//! and, once its response is known, calls [`AuditRecorder::observe`]. The
//! outcome is classified exactly once:
//!
//! | status  | entry written                                  |
//! |---------|------------------------------------------------|
//! | 2xx     | `action`, target/details from the extractors   |
//! | >= 400  | `FAILED_<action>` with `{error, statusCode}`   |
//! | other   | nothing                                        |
//!
//! Writes happen on a background task; failures are logged under
//! `dbgateway::audit` and never reach the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{page_bounds, uuid_column};
use crate::Result;
use crate::error::GatewayError;
use crate::models::{AuditEvent, AuditLogEntry, Page};

/// Page used when an audit listing does not ask for one.
pub const DEFAULT_AUDIT_PAGE: Page = Page {
    limit: 20,
    offset: 0,
};

const FAILED_PREFIX: &str = "FAILED_";

const ENTRY_COLUMNS: &str =
    "id, user_id, action, target_type, target_id, details, ip_address, created_at";

/// Derives a target identifier from the request and (when available) the response body.
pub type TargetExtractor = Box<dyn Fn(&RequestContext, Option<&Value>) -> Option<String> + Send + Sync>;

/// Derives the details payload from the request and the response body.
pub type DetailsExtractor = Box<dyn Fn(&RequestContext, Option<&Value>) -> Option<Value> + Send + Sync>;

/// What the request boundary knows about an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated caller, if any
    pub user_id: Option<String>,
    /// Caller address
    pub ip_address: Option<String>,
    /// Path or command parameters (e.g. `id`)
    pub params: BTreeMap<String, String>,
    /// Request payload
    pub body: Option<Value>,
}

impl RequestContext {
    /// Creates a context for an (optionally) authenticated caller.
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    /// Builder method to set the caller address.
    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    /// Builder method to add a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Builder method to set the request payload.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Looks up a parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Final state of a handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutcome {
    /// HTTP-style status
    pub status: u16,
    /// Reason phrase or error message
    pub status_message: Option<String>,
    /// Response payload
    pub body: Option<Value>,
}

impl ResponseOutcome {
    /// Successful response carrying a body.
    pub fn success(status: u16, body: Option<Value>) -> Self {
        Self {
            status,
            status_message: None,
            body,
        }
    }

    /// Failed response.
    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            status_message: Some(message.into()),
            body: None,
        }
    }

    /// Response for a service error.
    pub fn from_error(error: &GatewayError) -> Self {
        Self::failure(error.status_code(), error.to_string())
    }

    /// Response for a service result; `Ok` maps to `success_status`.
    ///
    /// A body that cannot be serialized is recorded as absent.
    pub fn from_result<T: Serialize>(result: &Result<T>, success_status: u16) -> Self {
        match result {
            Ok(value) => Self::success(success_status, serde_json::to_value(value).ok()),
            Err(error) => Self::from_error(error),
        }
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the status is 400 or above.
    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}

/// Audit configuration of one operation.
///
/// # Example
/// ```rust
/// use dbgateway_core::vault::{AuditedAction, RequestContext, ResponseOutcome};
/// use serde_json::json;
///
/// let action = AuditedAction::new("create_connection", "connection").with_target_from_body("/id");
/// let ctx = RequestContext::new(Some("user-1".into()));
///
/// let created = ResponseOutcome::success(201, Some(json!({"id": "abc"})));
/// let event = action.event_for(&ctx, &created).unwrap();
/// assert_eq!(event.action, "create_connection");
/// assert_eq!(event.target_id.as_deref(), Some("abc"));
///
/// let failed = ResponseOutcome::failure(500, "boom");
/// assert_eq!(action.event_for(&ctx, &failed).unwrap().action, "FAILED_create_connection");
/// ```
pub struct AuditedAction {
    action: String,
    target_type: String,
    target_id: Option<TargetExtractor>,
    details: Option<DetailsExtractor>,
    identity_from_response: bool,
}

impl std::fmt::Debug for AuditedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditedAction")
            .field("action", &self.action)
            .field("target_type", &self.target_type)
            .field("target_id", &self.target_id.is_some())
            .field("details", &self.details.is_some())
            .field("identity_from_response", &self.identity_from_response)
            .finish()
    }
}

impl AuditedAction {
    /// Creates an action without extractors.
    pub fn new(action: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target_type: target_type.into(),
            target_id: None,
            details: None,
            identity_from_response: false,
        }
    }

    /// Action tag.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Sets the target extractor.
    ///
    /// On failure paths the extractor is called without a response body.
    pub fn with_target_id<F>(mut self, extract: F) -> Self
    where
        F: Fn(&RequestContext, Option<&Value>) -> Option<String> + Send + Sync + 'static,
    {
        self.target_id = Some(Box::new(extract));
        self
    }

    /// Takes the target from a request parameter.
    pub fn with_target_param(self, name: &'static str) -> Self {
        self.with_target_id(move |ctx, _| ctx.param(name).map(str::to_string))
    }

    /// Takes the target from a JSON pointer into the response body.
    pub fn with_target_from_body(self, pointer: &'static str) -> Self {
        self.with_target_id(move |_, body| body.and_then(|b| b.pointer(pointer)).and_then(scalar_string))
    }

    /// Sets the details extractor.
    pub fn with_details<F>(mut self, extract: F) -> Self
    where
        F: Fn(&RequestContext, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.details = Some(Box::new(extract));
        self
    }

    /// Takes the acting user from `body.user.id` of a successful response.
    ///
    /// For login/registration style actions the caller is not authenticated
    /// yet when the request arrives.
    pub fn identity_from_response(mut self) -> Self {
        self.identity_from_response = true;
        self
    }

    /// Classifies an outcome into at most one audit event.
    pub fn event_for(&self, ctx: &RequestContext, outcome: &ResponseOutcome) -> Option<AuditEvent> {
        if outcome.is_success() {
            let body = outcome.body.as_ref();
            let mut user_id = ctx.user_id.clone();
            if self.identity_from_response
                && let Some(id) = body.and_then(|b| b.pointer("/user/id")).and_then(scalar_string)
            {
                user_id = Some(id);
            }

            Some(
                AuditEvent::new(self.action.clone(), self.target_type.clone())
                    .with_user(user_id)
                    .with_target(self.target_id.as_ref().and_then(|f| f(ctx, body)))
                    .with_details(self.details.as_ref().and_then(|f| f(ctx, body)))
                    .with_ip(ctx.ip_address.clone()),
            )
        } else if outcome.is_failure() {
            let error = outcome
                .status_message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Unknown error".to_string());

            Some(
                AuditEvent::new(format!("{FAILED_PREFIX}{}", self.action), self.target_type.clone())
                    .with_user(ctx.user_id.clone())
                    .with_target(self.target_id.as_ref().and_then(|f| f(ctx, None)))
                    .with_details(Some(json!({ "error": error, "statusCode": outcome.status })))
                    .with_ip(ctx.ip_address.clone()),
            )
        } else {
            None
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn entry_from_row(row: &SqliteRow) -> std::result::Result<AuditLogEntry, sqlx::Error> {
    let details: Option<String> = row.try_get("details")?;
    Ok(AuditLogEntry {
        id: uuid_column(row, "id")?,
        user_id: row.try_get("user_id")?,
        action: row.try_get("action")?,
        target_type: row.try_get("target_type")?,
        target_id: row.try_get("target_id")?,
        details: details.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text))),
        ip_address: row.try_get("ip_address")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

/// Durable, system-owned audit trail.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    pool: SqlitePool,
}

impl AuditRecorder {
    /// Creates a recorder over the vault pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends one entry and returns it.
    ///
    /// # Errors
    /// Returns error if the details cannot be serialized or the write fails
    pub async fn write(&self, event: AuditEvent) -> Result<AuditLogEntry> {
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| GatewayError::serialization("Failed to serialize audit details", e))?;

        let sql = format!(
            "INSERT INTO audit_logs ({ENTRY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().hyphenated())
            .bind(event.user_id.as_deref())
            .bind(event.action.as_str())
            .bind(event.target_type.as_str())
            .bind(event.target_id.as_deref())
            .bind(details)
            .bind(event.ip_address.as_deref())
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to write audit log", e))?;

        entry_from_row(&row).map_err(|e| GatewayError::storage("Failed to decode audit log", e))
    }

    /// Appends an entry in the background; failures are logged and dropped.
    pub fn record(&self, event: AuditEvent) -> JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let action = event.action.clone();
            if let Err(e) = recorder.write(event).await {
                tracing::error!(target: "dbgateway::audit", "Error creating audit log for {}: {}", action, e);
            }
        })
    }

    /// Observes a completed request and records at most one entry.
    ///
    /// Returns the handle of the background write, or `None` when the
    /// outcome is neither a success nor a failure.
    pub fn observe(
        &self,
        action: &AuditedAction,
        ctx: &RequestContext,
        outcome: &ResponseOutcome,
    ) -> Option<JoinHandle<()>> {
        action.event_for(ctx, outcome).map(|event| self.record(event))
    }

    /// Lists all entries, newest first.
    ///
    /// # Errors
    /// Returns error if the vault cannot be read
    pub async fn list(&self, page: Option<Page>) -> Result<Vec<AuditLogEntry>> {
        let (limit, offset) = page_bounds(page.unwrap_or(DEFAULT_AUDIT_PAGE));
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_logs ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to list audit logs", e))?;

        Self::decode_all(&rows)
    }

    /// Lists the entries of one user, newest first.
    ///
    /// # Errors
    /// Returns error if the vault cannot be read
    pub async fn list_for_user(&self, user_id: &str, page: Option<Page>) -> Result<Vec<AuditLogEntry>> {
        let (limit, offset) = page_bounds(page.unwrap_or(DEFAULT_AUDIT_PAGE));
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_logs WHERE user_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::storage("Failed to list audit logs", e))?;

        Self::decode_all(&rows)
    }

    fn decode_all(rows: &[SqliteRow]) -> Result<Vec<AuditLogEntry>> {
        rows.iter()
            .map(entry_from_row)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| GatewayError::storage("Failed to decode audit log", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Vault;

    fn create_connection() -> AuditedAction {
        AuditedAction::new("create_connection", "connection")
            .with_target_from_body("/id")
            .with_details(|_, body| body.and_then(|b| b.get("name")).map(|n| json!({ "name": n })))
    }

    #[tokio::test]
    async fn test_success_records_single_plain_entry() {
        let vault = Vault::in_memory().await.unwrap();
        let audit = vault.audit();
        let ctx = RequestContext::new(Some("alice".into())).with_ip(Some("10.0.0.7".into()));
        let outcome = ResponseOutcome::success(201, Some(json!({"id": "c-1", "name": "prod"})));

        audit
            .observe(&create_connection(), &ctx, &outcome)
            .unwrap()
            .await
            .unwrap();

        let entries = audit.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.action, "create_connection");
        assert_eq!(entry.target_id.as_deref(), Some("c-1"));
        assert_eq!(entry.details, Some(json!({"name": "prod"})));
        assert_eq!(entry.user_id.as_deref(), Some("alice"));
        assert_eq!(entry.ip_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_failure_records_single_failed_entry() {
        let vault = Vault::in_memory().await.unwrap();
        let audit = vault.audit();
        let action = AuditedAction::new("delete_connection", "connection").with_target_param("id");
        let ctx = RequestContext::new(Some("alice".into())).with_param("id", "c-9");

        audit
            .observe(&action, &ctx, &ResponseOutcome::failure(500, ""))
            .unwrap()
            .await
            .unwrap();

        let entries = audit.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "FAILED_delete_connection");
        assert_eq!(entries[0].target_id.as_deref(), Some("c-9"));
        assert_eq!(
            entries[0].details,
            Some(json!({"error": "Unknown error", "statusCode": 500}))
        );
    }

    #[test]
    fn test_failure_path_extractors_see_no_body() {
        let action = create_connection();
        let ctx = RequestContext::new(None);
        let event = action
            .event_for(&ctx, &ResponseOutcome::failure(404, "Connection not found"))
            .unwrap();

        assert!(event.target_id.is_none());
        assert_eq!(event.details.unwrap()["error"], "Connection not found");
    }

    #[test]
    fn test_informational_status_records_nothing() {
        let action = create_connection();
        let ctx = RequestContext::new(None);
        assert!(action.event_for(&ctx, &ResponseOutcome::success(304, None)).is_none());
    }

    #[test]
    fn test_identity_from_response_body() {
        let action = AuditedAction::new("login", "user").identity_from_response();
        let ctx = RequestContext::new(None);

        let event = action
            .event_for(&ctx, &ResponseOutcome::success(200, Some(json!({"user": {"id": 42}}))))
            .unwrap();
        assert_eq!(event.user_id.as_deref(), Some("42"));

        let event = action
            .event_for(&ctx, &ResponseOutcome::success(200, Some(json!({"token": "t"}))))
            .unwrap();
        assert!(event.user_id.is_none());
    }

    #[tokio::test]
    async fn test_list_for_user_and_paging() {
        let vault = Vault::in_memory().await.unwrap();
        let audit = vault.audit();

        for i in 0..3 {
            audit
                .write(AuditEvent::new(format!("a{i}"), "connection").with_user(Some("alice".into())))
                .await
                .unwrap();
        }
        audit.write(AuditEvent::new("register", "user")).await.unwrap();

        let mine = audit.list_for_user("alice", Some(Page::new(2, 0))).await.unwrap();
        let actions: Vec<&str> = mine.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["a2", "a1"]);

        let all = audit.list(None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all[0].user_id.is_none());
    }

    #[tokio::test]
    async fn test_record_swallows_storage_failure() {
        let vault = Vault::in_memory().await.unwrap();
        let audit = vault.audit();
        vault.close().await;

        audit.record(AuditEvent::new("login", "user")).await.unwrap();
    }
}
