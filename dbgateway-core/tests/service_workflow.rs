//! End-to-end service workflows over an in-memory vault and SQLite targets.
//!
//! This test suite covers:
//! - Registration gated by a connection test
//! - Ownership isolation across every connection operation
//! - Partial updates, re-testing connectivity only when it changes
//! - Question answering with history recorded for every attempt
//! - Admin-only access to the audit trail

use std::sync::Arc;

use async_trait::async_trait;
use dbgateway_core::security::KdfParams;
use dbgateway_core::{
    Caller, Cipher, ConnectionDraft, ConnectionUpdate, EngineFamily, Gateway, GatewayError,
    GatewayService, NormalizedSchema, QueryHistoryEntry, SqlGenerator, Vault, VerbatimSql,
};
use sqlx::ConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use uuid::Uuid;

async fn service() -> GatewayService {
    let vault = Vault::in_memory().await.unwrap();
    let params = KdfParams {
        memory_cost: 64,
        time_cost: 1,
        parallelism: 1,
    };
    let cipher = Arc::new(Cipher::with_params("workflow-test-secret", params).unwrap());
    GatewayService::with_vault(&vault, cipher, Gateway::default())
}

async fn target_database(dir: &tempfile::TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    let mut connection = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    sqlx::raw_sql(
        "CREATE TABLE metrics (id INTEGER PRIMARY KEY, label TEXT, value REAL);
         INSERT INTO metrics (label, value) VALUES ('cpu', 0.5), ('mem', 0.75);",
    )
    .execute(&mut connection)
    .await
    .unwrap();
    sqlx::Connection::close(connection).await.unwrap();
    path.to_string_lossy().to_string()
}

fn sqlite_draft(name: &str, path: &str) -> ConnectionDraft {
    ConnectionDraft::new("ignored", name, EngineFamily::Sqlite).with_file_path(path)
}

/// Waits for background history writes, then reads the caller's history.
async fn settled_history(service: &GatewayService, caller: &Caller) -> Vec<QueryHistoryEntry> {
    service.flush().await;
    service.query_history(caller, None).await.unwrap()
}

#[tokio::test]
async fn test_register_uses_caller_as_owner() {
    let dir = tempfile::tempdir().unwrap();
    let path = target_database(&dir, "app.db").await;
    let service = service().await;
    let alice = Caller::user("alice");

    let saved = service.register(&alice, sqlite_draft("app", &path)).await.unwrap();
    assert_eq!(saved.owner_id, "alice");
    assert_eq!(saved.file_path.as_deref(), Some(path.as_str()));
    assert!(saved.host.is_none());

    let listed = service.list(&alice).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(service.list(&Caller::user("ignored")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_register_unreachable_target_fails_without_saving() {
    let dir = tempfile::tempdir().unwrap();
    let service = service().await;
    let alice = Caller::user("alice");
    let missing = dir.path().join("t.db").to_string_lossy().to_string();

    let err = service
        .register(&alice, sqlite_draft("missing", &missing))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::ConnectionTestFailed { .. }));
    assert_eq!(err.status_code(), 400);
    assert!(service.list(&alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_foreign_connection_behaves_like_missing_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = target_database(&dir, "app.db").await;
    let service = service().await;
    let alice = Caller::user("alice");
    let mallory = Caller::user("mallory");

    let saved = service.register(&alice, sqlite_draft("app", &path)).await.unwrap();
    let unknown = Uuid::new_v4();

    for id in [saved.id, unknown] {
        assert!(matches!(
            service.show(&mallory, id).await,
            Err(GatewayError::NotFound { .. })
        ));
        assert!(matches!(
            service.schema(&mallory, id).await,
            Err(GatewayError::NotFound { .. })
        ));
        assert!(!service.remove(&mallory, id).await.unwrap());

        let rename = ConnectionUpdate {
            name: Some("mine now".into()),
            ..ConnectionUpdate::default()
        };
        assert!(matches!(
            service.modify(&mallory, id, &rename).await,
            Err(GatewayError::NotFound { .. })
        ));
        assert!(matches!(
            service.registry().update(id, &mallory.user_id, &rename).await,
            Err(GatewayError::NotFoundOrUnauthorized)
        ));
    }

    assert_eq!(service.show(&alice, saved.id).await.unwrap().name, "app");
}

#[tokio::test]
async fn test_modify_retests_only_connectivity_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = target_database(&dir, "app.db").await;
    let service = service().await;
    let alice = Caller::user("alice");
    let saved = service.register(&alice, sqlite_draft("app", &path)).await.unwrap();

    let err = service
        .modify(&alice, saved.id, &ConnectionUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NoFieldsToUpdate));

    let renamed = service
        .modify(
            &alice,
            saved.id,
            &ConnectionUpdate {
                name: Some("renamed".into()),
                ..ConnectionUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "renamed");

    let repoint = ConnectionUpdate {
        file_path: Some(dir.path().join("gone.db").to_string_lossy().to_string()),
        ..ConnectionUpdate::default()
    };
    let err = service.modify(&alice, saved.id, &repoint).await.unwrap_err();
    assert!(matches!(err, GatewayError::ConnectionTestFailed { .. }));
    assert_eq!(
        service.show(&alice, saved.id).await.unwrap().file_path.as_deref(),
        Some(path.as_str())
    );

    let network_field = ConnectionUpdate {
        host: Some("db.internal".into()),
        ..ConnectionUpdate::default()
    };
    let err = service.modify(&alice, saved.id, &network_field).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation { .. }));
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = target_database(&dir, "app.db").await;
    let service = service().await;
    let alice = Caller::user("alice");
    let saved = service.register(&alice, sqlite_draft("app", &path)).await.unwrap();

    assert!(service.remove(&alice, saved.id).await.unwrap());
    assert!(!service.remove(&alice, saved.id).await.unwrap());
}

#[tokio::test]
async fn test_ask_executes_and_records_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = target_database(&dir, "app.db").await;
    let service = service().await;
    let alice = Caller::user("alice");
    let saved = service.register(&alice, sqlite_draft("app", &path)).await.unwrap();

    let answer = service
        .ask(&alice, saved.id, "SELECT label FROM metrics ORDER BY id", true, &VerbatimSql)
        .await
        .unwrap();
    assert!(answer.auto_executed);
    assert_eq!(answer.result.as_ref().unwrap().row_count, 2);
    assert!(answer.execution_time_ms.is_some());

    let err = service
        .ask(&alice, saved.id, "SELECT nope FROM metrics", true, &VerbatimSql)
        .await
        .unwrap_err();
    match &err {
        GatewayError::Execution { message, generated_sql } => {
            assert!(message.contains("no such column"));
            assert_eq!(generated_sql.as_deref(), Some("SELECT nope FROM metrics"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }

    let entries = settled_history(&service, &alice).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.iter().filter(|e| e.success).count(), 1);
    let failed = entries.iter().find(|e| !e.success).unwrap();
    assert!(failed.error_message.as_deref().unwrap().contains("no such column"));
    assert!(entries.iter().all(|e| e.connection_id == saved.id));
}

struct FixedSql(&'static str);

#[async_trait]
impl SqlGenerator for FixedSql {
    async fn generate(
        &self,
        _question: &str,
        schema: &NormalizedSchema,
        family: EngineFamily,
    ) -> dbgateway_core::Result<String> {
        assert_eq!(family, EngineFamily::Sqlite);
        assert!(schema.tables.contains_key("metrics"));
        Ok(self.0.to_string())
    }
}

#[tokio::test]
async fn test_ask_without_execution_is_recorded_unsuccessful() {
    let dir = tempfile::tempdir().unwrap();
    let path = target_database(&dir, "app.db").await;
    let service = service().await;
    let alice = Caller::user("alice");
    let saved = service.register(&alice, sqlite_draft("app", &path)).await.unwrap();

    let answer = service
        .ask(&alice, saved.id, "how many metrics?", false, &FixedSql("SELECT COUNT(*) FROM metrics"))
        .await
        .unwrap();
    assert!(!answer.auto_executed);
    assert!(answer.result.is_none());
    assert_eq!(answer.generated_sql, "SELECT COUNT(*) FROM metrics");

    let entries = settled_history(&service, &alice).await;
    assert!(!entries[0].success);
    assert!(entries[0].result.is_none());
    assert_eq!(entries[0].question, "how many metrics?");

    let id = entries[0].id;
    assert!(service.history_entry(&Caller::user("bob"), id).await.is_err());
    assert!(service.remove_history(&alice, id).await.unwrap());
}

#[tokio::test]
async fn test_audit_trail_requires_admin() {
    let service = service().await;

    let err = service.audit_log(&Caller::user("alice"), None).await.unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden { .. }));
    let err = service
        .audit_for_user(&Caller::user("alice"), "alice", None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 403);

    assert!(service.audit_log(&Caller::admin("root"), None).await.unwrap().is_empty());
}
