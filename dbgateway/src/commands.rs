//! Command handlers.
//!
//! A [`Session`] binds the gateway service to the acting caller. Commands
//! that change state are wrapped in an [`AuditedAction`] and observed once
//! their result is known, the same way an HTTP layer would after a handler.

use std::path::Path;

use anyhow::Context;
use dbgateway_core::vault::{
    AuditedAction, DEFAULT_AUDIT_PAGE, DEFAULT_HISTORY_PAGE, RequestContext, ResponseOutcome,
};
use dbgateway_core::{Caller, ConnectionDraft, ConnectionUpdate, GatewayService, Result, VerbatimSql};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::output::print_json;
use crate::{
    AuditCommand, Command, ConnectionCommand, DraftArgs, HistoryCommand, QueryArgs, TlsArgs,
    UpdateArgs,
};

/// Gateway service acting on behalf of one caller.
pub struct Session {
    service: GatewayService,
    caller: Caller,
    ip_address: Option<String>,
}

impl Session {
    pub fn new(service: GatewayService, caller: Caller, ip_address: Option<String>) -> Self {
        Self {
            service,
            caller,
            ip_address,
        }
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(Some(self.caller.user_id.clone())).with_ip(self.ip_address.clone())
    }

    /// Hands the result to the audit hook.
    ///
    /// The entry is written in the background and tracked by the service, so
    /// output is not held up by the audit write; [`Session::flush`] waits for it.
    async fn observe<T: Serialize>(
        &self,
        action: &AuditedAction,
        ctx: &RequestContext,
        result: &Result<T>,
        success_status: u16,
    ) {
        let outcome = ResponseOutcome::from_result(result, success_status);
        if let Some(write) = self.service.audit().observe(action, ctx, &outcome) {
            self.service.track(write).await;
        }
    }

    /// Waits for audit and history writes started by this session.
    pub async fn flush(&self) {
        self.service.flush().await;
    }

    /// Runs one command and prints its result.
    pub async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Connections(cmd) => self.connections(cmd).await,
            Command::Query(args) => self.query(args).await,
            Command::Schema(args) => {
                let schema = self.service.schema(&self.caller, args.connection).await?;
                if let Some(error) = &schema.error {
                    warn!("Schema introspection failed: {}", error);
                }
                print_json(&schema)
            }
            Command::Sample(args) => {
                let outcome = self
                    .service
                    .sample(&self.caller, args.connection, &args.table)
                    .await?;
                print_json(&outcome)
            }
            Command::Stats(args) => {
                let stats = self.service.statistics(&self.caller, args.connection).await?;
                print_json(&stats)
            }
            Command::History(cmd) => self.history(cmd).await,
            Command::Audit(cmd) => self.audit(cmd).await,
        }
    }

    async fn connections(&self, command: ConnectionCommand) -> anyhow::Result<()> {
        match command {
            ConnectionCommand::List => print_json(&self.service.list(&self.caller).await?),
            ConnectionCommand::Show(args) => {
                print_json(&self.service.show(&self.caller, args.connection).await?)
            }
            ConnectionCommand::Add(args) => {
                let draft = draft_from_args(&self.caller.user_id, &args).await?;
                let ctx = self
                    .context()
                    .with_body(json!({ "name": draft.name, "type": draft.family }));
                let action = AuditedAction::new("create_connection", "connection")
                    .with_target_from_body("/id")
                    .with_details(|ctx, _| ctx.body.clone());

                let result = self.service.register(&self.caller, draft).await;
                self.observe(&action, &ctx, &result, 201).await;

                let summary = result?;
                info!("✓ Registered connection {} ({})", summary.name, summary.id);
                print_json(&summary)
            }
            ConnectionCommand::Check(args) => {
                let draft = draft_from_args(&self.caller.user_id, &args).await?;
                let test = self.service.test_draft(&draft).await?;
                if !test.success {
                    warn!("Connection test failed");
                }
                print_json(&test)
            }
            ConnectionCommand::Update(args) => {
                let update = update_from_args(&args).await?;
                let ctx = self
                    .context()
                    .with_param("id", args.connection.to_string())
                    .with_body(json!({ "updatedFields": update.present_fields() }));
                let action = AuditedAction::new("update_connection", "connection")
                    .with_target_param("id")
                    .with_details(|ctx, _| ctx.body.clone());

                let result = self.service.modify(&self.caller, args.connection, &update).await;
                self.observe(&action, &ctx, &result, 200).await;
                print_json(&result?)
            }
            ConnectionCommand::Remove(args) => {
                let ctx = self.context().with_param("id", args.connection.to_string());
                let action = AuditedAction::new("delete_connection", "connection").with_target_param("id");

                let result = self.service.remove(&self.caller, args.connection).await;
                self.observe(&action, &ctx, &result, 200).await;

                let deleted = result?;
                if !deleted {
                    warn!("No connection {} to remove", args.connection);
                }
                print_json(&json!({ "deleted": deleted }))
            }
            ConnectionCommand::Test(args) => {
                let test = self.service.test(&self.caller, args.connection).await?;
                if !test.success {
                    warn!("Connection test failed");
                }
                print_json(&test)
            }
        }
    }

    async fn query(&self, args: QueryArgs) -> anyhow::Result<()> {
        let auto_execute = !args.no_execute;
        let ctx = self
            .context()
            .with_param("connection", args.connection.to_string())
            .with_body(json!({ "question": args.question, "autoExecute": auto_execute }));
        let action = AuditedAction::new("execute_query", "connection")
            .with_target_param("connection")
            .with_details(|ctx, _| ctx.body.clone());

        let result = self
            .service
            .ask(&self.caller, args.connection, &args.question, auto_execute, &VerbatimSql)
            .await;
        self.observe(&action, &ctx, &result, 200).await;
        print_json(&result?)
    }

    async fn history(&self, command: HistoryCommand) -> anyhow::Result<()> {
        match command {
            HistoryCommand::List(page) => {
                let entries = self
                    .service
                    .query_history(&self.caller, page.page(DEFAULT_HISTORY_PAGE))
                    .await?;
                print_json(&entries)
            }
            HistoryCommand::Show { id } => {
                print_json(&self.service.history_entry(&self.caller, id).await?)
            }
            HistoryCommand::Remove { id } => {
                let ctx = self.context().with_param("id", id.to_string());
                let action =
                    AuditedAction::new("delete_query_history", "query_history").with_target_param("id");

                let result = self.service.remove_history(&self.caller, id).await;
                self.observe(&action, &ctx, &result, 200).await;
                print_json(&json!({ "deleted": result? }))
            }
        }
    }

    async fn audit(&self, command: AuditCommand) -> anyhow::Result<()> {
        match command {
            AuditCommand::List { for_user, page } => {
                let page = page.page(DEFAULT_AUDIT_PAGE);
                let entries = match for_user {
                    Some(user_id) => {
                        self.service
                            .audit_for_user(&self.caller, &user_id, page)
                            .await?
                    }
                    None => self.service.audit_log(&self.caller, page).await?,
                };
                print_json(&entries)
            }
        }
    }
}

/// Builds a draft owned by `owner` from either a URL or discrete fields.
async fn draft_from_args(owner: &str, args: &DraftArgs) -> anyhow::Result<ConnectionDraft> {
    let mut draft = if let Some(url) = &args.url {
        ConnectionDraft::from_url(owner, &args.name, url)?
    } else {
        let family = args
            .engine
            .context("Either --url or --engine is required")?;
        let mut draft = ConnectionDraft::new(owner, &args.name, family);
        draft.host.clone_from(&args.host);
        draft.port = args.port;
        draft.database.clone_from(&args.database);
        draft.username.clone_from(&args.username);
        draft.file_path.clone_from(&args.file_path);
        draft
    };

    if args.password_prompt {
        draft.secrets.password = Some(prompt_secret("Database password: ")?);
    }

    if let Some(mode) = args.tls.tls_mode {
        draft = draft.with_tls(mode);
    }
    if args.tls.no_verify {
        draft = draft.with_reject_unauthorized(false);
    }

    let (ca_cert, client_cert, client_key) = read_tls_material(&args.tls).await?;
    if let Some(pem) = ca_cert {
        draft.secrets.tls_ca_cert = Some(pem);
    }
    if let Some(pem) = client_cert {
        draft.secrets.tls_client_cert = Some(pem);
    }
    if let Some(pem) = client_key {
        draft.secrets.tls_client_key = Some(pem);
    }

    Ok(draft)
}

/// Collects the fields an update command actually set.
async fn update_from_args(args: &UpdateArgs) -> anyhow::Result<ConnectionUpdate> {
    let mut update = ConnectionUpdate {
        name: args.name.clone(),
        host: args.host.clone(),
        port: args.port,
        database: args.database.clone(),
        username: args.username.clone(),
        file_path: args.file_path.clone(),
        tls_enabled: args.tls_enabled,
        tls_mode: args.tls.tls_mode,
        tls_reject_unauthorized: args.reject_unauthorized,
        ..ConnectionUpdate::default()
    };

    if args.tls.no_verify {
        update.tls_reject_unauthorized = Some(false);
    }
    if args.password_prompt {
        update.password = Some(prompt_secret("New database password: ")?);
    }

    let (ca_cert, client_cert, client_key) = read_tls_material(&args.tls).await?;
    update.tls_ca_cert = ca_cert;
    update.tls_client_cert = client_cert;
    update.tls_client_key = client_key;

    Ok(update)
}

type TlsMaterial = (
    Option<Zeroizing<String>>,
    Option<Zeroizing<String>>,
    Option<Zeroizing<String>>,
);

async fn read_tls_material(args: &TlsArgs) -> anyhow::Result<TlsMaterial> {
    Ok((
        read_pem(args.ca_cert.as_deref()).await?,
        read_pem(args.client_cert.as_deref()).await?,
        read_pem(args.client_key.as_deref()).await?,
    ))
}

async fn read_pem(path: Option<&Path>) -> anyhow::Result<Option<Zeroizing<String>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let pem = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(Zeroizing::new(pem)))
}

fn prompt_secret(prompt: &str) -> anyhow::Result<Zeroizing<String>> {
    rpassword::prompt_password(prompt)
        .map(Zeroizing::new)
        .context("Failed to read password")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dbgateway_core::security::KdfParams;
    use dbgateway_core::{Cipher, EngineFamily, Gateway, TlsMode, Vault};

    use super::*;
    use crate::{PageArgs, SampleArgs, TargetArgs};

    async fn session(vault: &Vault, caller: Caller) -> Session {
        let params = KdfParams {
            memory_cost: 64,
            time_cost: 1,
            parallelism: 1,
        };
        let cipher = Arc::new(Cipher::with_params("cli-test-secret-value", params).unwrap());
        let service = GatewayService::with_vault(vault, cipher, Gateway::default());
        Session::new(service, caller, Some("127.0.0.1".to_string()))
    }

    fn draft_args(name: &str) -> DraftArgs {
        DraftArgs {
            name: name.to_string(),
            url: None,
            engine: None,
            host: None,
            port: None,
            database: None,
            username: None,
            file_path: None,
            password_prompt: false,
            tls: TlsArgs {
                tls_mode: None,
                no_verify: false,
                ca_cert: None,
                client_cert: None,
                client_key: None,
            },
        }
    }

    /// An empty file is a valid, empty SQLite database.
    fn empty_database(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("target.db");
        std::fs::write(&path, b"").unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_draft_from_url_owned_by_caller() {
        let mut args = draft_args("sales");
        args.url = Some("postgres://report:pw@db.internal:6543/sales?sslmode=require".to_string());

        let draft = draft_from_args("alice", &args).await.unwrap();
        assert_eq!(draft.owner_id, "alice");
        assert_eq!(draft.family, EngineFamily::Postgres);
        assert_eq!(draft.port, Some(6543));
        assert_eq!(draft.tls.mode, TlsMode::Require);
        assert_eq!(draft.secrets.password.as_deref().map(String::as_str), Some("pw"));
    }

    #[tokio::test]
    async fn test_draft_without_url_needs_engine() {
        let args = draft_args("nothing");
        let err = draft_from_args("alice", &args).await.unwrap_err();
        assert!(err.to_string().contains("--engine"));
    }

    #[tokio::test]
    async fn test_draft_reads_tls_material_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "-----BEGIN CERTIFICATE-----\nabc\n").unwrap();

        let mut args = draft_args("tls");
        args.engine = Some(EngineFamily::Mysql);
        args.host = Some("db".to_string());
        args.tls.tls_mode = Some(TlsMode::VerifyCa);
        args.tls.no_verify = true;
        args.tls.ca_cert = Some(ca);

        let draft = draft_from_args("alice", &args).await.unwrap();
        assert!(draft.tls.enabled);
        assert!(!draft.tls.reject_unauthorized);
        assert!(draft.secrets.tls_ca_cert.is_some());
        assert!(draft.secrets.tls_client_key.is_none());
    }

    #[tokio::test]
    async fn test_missing_pem_file_is_an_error() {
        let mut args = draft_args("tls");
        args.engine = Some(EngineFamily::Postgres);
        args.tls.client_key = Some("/nonexistent/client.key".into());

        assert!(draft_from_args("alice", &args).await.is_err());
    }

    #[tokio::test]
    async fn test_update_collects_only_given_fields() {
        let args = UpdateArgs {
            connection: uuid::Uuid::new_v4(),
            name: Some("renamed".to_string()),
            host: None,
            port: Some(5433),
            database: None,
            username: None,
            file_path: None,
            password_prompt: false,
            tls_enabled: None,
            reject_unauthorized: None,
            tls: TlsArgs {
                tls_mode: None,
                no_verify: true,
                ca_cert: None,
                client_cert: None,
                client_key: None,
            },
        };

        let update = update_from_args(&args).await.unwrap();
        assert_eq!(update.present_fields(), vec!["name", "port", "ssl_reject_unauthorized"]);
        assert!(update.touches_connectivity());
    }

    #[tokio::test]
    async fn test_add_and_query_write_audit_entries() {
        let vault = Vault::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let alice = session(&vault, Caller::user("alice")).await;

        let mut args = draft_args("local");
        args.engine = Some(EngineFamily::Sqlite);
        args.file_path = Some(empty_database(&dir));
        alice
            .run(Command::Connections(ConnectionCommand::Add(args)))
            .await
            .unwrap();

        let connection = alice.service.list(&alice.caller).await.unwrap().remove(0);
        alice
            .run(Command::Query(QueryArgs {
                connection: connection.id,
                question: "SELECT 1 AS one".to_string(),
                no_execute: false,
            }))
            .await
            .unwrap();
        alice.flush().await;

        let entries = vault.audit().list_for_user("alice", None).await.unwrap();
        let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["execute_query", "create_connection"]);

        let created = &entries[1];
        assert_eq!(created.target_id.as_deref(), Some(connection.id.to_string().as_str()));
        assert_eq!(created.ip_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(created.details.as_ref().unwrap()["type"], "sqlite");

        let history = alice.service.query_history(&alice.caller, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn test_remove_audit_entry_lands_on_flush() {
        let vault = Vault::in_memory().await.unwrap();
        let alice = session(&vault, Caller::user("alice")).await;
        let unknown = uuid::Uuid::new_v4();

        alice
            .run(Command::Connections(ConnectionCommand::Remove(TargetArgs {
                connection: unknown,
            })))
            .await
            .unwrap();
        alice.flush().await;
        alice.flush().await;

        let entries = vault.audit().list_for_user("alice", None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "delete_connection");
        assert_eq!(entries[0].target_id.as_deref(), Some(unknown.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_failed_update_writes_failed_audit_entry() {
        let vault = Vault::in_memory().await.unwrap();
        let alice = session(&vault, Caller::user("alice")).await;
        let unknown = uuid::Uuid::new_v4();

        let result = alice
            .run(Command::Connections(ConnectionCommand::Update(UpdateArgs {
                connection: unknown,
                name: Some("x".to_string()),
                host: None,
                port: None,
                database: None,
                username: None,
                file_path: None,
                password_prompt: false,
                tls_enabled: None,
                reject_unauthorized: None,
                tls: TlsArgs {
                    tls_mode: None,
                    no_verify: false,
                    ca_cert: None,
                    client_cert: None,
                    client_key: None,
                },
            })))
            .await;
        assert!(result.is_err());
        alice.flush().await;

        let entries = vault.audit().list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "FAILED_update_connection");
        assert_eq!(entries[0].target_id.as_deref(), Some(unknown.to_string().as_str()));
        assert_eq!(entries[0].details.as_ref().unwrap()["statusCode"], 404);
    }

    #[tokio::test]
    async fn test_reads_are_not_audited() {
        let vault = Vault::in_memory().await.unwrap();
        let alice = session(&vault, Caller::user("alice")).await;

        alice
            .run(Command::Connections(ConnectionCommand::List))
            .await
            .unwrap();
        let missing = alice
            .run(Command::Sample(SampleArgs {
                connection: uuid::Uuid::new_v4(),
                table: "t".to_string(),
            }))
            .await;
        assert!(missing.is_err());
        let missing = alice
            .run(Command::Schema(TargetArgs {
                connection: uuid::Uuid::new_v4(),
            }))
            .await;
        assert!(missing.is_err());
        alice.flush().await;

        assert!(vault.audit().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_listing_requires_admin() {
        let vault = Vault::in_memory().await.unwrap();
        let alice = session(&vault, Caller::user("alice")).await;
        let root = session(&vault, Caller::admin("root")).await;
        let list = || {
            Command::Audit(AuditCommand::List {
                for_user: None,
                page: PageArgs {
                    limit: None,
                    offset: 0,
                },
            })
        };

        assert!(alice.run(list()).await.is_err());
        root.run(list()).await.unwrap();
    }
}
