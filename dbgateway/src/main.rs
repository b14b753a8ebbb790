//! Multi-user database gateway.
//!
//! This binary manages per-user database connections stored in an encrypted
//! vault, runs statements against them and reports their schemas. Every
//! mutating command is written to the audit trail.
//!
//! # Security Guarantees
//! - Passwords and TLS material are encrypted before they reach the vault
//! - Secrets are prompted for, never taken as plain command-line values
//! - Connections are only visible to the user who registered them

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dbgateway_core::config::{
    DEFAULT_VAULT_URL, ENV_CONNECT_TIMEOUT, ENV_ENCRYPTION_KEY, ENV_QUERY_TIMEOUT, ENV_VAULT_URL,
};
use dbgateway_core::logging::{LogFormat, init_logging};
use dbgateway_core::{Caller, EngineFamily, GatewayConfig, GatewayService, Page, Role, TlsMode};
use tracing::{debug, error};
use uuid::Uuid;
use zeroize::Zeroizing;

mod commands;
mod output;

use commands::Session;

#[derive(Parser)]
#[command(name = "dbgateway")]
#[command(about = "Multi-user database gateway with an encrypted connection vault")]
#[command(version)]
#[command(long_about = "
dbgateway - Per-user database connections behind one gateway

Register connections to PostgreSQL, MySQL and SQLite databases, then run
statements, inspect schemas and sample tables through them. Connection
secrets are encrypted at rest and every connection is private to the user
who registered it.

SECURITY FEATURES:
- AES-GCM encrypted passwords and TLS material (Argon2id-derived key)
- Secrets are prompted for and never logged
- Per-user isolation of connections and query history
- Audit trail of every change, readable by administrators

SUPPORTED DATABASES:
- PostgreSQL (postgres://) [feature postgresql]
- MySQL (mysql://) [feature mysql]
- SQLite (sqlite:// or --engine sqlite --file-path)

EXAMPLES:
  dbgateway --user alice connections add --name reporting --url postgres://report@db/sales --password-prompt
  dbgateway --user alice query 3f0c... 'SELECT count(*) FROM orders'
  dbgateway --user root --role admin audit list --limit 50
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(flatten)]
    pub vault: VaultArgs,

    #[command(flatten)]
    pub identity: IdentityArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all log output except errors")]
    pub quiet: bool,

    /// Log line format
    #[arg(long, global = true, default_value = "text", help = "Log format (text or json)")]
    pub log_format: LogFormat,
}

#[derive(Args)]
pub struct VaultArgs {
    /// Vault database URL
    #[arg(long, env = ENV_VAULT_URL, default_value = DEFAULT_VAULT_URL, help = "SQLite URL of the connection vault")]
    pub vault: String,

    /// Vault encryption secret
    #[arg(
        long,
        env = ENV_ENCRYPTION_KEY,
        hide_env_values = true,
        help = "Secret used to derive the vault encryption key (prompted for when absent)"
    )]
    pub encryption_key: Option<String>,

    /// Connect timeout in seconds
    #[arg(long, env = ENV_CONNECT_TIMEOUT, default_value_t = 10, help = "Seconds to wait for a target database to accept a connection")]
    pub connect_timeout: u64,

    /// Statement timeout in seconds
    #[arg(long, env = ENV_QUERY_TIMEOUT, help = "Seconds a single statement may run")]
    pub query_timeout: Option<u64>,
}

#[derive(Args)]
pub struct IdentityArgs {
    /// Acting user
    #[arg(long, global = true, env = "DBGATEWAY_USER", help = "Identifier of the acting user")]
    pub user: Option<String>,

    /// Acting role
    #[arg(long, global = true, default_value = "user", help = "Role of the acting user (user or admin)")]
    pub role: Role,

    /// Caller address recorded in the audit trail
    #[arg(long, global = true, help = "Client address to record in the audit trail")]
    pub ip: Option<String>,
}

impl IdentityArgs {
    fn caller(&self) -> anyhow::Result<Caller> {
        let user_id = self
            .user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("--user (or DBGATEWAY_USER) is required"))?;
        Ok(Caller {
            user_id: user_id.to_string(),
            role: self.role,
        })
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage registered connections
    #[command(subcommand)]
    Connections(ConnectionCommand),
    /// Run a statement against a connection
    Query(QueryArgs),
    /// Show the normalized schema of a connection
    Schema(TargetArgs),
    /// Show a bounded sample of one table
    Sample(SampleArgs),
    /// Show per-table statistics
    Stats(TargetArgs),
    /// Browse and prune query history
    #[command(subcommand)]
    History(HistoryCommand),
    /// Read the audit trail (administrators only)
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand)]
pub enum ConnectionCommand {
    /// List your connections
    List,
    /// Show one connection
    Show(TargetArgs),
    /// Test and register a new connection
    Add(DraftArgs),
    /// Test a connection without registering it
    Check(DraftArgs),
    /// Change fields of a connection
    Update(UpdateArgs),
    /// Remove a connection
    Remove(TargetArgs),
    /// Test a registered connection
    Test(TargetArgs),
}

#[derive(Args)]
pub struct TargetArgs {
    /// Connection identifier
    #[arg(help = "Connection id")]
    pub connection: Uuid,
}

#[derive(Args)]
pub struct DraftArgs {
    /// Display name
    #[arg(long, help = "Display name of the connection")]
    pub name: String,

    /// Connection URL
    #[arg(
        long,
        conflicts_with_all = ["engine", "host", "port", "database", "username", "file_path"],
        help = "Connection URL (postgres://, mysql:// or sqlite://); credentials are moved into the vault"
    )]
    pub url: Option<String>,

    /// Engine family
    #[arg(long, help = "Engine family (postgres, mysql or sqlite)")]
    pub engine: Option<EngineFamily>,

    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Database name
    #[arg(long)]
    pub database: Option<String>,

    /// Login user
    #[arg(long)]
    pub username: Option<String>,

    /// Database file for SQLite
    #[arg(long)]
    pub file_path: Option<String>,

    /// Prompt for the password
    #[arg(long, help = "Prompt for the database password")]
    pub password_prompt: bool,

    #[command(flatten)]
    pub tls: TlsArgs,
}

#[derive(Args)]
pub struct TlsArgs {
    /// TLS mode
    #[arg(long, help = "TLS mode (disable, allow, prefer, require, verify-ca, verify-full)")]
    pub tls_mode: Option<TlsMode>,

    /// Skip certificate verification
    #[arg(long, help = "Accept server certificates that fail verification")]
    pub no_verify: bool,

    /// CA certificate file
    #[arg(long, help = "PEM file with the CA certificate")]
    pub ca_cert: Option<std::path::PathBuf>,

    /// Client certificate file
    #[arg(long, help = "PEM file with the client certificate")]
    pub client_cert: Option<std::path::PathBuf>,

    /// Client key file
    #[arg(long, help = "PEM file with the client private key")]
    pub client_key: Option<std::path::PathBuf>,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Connection identifier
    #[arg(help = "Connection id")]
    pub connection: Uuid,

    /// New display name
    #[arg(long)]
    pub name: Option<String>,

    /// New host
    #[arg(long)]
    pub host: Option<String>,

    /// New port
    #[arg(long)]
    pub port: Option<u16>,

    /// New database name
    #[arg(long)]
    pub database: Option<String>,

    /// New login user
    #[arg(long)]
    pub username: Option<String>,

    /// New SQLite file
    #[arg(long)]
    pub file_path: Option<String>,

    /// Prompt for a new password
    #[arg(long, help = "Prompt for a new database password")]
    pub password_prompt: bool,

    /// Turn TLS on or off
    #[arg(long, help = "Enable or disable TLS (true or false)")]
    pub tls_enabled: Option<bool>,

    /// Require verified certificates
    #[arg(long, help = "Reject certificates that fail verification (true or false)")]
    pub reject_unauthorized: Option<bool>,

    #[command(flatten)]
    pub tls: TlsArgs,
}

#[derive(Args)]
pub struct QueryArgs {
    /// Connection identifier
    #[arg(help = "Connection id")]
    pub connection: Uuid,

    /// Statement to run
    #[arg(help = "Statement (or question) to run")]
    pub question: String,

    /// Record the attempt without executing it
    #[arg(long, help = "Only generate the statement; do not execute it")]
    pub no_execute: bool,
}

#[derive(Args)]
pub struct SampleArgs {
    /// Connection identifier
    #[arg(help = "Connection id")]
    pub connection: Uuid,

    /// Table to sample
    #[arg(help = "Table name")]
    pub table: String,
}

#[derive(Args)]
pub struct PageArgs {
    /// Maximum entries to return
    #[arg(long, help = "Maximum number of entries")]
    pub limit: Option<u32>,

    /// Entries to skip
    #[arg(long, default_value_t = 0, help = "Number of newest entries to skip")]
    pub offset: u32,
}

impl PageArgs {
    /// `None` keeps the store's default window.
    pub fn page(&self, default: Page) -> Option<Page> {
        if self.limit.is_none() && self.offset == 0 {
            return None;
        }
        Some(Page::new(self.limit.unwrap_or(default.limit), self.offset))
    }
}

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// List your query history, newest first
    List(PageArgs),
    /// Show one history entry
    Show {
        /// Entry identifier
        id: Uuid,
    },
    /// Remove one history entry
    Remove {
        /// Entry identifier
        id: Uuid,
    },
}

#[derive(Subcommand)]
pub enum AuditCommand {
    /// List audit entries, newest first
    List {
        /// Only entries of this user
        #[arg(long)]
        for_user: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format)?;

    let caller = cli.identity.caller()?;
    let config = gateway_config(&cli.vault)?;
    debug!("Acting as {} ({:?})", caller.user_id, caller.role);

    let service = GatewayService::from_config(&config).await.map_err(|e| {
        error!("Failed to start gateway: {}", e);
        e
    })?;

    let session = Session::new(service, caller, cli.identity.ip.clone());
    let result = session.run(cli.command).await;

    // Audit and history writes run in the background; let them land before exit
    session.flush().await;

    if let Err(ref e) = result {
        error!("{:#}", e);
    }
    result
}

/// Builds the gateway configuration, prompting for the vault secret when absent.
fn gateway_config(args: &VaultArgs) -> anyhow::Result<GatewayConfig> {
    let secret = match &args.encryption_key {
        Some(key) => Zeroizing::new(key.clone()),
        None => Zeroizing::new(rpassword::prompt_password("Vault encryption key: ").map_err(|e| {
            anyhow::anyhow!("Failed to read vault encryption key: {e}")
        })?),
    };

    let mut config = GatewayConfig::new(args.vault.clone(), secret.as_str())
        .with_connect_timeout(Duration::from_secs(args.connect_timeout));
    if let Some(seconds) = args.query_timeout {
        config = config.with_query_timeout(Duration::from_secs(seconds));
    }

    config.validate()?;
    Ok(config)
}
