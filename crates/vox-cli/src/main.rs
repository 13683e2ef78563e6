//! `vox` — operator CLI over the orchestration control plane.
//!
//! Generalized from this lineage's existing CLI (`db` subcommand delegation
//! + `config-hash`) to also drive the `/v1/orchestration/*` HTTP endpoints;
//! the workspace's own CLI never called its own daemon over HTTP before, so
//! those subcommands are grounded on the request/response envelope shapes
//! in `vox-orchestrator`'s route handlers rather than on a prior CLI
//! pattern.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vox_schemas::BindingId;

#[derive(Parser)]
#[command(name = "vox")]
#[command(about = "Transaction orchestrator operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands (registry schema).
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON.
    ConfigHash {
        /// Paths in merge order (base -> environment -> per-deployment).
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Orchestration control-plane commands (calls the HTTP API).
    Orchestration {
        #[command(subcommand)]
        cmd: OrchestrationCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum OrchestrationCmd {
    /// Start (or restart with new config) a set of bindings.
    Start {
        #[arg(long, required = true, value_delimiter = ',')]
        binding_ids: Vec<BindingId>,
        #[arg(long)]
        product_id: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        limit_harga: i64,
        #[arg(long, default_value_t = 800)]
        interval_ms: u64,
        #[arg(long, default_value_t = 3)]
        max_retry_status: u32,
        #[arg(long, default_value_t = 1000)]
        cooldown_on_error_ms: u64,
    },
    /// Pause a set of running bindings.
    Pause {
        #[arg(long, required = true, value_delimiter = ',')]
        binding_ids: Vec<BindingId>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume a set of paused bindings.
    Resume {
        #[arg(long, required = true, value_delimiter = ',')]
        binding_ids: Vec<BindingId>,
    },
    /// Stop a set of bindings. Idempotent: a no-op still sets `stopped`.
    Stop {
        #[arg(long, required = true, value_delimiter = ',')]
        binding_ids: Vec<BindingId>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Print current WorkerState for a set of bindings.
    Status {
        #[arg(long, required = true, value_delimiter = ',')]
        binding_ids: Vec<BindingId>,
    },
    /// Print the full registry snapshot + aggregates.
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = vox_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = vox_db::status(&pool).await?;
                    println!("db_ok={} has_orchestration_tables={}", s.ok, s.has_orchestration_tables);
                }
                DbCmd::Migrate => {
                    vox_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = vox_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Orchestration { cmd } => run_orchestration(cmd).await?,
    }

    Ok(())
}

fn orchestrator_base_url() -> String {
    std::env::var("VOX_ORCHESTRATOR_URL").unwrap_or_else(|_| "http://127.0.0.1:8900".to_string())
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")
}

async fn run_orchestration(cmd: OrchestrationCmd) -> Result<()> {
    let client = http_client()?;
    let base = orchestrator_base_url();

    let (path, body) = match cmd {
        OrchestrationCmd::Start {
            binding_ids,
            product_id,
            email,
            limit_harga,
            interval_ms,
            max_retry_status,
            cooldown_on_error_ms,
        } => (
            "start",
            serde_json::json!({
                "binding_ids": binding_ids,
                "product_id": product_id,
                "email": email,
                "limit_harga": limit_harga,
                "interval_ms": interval_ms,
                "max_retry_status": max_retry_status,
                "cooldown_on_error_ms": cooldown_on_error_ms,
            }),
        ),
        OrchestrationCmd::Pause { binding_ids, reason } => (
            "pause",
            serde_json::json!({ "binding_ids": binding_ids, "reason": reason }),
        ),
        OrchestrationCmd::Resume { binding_ids } => {
            ("resume", serde_json::json!({ "binding_ids": binding_ids }))
        }
        OrchestrationCmd::Stop { binding_ids, reason } => (
            "stop",
            serde_json::json!({ "binding_ids": binding_ids, "reason": reason }),
        ),
        OrchestrationCmd::Status { binding_ids } => {
            ("status", serde_json::json!({ "binding_ids": binding_ids }))
        }
        OrchestrationCmd::Monitor => {
            let resp = client
                .get(format!("{base}/v1/orchestration/monitor"))
                .send()
                .await
                .context("GET /v1/orchestration/monitor")?;
            return print_response(resp).await;
        }
    };

    let resp = client
        .post(format!("{base}/v1/orchestration/{path}"))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST /v1/orchestration/{path}"))?;
    print_response(resp).await
}

async fn print_response(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding JSON response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("orchestrator returned {status}");
    }
    Ok(())
}
