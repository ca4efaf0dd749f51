#![allow(missing_docs)]

//! Straylight — admission gate for autonomous agent work.
//!
//! Single Rust binary. Serves the admission HTTP surface, sweeps
//! timed-out work, and arms the emergency watchdog.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use straylight::config::GateConfig;
use straylight::gate::audit::{AuditReporter, AuditStore, SqliteAuditStore};
use straylight::gate::ledger::SessionLedger;
use straylight::gate::pipeline::Gate;
use straylight::gate::policy::PolicyStore;
use straylight::gate::tracker::WorkTracker;
use straylight::gate::watchdog::Watchdog;
use straylight::logging;
use straylight::server::{self, AppState};
use straylight::token::{mint, random_nonce, TokenClaims, TokenValidator};
use straylight::types::TrustLevel;

#[derive(Parser)]
#[command(name = "straylight", version, about = "Admission gate for autonomous agent work")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gate service.
    Start,
    /// Validate configuration and the committed policy, then exit.
    CheckConfig,
    /// Sign a blessing token with a configured issuer key (dev/ops helper).
    MintToken {
        /// Issuer whose key signs the token.
        #[arg(long)]
        issuer: String,
        /// Trust level: guest, trusted, operator, or system-blessed.
        #[arg(long, default_value = "trusted")]
        level: String,
        /// Seconds until the token expires.
        #[arg(long, default_value_t = 900)]
        ttl_secs: i64,
        /// Agent scope; repeat for several agents, omit for all agents.
        #[arg(long = "agent")]
        agents: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start => start().await,
        Command::CheckConfig => {
            logging::init_cli();
            check_config()
        }
        Command::MintToken {
            issuer,
            level,
            ttl_secs,
            agents,
        } => {
            logging::init_cli();
            mint_token(&issuer, &level, ttl_secs, agents)
        }
    }
}

async fn start() -> Result<()> {
    // Precedence: env vars > ./straylight.toml > defaults.
    let config = GateConfig::load().context("failed to load configuration")?;

    let _logging = logging::init_production(
        Path::new(&config.paths.logs_dir),
        &config.runtime.log_level,
    )?;
    info!(version = env!("CARGO_PKG_VERSION"), "straylight starting");

    // Components, leaves first: policy, validator, ledger, audit store.
    let policy = Arc::new(
        PolicyStore::open(Path::new(&config.paths.policy_file), config.policy.clone())
            .context("failed to open policy store")?,
    );
    let validator = Arc::new(TokenValidator::new(
        config.token.issuer_keys().context("bad issuer key set")?,
    ));
    if config.token.issuers.is_empty() {
        warn!("no token issuers configured; every blessing check will fail");
    }
    let ledger = Arc::new(SessionLedger::new());

    let store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::open(Path::new(&config.paths.audit_db))
            .await
            .context("failed to open audit store")?,
    );
    let (audit, audit_writer) = AuditReporter::spawn(store, Arc::clone(&ledger));

    // Tracker and pipeline on top.
    let tracker = Arc::new(WorkTracker::new(
        Arc::clone(&ledger),
        Arc::clone(&policy),
        audit.clone(),
    ));
    let gate = Arc::new(Gate::new(
        Arc::clone(&policy),
        validator,
        Arc::clone(&ledger),
        tracker,
        audit.clone(),
    ));

    // Emergency watchdog: trips EmergencySafe with no credential.
    let watchdog = Watchdog::new(
        Arc::clone(&policy),
        audit.clone(),
        PathBuf::from(&config.paths.trip_file),
    )
    .spawn()
    .context("failed to arm emergency watchdog")?;

    // Timeout/expiry sweeper.
    let sweeper = Gate::spawn_sweeper(
        Arc::clone(&gate),
        Duration::from_secs(config.runtime.sweep_interval_secs.max(1)),
    );

    server::serve(
        AppState {
            gate: Arc::clone(&gate),
        },
        &config.runtime.bind_addr,
    )
    .await?;

    // Stop background work, then flush the audit queue by dropping every
    // reporter clone and waiting for the writer to drain.
    info!("straylight shutting down");
    sweeper.abort();
    watchdog.task.abort();
    drop(watchdog);
    drop(gate);
    drop(audit);
    if tokio::time::timeout(Duration::from_secs(5), audit_writer)
        .await
        .is_err()
    {
        warn!("audit writer did not drain within the shutdown timeout");
    }
    Ok(())
}

fn check_config() -> Result<()> {
    let config = GateConfig::load().context("failed to load configuration")?;
    let keys = config.token.issuer_keys().context("bad issuer key set")?;
    let policy = PolicyStore::open(Path::new(&config.paths.policy_file), config.policy.clone())
        .context("committed policy is not servable")?;
    let current = policy.current();

    println!("configuration ok");
    println!("  bind addr:   {}", config.runtime.bind_addr);
    println!("  policy file: {}", config.paths.policy_file);
    println!("  audit db:    {}", config.paths.audit_db);
    println!("  trip file:   {}", config.paths.trip_file);
    println!(
        "  policy:      mode={} version={} reflection_enabled={}",
        current.mode.as_str(),
        current.version,
        current.reflection_enabled
    );
    println!(
        "  whitelist:   {} agent(s), {} issuer key(s)",
        current.agent_whitelist.len(),
        keys.len()
    );
    Ok(())
}

fn mint_token(issuer: &str, level: &str, ttl_secs: i64, agents: Vec<String>) -> Result<()> {
    let config = GateConfig::load().context("failed to load configuration")?;
    let keys = config.token.issuer_keys().context("bad issuer key set")?;
    let key = keys
        .get(issuer)
        .with_context(|| format!("issuer '{issuer}' is not configured"))?;

    let level = parse_level(level)?;
    let expires_at = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::seconds(ttl_secs))
        .context("ttl out of range")?;
    let claims = TokenClaims {
        level,
        expires_at,
        issuer: issuer.to_owned(),
        scoped_agents: agents,
        nonce: random_nonce(),
    };
    println!("{}", mint(key, &claims));
    Ok(())
}

fn parse_level(level: &str) -> Result<TrustLevel> {
    match level {
        "guest" => Ok(TrustLevel::Guest),
        "trusted" => Ok(TrustLevel::Trusted),
        "operator" => Ok(TrustLevel::Operator),
        "system-blessed" | "system_blessed" => Ok(TrustLevel::SystemBlessed),
        other => anyhow::bail!(
            "unknown level '{other}' (expected guest, trusted, operator, or system-blessed)"
        ),
    }
}
