//! Tillsync CLI - operate a POS terminal's sync engine from the shell.
//!
//! Useful for provisioning a terminal, inspecting its offline queue and
//! forcing reconciliation without the UI.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tillsync_api::Connectivity;
use tillsync_app::{Operator, OperationStatus, Terminal, TerminalConfig};
use tillsync_common::Credential;
use tillsync_store::{OperationKind, SyncTarget};
use tillsync_sync::InvalidationSignal;

const CONFIG_FILE: &str = "terminal.json";

#[derive(Parser)]
#[command(name = "tillsync")]
#[command(about = "Tillsync - offline-first POS terminal sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: terminal.json in the data directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file for this terminal.
    Init {
        /// Backend base URL.
        #[arg(long)]
        base_url: String,

        /// Realtime WebSocket URL.
        #[arg(long)]
        realtime_url: Option<String>,

        #[arg(long)]
        branch: String,

        #[arg(long)]
        tenant: String,

        /// Device identifier (default: generated).
        #[arg(long)]
        device: Option<String>,
    },

    /// Store a session credential obtained from sign-in.
    Login {
        /// Operator user id to cache.
        #[arg(long)]
        user: Option<String>,

        #[arg(long, default_value = "")]
        name: String,

        #[arg(long, default_value = "cashier")]
        role: String,
    },

    /// Tear down the local session.
    Logout,

    /// Show connectivity, session, queue and reference data counts.
    Status,

    /// Reconcile reference data now.
    Sync {
        /// "catalog", "pricing" or "all".
        #[arg(short, long, default_value = "all")]
        target: String,

        /// Replace local data instead of applying changes since the cursor.
        #[arg(long)]
        full: bool,
    },

    /// Submit pending operations now.
    Drain,

    /// List operations not yet accepted by the server.
    Pending,

    /// Delete synced operations past retention.
    Purge,

    /// Queue an operation, e.g. `enqueue close-till '{"amount":500}'`.
    Enqueue {
        kind: String,

        /// JSON object payload.
        payload: String,
    },

    /// Run background sync and print invalidations until Ctrl-C.
    Listen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = data_dir()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));

    match cli.command {
        Commands::Init {
            base_url,
            realtime_url,
            branch,
            tenant,
            device,
        } => cmd_init(
            &config_path,
            base_url,
            realtime_url,
            branch,
            tenant,
            device,
        ),

        Commands::Login { user, name, role } => {
            cmd_login(&open_terminal(&config_path, &data_dir)?, user, name, role).await
        }

        Commands::Logout => cmd_logout(&open_terminal(&config_path, &data_dir)?).await,

        Commands::Status => cmd_status(&open_terminal(&config_path, &data_dir)?).await,

        Commands::Sync { target, full } => {
            cmd_sync(&open_terminal(&config_path, &data_dir)?, &target, full).await
        }

        Commands::Drain => cmd_drain(&open_terminal(&config_path, &data_dir)?).await,

        Commands::Pending => cmd_pending(&open_terminal(&config_path, &data_dir)?).await,

        Commands::Purge => cmd_purge(&open_terminal(&config_path, &data_dir)?).await,

        Commands::Enqueue { kind, payload } => {
            cmd_enqueue(&open_terminal(&config_path, &data_dir)?, &kind, &payload).await
        }

        Commands::Listen => cmd_listen(&open_terminal(&config_path, &data_dir)?).await,
    }
}

/// Local wall-clock time plus age, e.g. `2026-10-18 09:12:03 (4m ago)`.
fn format_timestamp(at: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(at);
    let age = if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m", age.num_minutes())
    } else {
        format!("{}s", age.num_seconds().max(0))
    };

    format!(
        "{} ({} ago)",
        at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        age
    )
}

fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("No data directory on this platform")?;
    Ok(base.join("tillsync"))
}

fn open_terminal(config_path: &Path, data_dir: &Path) -> Result<Terminal> {
    let config = TerminalConfig::load(config_path).with_context(|| {
        format!(
            "Failed to load {} (run `tillsync init` first)",
            config_path.display()
        )
    })?;
    std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
    let terminal = Terminal::open(config, data_dir).context("Failed to open terminal")?;
    Ok(terminal)
}

/// Write a fresh config file.
fn cmd_init(
    config_path: &Path,
    base_url: String,
    realtime_url: Option<String>,
    branch: String,
    tenant: String,
    device: Option<String>,
) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config already exists at {}", config_path.display());
    }

    let mut config = TerminalConfig {
        branch_id: branch,
        tenant_id: tenant,
        ..TerminalConfig::default()
    };
    if let Some(device) = device {
        config.device_id = device;
    }
    config.api.base_url = base_url;
    if let Some(url) = realtime_url {
        config.realtime.url = url;
    }
    config.identity().context("Invalid terminal identity")?;

    config.save(config_path).context("Failed to write config")?;

    println!("Terminal configured.");
    println!("  Device: {}", config.device_id);
    println!("  Config: {}", config_path.display());

    Ok(())
}

/// Store tokens read from the terminal.
async fn cmd_login(
    terminal: &Terminal,
    user: Option<String>,
    name: String,
    role: String,
) -> Result<()> {
    let access = rpassword::prompt_password("Access token: ").context("Failed to read token")?;
    let refresh =
        rpassword::prompt_password("Refresh token (blank for none): ").context("Failed to read token")?;

    if access.trim().is_empty() {
        anyhow::bail!("Access token cannot be empty");
    }
    let refresh = Some(refresh.trim().to_string()).filter(|t| !t.is_empty());

    let operator = user.map(|user_id| Operator {
        display_name: if name.is_empty() { user_id.clone() } else { name },
        user_id,
        role,
    });

    terminal
        .sign_in(Credential::new(access.trim(), refresh), operator.as_ref())
        .await
        .context("Failed to store credential")?;

    println!("Signed in.");
    Ok(())
}

async fn cmd_logout(terminal: &Terminal) -> Result<()> {
    terminal
        .session()
        .teardown()
        .await
        .context("Failed to tear down session")?;
    println!("Signed out.");
    Ok(())
}

/// Show terminal status.
async fn cmd_status(terminal: &Terminal) -> Result<()> {
    let online = terminal.probe_connectivity().await;
    let status = terminal.status().await.context("Failed to read status")?;
    let identity = terminal.identity();

    println!("Terminal {}", identity.device_id);
    println!("  Branch: {}", identity.branch_id);
    println!("  Tenant: {}", identity.tenant_id);
    println!("  Online: {}", if online { "yes" } else { "no" });
    println!("  Signed in: {}", if status.signed_in { "yes" } else { "no" });
    if let Some(operator) = &status.operator {
        println!("  Operator: {} ({})", operator.display_name, operator.role);
    }
    println!("Queue:");
    println!("  Pending: {}", status.queue.pending);
    println!("  Synced: {}", status.queue.synced);
    if let Some(oldest) = status.queue.oldest_pending {
        println!("  Oldest pending: {}", format_timestamp(oldest));
    }
    println!("Reference data:");
    println!("  Categories: {}", status.reference.categories);
    println!("  Products: {}", status.reference.products);
    println!("  Sizes: {}", status.reference.sizes);
    println!("  Price tiers: {}", status.reference.price_tiers);

    Ok(())
}

/// Reconcile reference data.
async fn cmd_sync(terminal: &Terminal, target: &str, full: bool) -> Result<()> {
    let target = SyncTarget::parse(target)
        .with_context(|| format!("Unknown target '{}'. Use: catalog, pricing, or all", target))?;
    info!("Syncing {} ({})", target, if full { "full" } else { "incremental" });

    let report = terminal
        .sync_now(target, full)
        .await
        .context("Reference sync failed")?;

    if report.empty {
        println!("Server returned no rows; local data left as is.");
        return Ok(());
    }

    println!(
        "Synced {} in {:.2}s ({})",
        report.target,
        report.duration.as_secs_f64(),
        if report.full { "full" } else { "incremental" }
    );
    for (table, rows) in &report.written {
        println!("  {}: {} rows", table, rows);
    }
    for table in &report.skipped {
        println!("  {}: skipped (no rows)", table);
    }

    Ok(())
}

/// Submit pending operations.
async fn cmd_drain(terminal: &Terminal) -> Result<()> {
    if !terminal.probe_connectivity().await {
        anyhow::bail!("Backend unreachable; operations stay queued");
    }

    let report = terminal.drain().await.context("Drain failed")?;

    println!("Synced: {}", report.synced);
    println!("Remaining: {}", report.remaining);
    if let (Some(local_id), Some(error)) = (report.stopped_at, report.error) {
        println!("Stopped at {}: {}", local_id, error);
    }

    Ok(())
}

/// List pending operations.
async fn cmd_pending(terminal: &Terminal) -> Result<()> {
    let pending = terminal
        .pending_operations()
        .await
        .context("Failed to read queue")?;

    if pending.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }

    for op in pending {
        println!(
            "  #{} {} {} created {} attempts {}",
            op.seq,
            op.kind,
            op.local_id,
            format_timestamp(op.created_at),
            op.attempts
        );
        if let Some(error) = op.last_error {
            println!("      last error: {}", error);
        }
    }

    Ok(())
}

async fn cmd_purge(terminal: &Terminal) -> Result<()> {
    let removed = terminal.purge().await.context("Purge failed")?;
    println!("Removed {} synced operations.", removed);
    Ok(())
}

/// Queue an operation and try to submit it.
async fn cmd_enqueue(terminal: &Terminal, kind: &str, payload: &str) -> Result<()> {
    let kind = OperationKind::parse(kind).context("Unknown operation kind")?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    terminal.probe_connectivity().await;
    let status = terminal
        .enqueue_operation(kind, payload)
        .await
        .context("Failed to queue operation")?;

    match status {
        OperationStatus::Synced { server_id } => {
            println!(
                "Synced (server id {})",
                server_id.as_deref().unwrap_or("unknown")
            );
        }
        OperationStatus::QueuedForRetry { local_id } => {
            println!("Queued for retry as {}", local_id);
        }
    }

    Ok(())
}

/// Run background sync until interrupted.
async fn cmd_listen(terminal: &Terminal) -> Result<()> {
    terminal.on_invalidation(Arc::new(|signal: &InvalidationSignal| {
        println!("Invalidation: {} (scope {})", signal.topic, signal.scope);
    }));

    terminal.probe_connectivity().await;
    terminal
        .start_background()
        .await
        .context("Failed to start background sync")?;
    info!(
        "Listening ({}); press Ctrl-C to stop",
        if terminal.network().is_online() { "online" } else { "offline" }
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    terminal.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_timestamp_shows_local_time_and_age() {
        let at = Utc::now() - Duration::minutes(5) - Duration::seconds(10);
        let text = format_timestamp(at);

        let local = at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
        assert!(text.starts_with(&local), "{}", text);
        assert!(text.ends_with("(5m ago)"), "{}", text);
    }

    #[test]
    fn test_format_timestamp_future_clamps_to_zero() {
        let text = format_timestamp(Utc::now() + Duration::seconds(30));
        assert!(text.ends_with("(0s ago)"), "{}", text);
    }
}
