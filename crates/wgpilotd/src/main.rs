//! wgpilotd: the control-core daemon.
//!
//! Opens the Store, constructs the WireGuard and Firewall drivers, runs
//! the startup Reconciler once, then drives the Monitor's poll and
//! compaction loops until shutdown (spec.md §4.5, §4.7). This binary
//! deliberately binds no HTTP listener — the authenticated, setup-gated
//! request surface described in spec.md §6 is an external collaborator
//! (see SPEC_FULL.md §0.1) that embeds `wgpilot-core` as a library and
//! calls its `Orchestrator`/`SetupMachine`/`Monitor` directly.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::DaemonConfig;
use wgpilot_core::monitor::MonitorConfig;
use wgpilot_core::{Monitor, Reconciler};
use wgpilot_store::Store;

#[cfg(feature = "linux")]
use wgpilot_firewall::NftablesApplier;
#[cfg(not(feature = "linux"))]
use wgpilot_firewall::FakeApplier;
#[cfg(feature = "linux")]
use wgpilot_wireguard::LinuxWireGuardDriver;
#[cfg(not(feature = "linux"))]
use wgpilot_wireguard::FakeWireGuardDriver;

use wgpilot_firewall::FirewallDriver;

/// wgpilot control-core daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "wgpilotd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file layered under defaults and above by
    /// CLI flags and `WGPILOTD_*` environment variables.
    #[arg(short, long, env = "WGPILOTD_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[arg(long, env = "WGPILOTD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Base64 32-byte key for AEAD-encrypting private keys at rest.
    #[arg(long, env = "WGPILOTD_ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    /// Enable debug-level logging.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Command {
    /// Run the Reconciler once and exit, without starting the Monitor
    /// loops. Useful for a one-shot drift check (spec.md §4.5).
    Reconcile,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("wgpilotd=debug,wgpilot_core=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wgpilotd=info,wgpilot_core=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

fn build_config(cli: &Cli) -> Result<DaemonConfig, Box<dyn std::error::Error>> {
    let mut cfg = DaemonConfig::load(cli.config.as_ref())?;
    if let Some(db_path) = &cli.db_path {
        cfg.db_path.clone_from(db_path);
    }
    if let Some(key) = &cli.encryption_key {
        cfg.encryption_key = Some(key.clone());
    }
    cfg.verbose = cfg.verbose || cli.verbose;
    Ok(cfg)
}

#[cfg(feature = "linux")]
fn build_wireguard_driver() -> LinuxWireGuardDriver {
    LinuxWireGuardDriver::new()
}

#[cfg(not(feature = "linux"))]
fn build_wireguard_driver() -> FakeWireGuardDriver {
    warn!("built without the `linux` feature; running against the in-memory fake WireGuard driver");
    FakeWireGuardDriver::new()
}

#[cfg(feature = "linux")]
fn build_applier() -> NftablesApplier {
    NftablesApplier::new()
}

#[cfg(not(feature = "linux"))]
fn build_applier() -> FakeApplier {
    warn!("built without the `linux` feature; running against the in-memory fake firewall applier");
    FakeApplier::new()
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(cli.verbose);
    info!("wgpilotd starting");

    let cfg = build_config(&cli)?;
    let encryption_key = cfg.decode_encryption_key()?;
    if encryption_key.is_none() {
        warn!("no encryption_key configured; private keys will be stored as plain base64 (spec.md §4.1)");
    }

    let store = Store::open(&cfg.db_path, encryption_key).await?;
    info!(db_path = %cfg.db_path.display(), "store opened and migrated");

    let wg = Arc::new(build_wireguard_driver());
    let firewall = Arc::new(FirewallDriver::new(build_applier()));

    let reconciler = Reconciler::new(store.clone(), Arc::clone(&wg), Arc::clone(&firewall));
    let report = reconciler.reconcile("startup").await;
    if report.is_clean() {
        info!("reconciliation found no drift");
    } else {
        info!(
            created = ?report.interfaces_created,
            removed = ?report.interfaces_removed,
            reapplied = ?report.peer_sets_reapplied,
            failures = ?report.failures,
            "reconciliation applied drift corrections"
        );
    }

    if matches!(cli.command, Some(Command::Reconcile)) {
        info!("reconcile-only run complete, exiting");
        return Ok(());
    }

    let monitor_config = MonitorConfig {
        poll_interval: cfg.poll_interval(),
        compaction_interval: cfg.compaction_interval(),
        retention: cfg.retention(),
    };
    let monitor = Arc::new(Monitor::new(store, wg, monitor_config));

    let cancel = CancellationToken::new();
    let poll_cancel = cancel.clone();
    let poll_monitor = Arc::clone(&monitor);
    let poll_task = tokio::spawn(async move {
        poll_monitor.run_poll_loop("monitor-poll", poll_cancel).await;
    });

    let compaction_cancel = cancel.clone();
    let compaction_monitor = Arc::clone(&monitor);
    let compaction_task = tokio::spawn(async move {
        compaction_monitor.run_compaction_loop("monitor-compaction", compaction_cancel).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install SIGINT handler");
    }
    info!("shutdown signal received");
    cancel.cancel();
    let _ = tokio::join!(poll_task, compaction_task);
    info!("wgpilotd stopped");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("wgpilotd: failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wgpilotd error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse_args(args: &[&str]) -> Cli {
        Cli::parse_from(args)
    }

    #[test]
    fn parses_with_no_flags() {
        let cli = parse_args(&["wgpilotd"]);
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_reconcile_subcommand() {
        let cli = parse_args(&["wgpilotd", "reconcile"]);
        assert!(matches!(cli.command, Some(Command::Reconcile)));
    }

    #[test]
    fn db_path_flag_overrides_default() {
        let cli = parse_args(&["wgpilotd", "--db-path", "/tmp/custom.db"]);
        let cfg = build_config(&cli).expect("config builds from flags alone");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn verbose_flag_is_ored_into_config() {
        let cli = parse_args(&["wgpilotd", "--verbose"]);
        let cfg = build_config(&cli).expect("config builds");
        assert!(cfg.verbose);
    }
}
