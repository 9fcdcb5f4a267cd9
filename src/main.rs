//! snapvault - Main entry point
//!
//! Content-addressed directory snapshots with lifecycle actions and
//! bucket-based retention.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use snapvault::actions::{self, ActionCommand, ActionEvent, ActionMode};
use snapvault::clock::{Clock, SystemClock};
use snapvault::repo::Repository;
use snapvault::snapshot::driver::SnapshotDriver;
use snapvault::utils;
use snapvault::VaultError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository directory
    #[arg(long, value_name = "DIR", global = true)]
    repo: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repository management
    #[command(subcommand)]
    Repo(RepoCommand),

    /// Policy management
    #[command(subcommand)]
    Policy(PolicyCommand),

    /// Snapshot operations
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand, Debug)]
enum RepoCommand {
    /// Create a repository
    Create {
        /// Run snapshot actions by default
        #[arg(long, conflicts_with = "no_enable_actions")]
        enable_actions: bool,

        /// Never run snapshot actions by default
        #[arg(long)]
        no_enable_actions: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Set policy fields for a path
    Set(PolicySetArgs),

    /// Show the effective policy for a path
    Show {
        target: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PolicySetArgs {
    target: PathBuf,

    /// Command to run before snapshotting the root
    #[arg(long, value_name = "CMD")]
    before_snapshot_root_action: Option<String>,

    /// Command to run after snapshotting the root
    #[arg(long, value_name = "CMD")]
    after_snapshot_root_action: Option<String>,

    /// Command to run before capturing this directory
    #[arg(long, value_name = "CMD")]
    before_folder_action: Option<String>,

    /// Command to run after capturing this directory
    #[arg(long, value_name = "CMD")]
    after_folder_action: Option<String>,

    /// Action mode: essential, optional or async
    #[arg(long, default_value = "essential", value_name = "MODE")]
    action_command_mode: String,

    /// Action timeout, e.g. 3s or 15m
    #[arg(long, value_name = "DURATION")]
    action_command_timeout: Option<String>,

    /// Embed the referenced script file's contents into the policy
    #[arg(long)]
    persist_action_script: bool,

    /// Number of most recent snapshots to keep
    #[arg(long, value_name = "N")]
    keep_latest: Option<i32>,

    /// Number of hourly snapshots to keep
    #[arg(long, value_name = "N")]
    keep_hourly: Option<i32>,

    /// Number of daily snapshots to keep
    #[arg(long, value_name = "N")]
    keep_daily: Option<i32>,

    /// Number of weekly snapshots to keep
    #[arg(long, value_name = "N")]
    keep_weekly: Option<i32>,

    /// Number of monthly snapshots to keep
    #[arg(long, value_name = "N")]
    keep_monthly: Option<i32>,

    /// Number of annual snapshots to keep
    #[arg(long, value_name = "N")]
    keep_annual: Option<i32>,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Create a snapshot of a directory
    Create {
        source: PathBuf,

        /// Run actions for this invocation regardless of the repository
        /// default
        #[arg(long, conflicts_with = "force_disable_actions")]
        force_enable_actions: bool,

        /// Skip actions for this invocation regardless of the repository
        /// default
        #[arg(long)]
        force_disable_actions: bool,
    },

    /// List snapshots of a source, newest first
    List {
        source: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::logger::init(&cli.log_level)?;

    let repo_dir = cli.repo.unwrap_or_else(|| PathBuf::from(".snapvault"));

    match cli.command {
        Command::Repo(RepoCommand::Create {
            enable_actions,
            no_enable_actions,
        }) => {
            let enabled = enable_actions && !no_enable_actions;
            let repo = Repository::create(&repo_dir, enabled)?;
            repo.save()?;
            println!(
                "created repository at {} (actions {})",
                repo_dir.display(),
                if enabled { "enabled" } else { "disabled" }
            );
        }

        Command::Policy(PolicyCommand::Set(args)) => policy_set(&repo_dir, args)?,

        Command::Policy(PolicyCommand::Show { target }) => {
            let repo = Repository::open(&repo_dir)?;
            let target = absolute(&target)?;
            let effective = repo.policies.effective(&target);
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }

        Command::Snapshot(SnapshotCommand::Create {
            source,
            force_enable_actions,
            force_disable_actions,
        }) => {
            let invocation_override = if force_enable_actions {
                Some(true)
            } else if force_disable_actions {
                Some(false)
            } else {
                None
            };
            snapshot_create(&repo_dir, &source, invocation_override).await?;
        }

        Command::Snapshot(SnapshotCommand::List { source }) => {
            let repo = Repository::open(&repo_dir)?;
            let source = absolute(&source)?;
            for manifest in repo.snapshots_for(&source) {
                println!(
                    "{}  {}  {}  {}{}",
                    manifest.start_time.format("%Y-%m-%d %H:%M:%S"),
                    manifest.id,
                    manifest.root_object,
                    manifest.retention_reasons.join(","),
                    match &manifest.incomplete_reason {
                        Some(reason) => format!("  (incomplete: {reason})"),
                        None => String::new(),
                    }
                );
            }
        }
    }

    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("cannot resolve path {}", path.display()))
}

fn policy_set(repo_dir: &Path, args: PolicySetArgs) -> Result<()> {
    let mut repo = Repository::open(repo_dir)?;
    let target = absolute(&args.target)?;

    let mode: ActionMode = args
        .action_command_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let timeout_secs = match &args.action_command_timeout {
        Some(text) => Some(
            humantime::parse_duration(text)
                .with_context(|| format!("invalid duration '{text}'"))?
                .as_secs(),
        ),
        None => None,
    };

    let mut policy = repo.policies.defined(&target).cloned().unwrap_or_default();

    for (event, flag) in [
        (ActionEvent::BeforeSnapshotRoot, &args.before_snapshot_root_action),
        (ActionEvent::AfterSnapshotRoot, &args.after_snapshot_root_action),
        (ActionEvent::BeforeFolder, &args.before_folder_action),
        (ActionEvent::AfterFolder, &args.after_folder_action),
    ] {
        if let Some(command) = flag {
            let binding = build_binding(command, mode, timeout_secs, args.persist_action_script)?;
            policy.actions.set(event, binding);
        }
    }

    if let Some(n) = args.keep_latest {
        policy.retention.keep_latest = Some(n);
    }
    if let Some(n) = args.keep_hourly {
        policy.retention.keep_hourly = Some(n);
    }
    if let Some(n) = args.keep_daily {
        policy.retention.keep_daily = Some(n);
    }
    if let Some(n) = args.keep_weekly {
        policy.retention.keep_weekly = Some(n);
    }
    if let Some(n) = args.keep_monthly {
        policy.retention.keep_monthly = Some(n);
    }
    if let Some(n) = args.keep_annual {
        policy.retention.keep_annual = Some(n);
    }

    repo.policies.set(&target, policy)?;
    repo.save()?;
    println!("policy updated for {}", target.display());
    Ok(())
}

fn build_binding(
    command: &str,
    mode: ActionMode,
    timeout_secs: Option<u64>,
    persist: bool,
) -> Result<ActionCommand> {
    let mut binding = if persist {
        let body = std::fs::read_to_string(command)
            .map_err(|e| VaultError::ScriptPersistence(format!("{command}: {e}")))?;
        ActionCommand::persisted_script(body)
    } else {
        ActionCommand::external(command)
    };
    binding.mode = mode;
    binding.timeout_secs = timeout_secs;
    Ok(binding)
}

/// Cancel the attempt on SIGINT/SIGTERM so in-flight action children are
/// killed and a partial manifest is recorded.
fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, cancelling snapshot"),
            _ = terminate => tracing::info!("received SIGTERM, cancelling snapshot"),
        }

        cancel.cancel();
    });
}

async fn snapshot_create(
    repo_dir: &Path,
    source: &Path,
    invocation_override: Option<bool>,
) -> Result<()> {
    let mut repo = Repository::open(repo_dir)?;
    let source = absolute(source)?;

    let enabled = actions::actions_enabled(repo.config.enable_actions, invocation_override);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let manifest = {
        let driver = SnapshotDriver::with_cancel(
            &repo.policies,
            &repo.config,
            clock.clone(),
            enabled,
            cancel,
        )?;
        driver.snapshot(&source).await?
    };

    println!(
        "created snapshot {} of {} ({} files, {} bytes)",
        manifest.id,
        source.display(),
        manifest.total_files,
        manifest.total_bytes
    );

    repo.add_manifest(manifest);
    repo.apply_retention(&source, clock.as_ref());
    repo.save()?;

    Ok(())
}
