//! nextcloud-backup CLI entry point.
//!
//! Provides `run` (the default), `check`, `prune`, and `list` subcommands
//! for a full backup, a dependency check, a retention pass, or a listing of
//! remote archives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

use nextcloud_backup::config::{self, BackupConfig};
use nextcloud_backup::executor::redactor::Redactor;
use nextcloud_backup::executor::system::SystemRunner;
use nextcloud_backup::pipeline::{self, BackupRun};
use nextcloud_backup::run::RunId;
use nextcloud_backup::{logging, retention};

/// Back up a containerized Nextcloud stack to a remote host.
#[derive(Parser)]
#[command(name = "nextcloud-backup", version, about)]
struct Cli {
    /// Config file (default: $BACKUP_CONFIG or /etc/nextcloud-backup/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment file loaded before configuration.
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Subcommand to execute. Defaults to `run`.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the full backup pipeline.
    Run,
    /// Check configuration, tools, SSH key, and containers, then exit.
    Check,
    /// Delete remote archives past the retention age.
    Prune,
    /// List remote archives with their age.
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let env_loaded = match config::load_env_file(&cli.env_file) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("nextcloud-backup: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let config = match BackupConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nextcloud-backup: failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Commands that touch the stack or the remote archives keep a log file.
    let _logging_guard = match command {
        Command::Run | Command::Prune => match logging::init_with_file(&config.paths.log_file) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("nextcloud-backup: {e:#}");
                return ExitCode::FAILURE;
            }
        },
        Command::Check | Command::List => {
            logging::init_cli();
            None
        }
    };
    if env_loaded {
        debug!(path = %cli.env_file.display(), "environment file loaded");
    }
    match &config.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => debug!("no config file found, using defaults"),
    }

    let result = match command {
        Command::Run => handle_run(&config).await,
        Command::Check => handle_check(&config).await,
        Command::Prune => handle_prune(&config).await,
        Command::List => handle_list(&config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "aborted");
            ExitCode::FAILURE
        }
    }
}

/// Process-backed runner that scrubs the database password from output.
fn system_runner(config: &BackupConfig) -> SystemRunner {
    let secrets = config
        .db_password
        .iter()
        .map(|secret| secret.expose().to_owned())
        .collect();
    SystemRunner::new(Redactor::new(secrets))
}

/// Run the full pipeline.
async fn handle_run(config: &BackupConfig) -> anyhow::Result<ExitCode> {
    config.validate().context("invalid configuration")?;

    let runner = system_runner(config);
    let report = BackupRun::new(config, &runner, RunId::now())
        .execute(shutdown_signal())
        .await;

    for warning in &report.warnings {
        debug!(warning = %warning, "run warning");
    }
    if let Some(retention) = &report.retention {
        debug!(
            deleted = retention.deleted.len(),
            remaining = retention.remaining,
            "retention summary"
        );
    }
    Ok(ExitCode::from(report.exit_code()))
}

/// Preflight and health check only.
async fn handle_check(config: &BackupConfig) -> anyhow::Result<ExitCode> {
    let runner = system_runner(config);
    pipeline::check(&runner, config).await?;
    info!("all checks passed");
    Ok(ExitCode::SUCCESS)
}

/// Retention pass against the remote host.
async fn handle_prune(config: &BackupConfig) -> anyhow::Result<ExitCode> {
    config.validate_remote().context("invalid configuration")?;

    let runner = system_runner(config);
    let report = retention::enforce(&runner, config, None, Utc::now()).await?;
    info!(
        deleted = report.deleted.len(),
        remaining = report.remaining,
        "prune complete"
    );
    Ok(ExitCode::SUCCESS)
}

/// Print remote archives, oldest first.
async fn handle_list(config: &BackupConfig) -> anyhow::Result<ExitCode> {
    config.validate_remote().context("invalid configuration")?;

    let runner = system_runner(config);
    let archives = retention::list_archives(&runner, config).await?;
    let now = Utc::now();
    for archive in &archives {
        println!(
            "{}  {}  {}d",
            archive.name,
            archive.modified.format("%Y-%m-%d %H:%M:%S UTC"),
            archive.age_days(now)
        );
    }
    info!(
        count = archives.len(),
        retention_days = config.remote.retention_days,
        "remote archives listed"
    );
    Ok(ExitCode::SUCCESS)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    () = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }

    info!("received shutdown signal");
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
