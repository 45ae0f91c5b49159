//! Run orchestrator: an explicit state machine over the backup steps.
//!
//! ```text
//! Start → Preflight → HealthCheck → Stage → MaintenanceOn → CaptureDb →
//! CaptureData → CaptureVolume → Manifest → MaintenanceOff → Transport →
//! Retention → Cleanup → Done
//! ```
//!
//! A fatal error in any state ends the run in [`RunState::Failed`].
//! `MaintenanceOff` and `Retention` errors are recorded as warnings and the
//! run continues. Compensation (maintenance restore, staging removal) runs
//! after every run, and both actions are idempotent.

use std::fmt;
use std::future::Future;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::capture;
use crate::config::BackupConfig;
use crate::credentials::KeyPermissions;
use crate::executor::CommandRunner;
use crate::maintenance::{MaintenanceMode, RestoreOutcome};
use crate::manifest::Manifest;
use crate::preflight::{self, REQUIRED_TOOLS};
use crate::retention::{self, RetentionReport};
use crate::run::{ArchiveName, RunId};
use crate::staging::StagingDir;
use crate::transport::{self, UploadReport};

/// Position of a run in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Nothing has happened yet.
    Start,
    /// Configuration, tools and SSH key checks.
    Preflight,
    /// Application and database containers are running.
    HealthCheck,
    /// Staging directory creation.
    Stage,
    /// Application put into maintenance mode.
    MaintenanceOn,
    /// Database dump.
    CaptureDb,
    /// Host data directory archive.
    CaptureData,
    /// Application volume archive.
    CaptureVolume,
    /// Manifest written.
    Manifest,
    /// Application returned to normal mode.
    MaintenanceOff,
    /// Archive packaged and uploaded.
    Transport,
    /// Expired remote archives pruned.
    Retention,
    /// Staging directory removed.
    Cleanup,
    /// Finished successfully.
    Done,
    /// Aborted by a fatal error or an interrupt.
    Failed,
}

impl RunState {
    /// Successor on the success path; `None` for terminal states.
    pub fn next(self) -> Option<Self> {
        let next = match self {
            Self::Start => Self::Preflight,
            Self::Preflight => Self::HealthCheck,
            Self::HealthCheck => Self::Stage,
            Self::Stage => Self::MaintenanceOn,
            Self::MaintenanceOn => Self::CaptureDb,
            Self::CaptureDb => Self::CaptureData,
            Self::CaptureData => Self::CaptureVolume,
            Self::CaptureVolume => Self::Manifest,
            Self::Manifest => Self::MaintenanceOff,
            Self::MaintenanceOff => Self::Transport,
            Self::Transport => Self::Retention,
            Self::Retention => Self::Cleanup,
            Self::Cleanup => Self::Done,
            Self::Done | Self::Failed => return None,
        };
        Some(next)
    }

    /// Whether an error in this state aborts the run.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::MaintenanceOff | Self::Retention)
    }

    /// Whether the run has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Stable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Preflight => "preflight",
            Self::HealthCheck => "health_check",
            Self::Stage => "stage",
            Self::MaintenanceOn => "maintenance_on",
            Self::CaptureDb => "capture_db",
            Self::CaptureData => "capture_data",
            Self::CaptureVolume => "capture_volume",
            Self::Manifest => "manifest",
            Self::MaintenanceOff => "maintenance_off",
            Self::Transport => "transport",
            Self::Retention => "retention",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal error, tagged with the state it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{state} failed: {cause:#}")]
pub struct RunError {
    /// State that failed.
    pub state: RunState,
    /// What went wrong.
    pub cause: anyhow::Error,
}

/// Outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Run identity.
    pub run_id: RunId,
    /// Archive name this run uploads to.
    pub archive: ArchiveName,
    /// `Done` or `Failed`.
    pub final_state: RunState,
    /// Fatal error, when the run failed.
    pub error: Option<RunError>,
    /// Non-fatal problems, in order of occurrence.
    pub warnings: Vec<String>,
    /// Upload details, when transport succeeded.
    pub upload: Option<UploadReport>,
    /// Retention statistics, when pruning succeeded.
    pub retention: Option<RetentionReport>,
}

impl RunReport {
    /// Whether the run reached `Done`.
    pub fn succeeded(&self) -> bool {
        self.final_state == RunState::Done
    }

    /// Process exit code: 0 on success (warnings allowed), 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.succeeded())
    }
}

/// One backup run.
pub struct BackupRun<'a> {
    config: &'a BackupConfig,
    runner: &'a dyn CommandRunner,
    run_id: RunId,
    state: RunState,
    staging: Option<StagingDir>,
    maintenance: MaintenanceMode,
    warnings: Vec<String>,
    upload: Option<UploadReport>,
    retention: Option<RetentionReport>,
}

impl<'a> BackupRun<'a> {
    /// Prepare a run; nothing is touched until [`BackupRun::execute`].
    pub fn new(config: &'a BackupConfig, runner: &'a dyn CommandRunner, run_id: RunId) -> Self {
        Self {
            config,
            runner,
            run_id,
            state: RunState::Start,
            staging: None,
            maintenance: MaintenanceMode::new(&config.stack),
            warnings: Vec::new(),
            upload: None,
            retention: None,
        }
    }

    /// Drive the run to a terminal state.
    ///
    /// When `interrupt` resolves first, the in-flight step is dropped (its
    /// child process is killed) and the run fails in the state it was in.
    /// Compensation runs on every path.
    pub async fn execute<F>(mut self, interrupt: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        info!(run_id = %self.run_id, "backup run starting");

        let outcome = tokio::select! {
            result = self.advance() => Some(result),
            () = interrupt => None,
        };
        let outcome = outcome.unwrap_or_else(|| {
            warn!(state = %self.state, "interrupted, aborting run");
            Err(RunError {
                state: self.state,
                cause: anyhow::anyhow!("interrupted by signal"),
            })
        });

        if let Err(e) = &outcome {
            error!(state = %e.state, error = %format!("{:#}", e.cause), "backup failed");
        }
        self.compensate().await;

        let error = outcome.err();
        let final_state = if error.is_some() {
            RunState::Failed
        } else {
            RunState::Done
        };
        self.state = final_state;

        let report = RunReport {
            run_id: self.run_id,
            archive: self.run_id.archive_name(),
            final_state,
            error,
            warnings: std::mem::take(&mut self.warnings),
            upload: self.upload.take(),
            retention: self.retention.take(),
        };
        if report.succeeded() {
            info!(
                archive = %report.archive,
                warnings = report.warnings.len(),
                "backup completed"
            );
        } else {
            error!(run_id = %self.run_id, "backup run failed");
        }
        report
    }

    async fn advance(&mut self) -> Result<(), RunError> {
        while let Some(next) = self.state.next() {
            self.state = next;
            if next.is_terminal() {
                break;
            }
            info!(state = %next, "entering state");
            match self.step(next).await {
                Ok(()) => {}
                Err(cause) if next.is_fatal() => {
                    return Err(RunError {
                        state: next,
                        cause,
                    });
                }
                Err(cause) => {
                    warn!(state = %next, error = %format!("{cause:#}"), "step failed, continuing");
                    self.warnings.push(format!("{next}: {cause:#}"));
                }
            }
        }
        Ok(())
    }

    async fn step(&mut self, state: RunState) -> anyhow::Result<()> {
        let config = self.config;
        let runner = self.runner;
        match state {
            RunState::Preflight => {
                config.validate().context("invalid configuration")?;
                let permissions =
                    preflight::validate(runner, REQUIRED_TOOLS, &config.remote.identity_file)?;
                if let KeyPermissions::Corrected { previous_mode } = permissions {
                    let note = format!(
                        "ssh key {} had mode {previous_mode:o}, corrected to 600",
                        config.remote.identity_file.display()
                    );
                    warn!(key = %config.remote.identity_file.display(), previous_mode = %format!("{previous_mode:o}"), "ssh key permissions corrected");
                    self.warnings.push(note);
                }
            }
            RunState::HealthCheck => {
                preflight::check_containers(
                    runner,
                    &[
                        config.stack.app_container.as_str(),
                        config.stack.db_container.as_str(),
                    ],
                )
                .await?;
            }
            RunState::Stage => {
                self.staging = Some(StagingDir::create(&config.paths.staging_root, &self.run_id)?);
            }
            RunState::MaintenanceOn => {
                self.maintenance.enable(runner).await?;
            }
            RunState::CaptureDb => {
                let password = config
                    .db_password
                    .as_ref()
                    .context("database password is not set")?;
                capture::capture_database(runner, &config.stack, password, self.staging()?).await?;
            }
            RunState::CaptureData => {
                capture::capture_data(runner, &config.stack, self.staging()?).await?;
            }
            RunState::CaptureVolume => {
                capture::capture_volume(
                    runner,
                    &config.stack,
                    self.staging()?,
                    &config.paths.staging_root,
                )
                .await?;
            }
            RunState::Manifest => {
                let manifest = Manifest::collect(runner, config, self.run_id).await;
                manifest.write_to(self.staging()?.path())?;
            }
            RunState::MaintenanceOff => {
                if let RestoreOutcome::Failed(reason) = self.maintenance.restore(runner).await {
                    anyhow::bail!("failed to disable maintenance mode: {reason}");
                }
            }
            RunState::Transport => {
                let archive = self.run_id.archive_name();
                let upload = transport::send(runner, config, self.staging()?, archive).await?;
                self.upload = Some(upload);
            }
            RunState::Retention => {
                let keep = self.run_id.archive_name();
                let report = retention::enforce(runner, config, Some(&keep), Utc::now()).await?;
                self.retention = Some(report);
            }
            RunState::Cleanup => {
                if let Some(staging) = self.staging.as_mut() {
                    staging.cleanup()?;
                }
                self.staging = None;
            }
            RunState::Start | RunState::Done | RunState::Failed => {}
        }
        Ok(())
    }

    fn staging(&self) -> anyhow::Result<&StagingDir> {
        self.staging
            .as_ref()
            .context("staging directory has not been created")
    }

    /// Restore maintenance mode and remove staging. Each runs at most once
    /// per run, so calling this after a successful run does nothing.
    async fn compensate(&mut self) {
        match self.maintenance.restore(self.runner).await {
            RestoreOutcome::NotNeeded | RestoreOutcome::Restored => {}
            RestoreOutcome::Failed(reason) => {
                self.warnings
                    .push(format!("maintenance_off: failed to disable maintenance mode: {reason}"));
            }
        }
        if let Some(mut staging) = self.staging.take() {
            if let Err(e) = staging.cleanup() {
                error!(error = %format!("{e:#}"), "staging cleanup failed");
                self.warnings.push(format!("cleanup: {e:#}"));
            }
        }
    }
}

/// Preflight and health check only, for `check`.
///
/// # Errors
///
/// Returns the first failing check.
pub async fn check(runner: &dyn CommandRunner, config: &BackupConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    let permissions = preflight::validate(runner, REQUIRED_TOOLS, &config.remote.identity_file)?;
    if let KeyPermissions::Corrected { previous_mode } = permissions {
        warn!(previous_mode = %format!("{previous_mode:o}"), "ssh key permissions corrected");
    }
    preflight::check_containers(
        runner,
        &[
            config.stack.app_container.as_str(),
            config.stack.db_container.as_str(),
        ],
    )
    .await
}
