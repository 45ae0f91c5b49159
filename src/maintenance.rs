//! Application maintenance mode toggling via `occ`.
//!
//! Restoring normal mode is owed exactly once after enabling has been
//! attempted, whether or not the enable itself succeeded.

use anyhow::Context;
use tracing::{info, warn};

use crate::config::StackConfig;
use crate::executor::{CommandRunner, Invocation};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaintenanceState {
    /// Enable has not been attempted; nothing to restore.
    Untouched,
    /// Enable was attempted; restore is owed.
    Requested,
    /// Restore has been attempted.
    Restored,
}

/// Result of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Nothing to do: enable was never attempted or restore already ran.
    NotNeeded,
    /// Normal mode restored.
    Restored,
    /// The restore command failed; carries the reason.
    Failed(String),
}

/// Controls maintenance mode for the application container.
#[derive(Debug, Clone)]
pub struct MaintenanceMode {
    container: String,
    web_user: String,
    state: MaintenanceState,
}

impl MaintenanceMode {
    /// Controller for the stack's application container.
    pub fn new(stack: &StackConfig) -> Self {
        Self {
            container: stack.app_container.clone(),
            web_user: stack.web_user.clone(),
            state: MaintenanceState::Untouched,
        }
    }

    fn occ(&self, flag: &str) -> Invocation {
        Invocation::new("docker").args([
            "exec",
            "-u",
            self.web_user.as_str(),
            self.container.as_str(),
            "php",
            "occ",
            "maintenance:mode",
            flag,
        ])
    }

    /// Put the application into maintenance mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the `occ` command fails. Restore is still owed.
    pub async fn enable(&mut self, runner: &dyn CommandRunner) -> anyhow::Result<()> {
        self.state = MaintenanceState::Requested;
        runner
            .run_checked(&self.occ("--on"))
            .await
            .context("failed to enable maintenance mode")?;
        info!(container = %self.container, "maintenance mode enabled");
        Ok(())
    }

    /// Restore normal mode if it is owed. Never runs the command twice.
    pub async fn restore(&mut self, runner: &dyn CommandRunner) -> RestoreOutcome {
        if self.state != MaintenanceState::Requested {
            return RestoreOutcome::NotNeeded;
        }
        self.state = MaintenanceState::Restored;

        match runner.run_checked(&self.occ("--off")).await {
            Ok(_) => {
                info!(container = %self.container, "maintenance mode disabled");
                RestoreOutcome::Restored
            }
            Err(e) => {
                warn!(container = %self.container, error = %e, "failed to disable maintenance mode");
                RestoreOutcome::Failed(e.to_string())
            }
        }
    }
}
