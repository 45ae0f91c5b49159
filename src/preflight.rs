//! Preflight validation and dependency health checks.

use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::credentials::{self, KeyPermissions};
use crate::executor::{CommandRunner, Invocation};

/// External programs the pipeline shells out to.
pub const REQUIRED_TOOLS: &[&str] = &["docker", "tar", "gzip", "ssh", "rsync", "hostname"];

/// Verify every tool resolves on `PATH` and the SSH key is private.
///
/// Missing tools are reported together. The key's mode is corrected to
/// `0600` when it differs.
///
/// # Errors
///
/// Returns an error naming the missing tools, or if the key is absent or
/// its permissions cannot be corrected.
pub fn validate(
    runner: &dyn CommandRunner,
    tools: &[&str],
    identity_file: &Path,
) -> anyhow::Result<KeyPermissions> {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| match runner.locate(tool) {
            Some(path) => {
                debug!(tool, path = %path.display(), "found required tool");
                false
            }
            None => true,
        })
        .collect();
    anyhow::ensure!(
        missing.is_empty(),
        "required tools not found on PATH: {}",
        missing.join(", ")
    );

    let permissions = credentials::ensure_private_key(identity_file)?;
    info!(tools = tools.len(), "preflight passed");
    Ok(permissions)
}

/// Confirm the given containers are running.
///
/// # Errors
///
/// Returns an error naming each container that is not running, or if the
/// container runtime cannot be queried.
pub async fn check_containers(
    runner: &dyn CommandRunner,
    containers: &[&str],
) -> anyhow::Result<()> {
    let invocation = Invocation::new("docker").args(["ps", "--format", "{{.Names}}"]);
    let result = runner
        .run_checked(&invocation)
        .await
        .context("failed to list running containers")?;

    let running: Vec<&str> = result.stdout.lines().map(str::trim).collect();
    let down: Vec<&str> = containers
        .iter()
        .copied()
        .filter(|name| !running.contains(name))
        .collect();
    anyhow::ensure!(
        down.is_empty(),
        "required containers are not running: {}",
        down.join(", ")
    );

    info!(containers = %containers.join(", "), "dependencies are up");
    Ok(())
}
