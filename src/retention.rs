//! Remote retention: list archives, prune the ones past the age threshold.
//!
//! Selection happens locally on a parsed listing so only names this tool
//! produces are ever passed to `rm`.

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use crate::config::BackupConfig;
use crate::executor::CommandRunner;
use crate::run::{ArchiveName, ARCHIVE_GLOB};
use crate::transport::RemoteShell;

/// One archive on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArchive {
    /// File name.
    pub name: ArchiveName,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

impl RemoteArchive {
    /// Whole days since the last modification, never negative.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.modified).num_days().max(0)
    }
}

/// Maximum archive age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_age_days: u32,
}

impl RetentionPolicy {
    /// Keep archives for `max_age_days` days.
    pub fn new(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    /// Configured threshold in days.
    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }

    /// Archives modified before this instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(TimeDelta::days(i64::from(self.max_age_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Archives strictly older than the threshold, excluding `keep`.
    pub fn expired(
        &self,
        archives: &[RemoteArchive],
        now: DateTime<Utc>,
        keep: Option<&ArchiveName>,
    ) -> Vec<RemoteArchive> {
        let cutoff = self.cutoff(now);
        archives
            .iter()
            .filter(|archive| archive.modified < cutoff)
            .filter(|archive| keep != Some(&archive.name))
            .cloned()
            .collect()
    }
}

/// Result of a prune pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    /// Archives that were deleted.
    pub deleted: Vec<ArchiveName>,
    /// Archives left on the remote host afterwards.
    pub remaining: usize,
}

/// Parse `find -printf '%T@ %f\n'` output.
///
/// Lines whose name is not an archive produced by this tool are skipped.
pub fn parse_listing(output: &str) -> Vec<RemoteArchive> {
    let mut archives: Vec<RemoteArchive> = output
        .lines()
        .filter_map(|line| {
            let (stamp, name) = line.trim().split_once(' ')?;
            let Some(name) = ArchiveName::parse(name.trim()) else {
                debug!(line, "skipping unrecognised remote file");
                return None;
            };
            let seconds = stamp.split('.').next()?.parse::<i64>().ok()?;
            let modified = DateTime::from_timestamp(seconds, 0)?;
            Some(RemoteArchive { name, modified })
        })
        .collect();
    archives.sort_by(|a, b| a.name.cmp(&b.name));
    archives
}

/// List archives in the remote directory, oldest run first.
///
/// # Errors
///
/// Returns an error if the remote listing command fails.
pub async fn list_archives(
    runner: &dyn CommandRunner,
    config: &BackupConfig,
) -> anyhow::Result<Vec<RemoteArchive>> {
    let shell = RemoteShell::from_config(&config.remote);
    let remote_dir = config.remote_directory();
    let result = shell
        .run(
            runner,
            [
                "find",
                remote_dir,
                "-maxdepth",
                "1",
                "-type",
                "f",
                "-name",
                ARCHIVE_GLOB,
                "-printf",
                "%T@ %f\\n",
            ],
        )
        .await
        .with_context(|| format!("failed to list archives in {remote_dir}"))?;
    Ok(parse_listing(&result.stdout))
}

/// Delete expired archives and count what is left.
///
/// `keep` names the archive uploaded by the current run, which is never
/// deleted regardless of its timestamp.
///
/// # Errors
///
/// Returns an error if listing or deletion fails. Callers treat this as a
/// warning.
pub async fn enforce(
    runner: &dyn CommandRunner,
    config: &BackupConfig,
    keep: Option<&ArchiveName>,
    now: DateTime<Utc>,
) -> anyhow::Result<RetentionReport> {
    let policy = RetentionPolicy::new(config.remote.retention_days);
    let archives = list_archives(runner, config).await?;
    let expired = policy.expired(&archives, now, keep);

    if expired.is_empty() {
        debug!(
            days = policy.max_age_days(),
            found = archives.len(),
            "no archives past retention"
        );
    } else {
        let remote_dir = config.remote_directory();
        let paths: Vec<String> = expired
            .iter()
            .map(|archive| format!("{remote_dir}/{}", archive.name))
            .collect();
        let shell = RemoteShell::from_config(&config.remote);
        shell
            .run(
                runner,
                ["rm", "-f", "--"]
                    .into_iter()
                    .map(str::to_owned)
                    .chain(paths),
            )
            .await
            .context("failed to delete expired archives")?;
        for archive in &expired {
            info!(archive = %archive.name, age_days = archive.age_days(now), "expired archive deleted");
        }
    }

    let remaining = list_archives(runner, config).await?.len();
    info!(
        deleted = expired.len(),
        remaining,
        days = policy.max_age_days(),
        "retention applied"
    );
    Ok(RetentionReport {
        deleted: expired.into_iter().map(|archive| archive.name).collect(),
        remaining,
    })
}
