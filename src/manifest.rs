//! `backup_info.txt`: what a run captured and how to restore it.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use crate::capture::{APP_ARCHIVE, ARTIFACTS, DATABASE_DUMP, DATA_ARCHIVE};
use crate::config::BackupConfig;
use crate::executor::{CommandRunner, Invocation};
use crate::run::RunId;

/// Manifest file name inside the staging directory.
pub const MANIFEST_FILE: &str = "backup_info.txt";

/// Placeholder for values that could not be retrieved.
pub const UNKNOWN: &str = "unknown";

/// Run metadata bundled with every archive. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Run identity.
    pub run_id: RunId,
    /// Host that produced the backup.
    pub host: String,
    /// Application version reported by `occ status`.
    pub app_version: String,
    /// Database server version reported by `mysqldump --version`.
    pub db_version: String,
    /// Application container name.
    pub app_container: String,
    /// Database container name.
    pub db_container: String,
    /// Database schema name.
    pub db_name: String,
    /// Host data directory that was archived.
    pub data_dir: PathBuf,
    /// Volume that was archived.
    pub app_volume: String,
    /// Remote archive name.
    pub archive: String,
    /// Remote `user@host:dir` the archive is sent to.
    pub destination: String,
}

/// Subset of `occ status --output=json`.
#[derive(Debug, Deserialize)]
struct OccStatus {
    versionstring: Option<String>,
    version: Option<String>,
}

impl Manifest {
    /// Query host name and component versions, degrading to [`UNKNOWN`].
    pub async fn collect(runner: &dyn CommandRunner, config: &BackupConfig, run_id: RunId) -> Self {
        let stack = &config.stack;
        let host = query(runner, &Invocation::new("hostname"))
            .await
            .map(|out| out.trim().to_owned())
            .filter(|out| !out.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_owned());

        let occ_status = Invocation::new("docker").args([
            "exec",
            "-u",
            stack.web_user.as_str(),
            stack.app_container.as_str(),
            "php",
            "occ",
            "status",
            "--output=json",
        ]);
        let app_version = query(runner, &occ_status)
            .await
            .map(|out| parse_app_version(&out))
            .unwrap_or_else(|| UNKNOWN.to_owned());

        let dump_version = Invocation::new("docker").args([
            "exec",
            stack.db_container.as_str(),
            "mysqldump",
            "--version",
        ]);
        let db_version = query(runner, &dump_version)
            .await
            .map(|out| out.trim().to_owned())
            .filter(|out| !out.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_owned());

        Self {
            run_id,
            host,
            app_version,
            db_version,
            app_container: stack.app_container.clone(),
            db_container: stack.db_container.clone(),
            db_name: stack.db_name.clone(),
            data_dir: stack.data_dir.clone(),
            app_volume: stack.app_volume.clone(),
            archive: run_id.archive_name().to_string(),
            destination: format!(
                "{}@{}:{}",
                config.remote.user,
                config.remote.host,
                config.remote_directory()
            ),
        }
    }

    /// Render the manifest text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let started = self.run_id.started_at().format("%Y-%m-%d %H:%M:%S");
        let data_name = self
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data_parent = self
            .data_dir
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        // Writing into a String cannot fail.
        let _ = writeln!(out, "Nextcloud backup {}", self.run_id);
        let _ = writeln!(out, "==========================================");
        let _ = writeln!(out, "Created:          {started}");
        let _ = writeln!(out, "Host:             {}", self.host);
        let _ = writeln!(out, "Nextcloud:        {}", self.app_version);
        let _ = writeln!(out, "Database server:  {}", self.db_version);
        let _ = writeln!(out, "App container:    {}", self.app_container);
        let _ = writeln!(out, "DB container:     {}", self.db_container);
        let _ = writeln!(out, "Archive:          {}", self.archive);
        let _ = writeln!(out, "Destination:      {}", self.destination);
        let _ = writeln!(out);
        let _ = writeln!(out, "Contents");
        let _ = writeln!(out, "--------");
        for name in ARTIFACTS {
            let _ = writeln!(out, "  {name}");
        }
        let _ = writeln!(out, "  {MANIFEST_FILE}");
        let _ = writeln!(out);
        let _ = writeln!(out, "Restore");
        let _ = writeln!(out, "-------");
        let _ = writeln!(out, "1. Extract: tar -xzf {}", self.archive);
        let _ = writeln!(
            out,
            "2. Enable maintenance mode: docker exec -u www-data {} php occ maintenance:mode --on",
            self.app_container
        );
        let _ = writeln!(
            out,
            "3. Restore the database: gunzip < {DATABASE_DUMP} | docker exec -i {} mysql -u root -p",
            self.db_container
        );
        let _ = writeln!(
            out,
            "4. Restore data: tar -xzf {DATA_ARCHIVE} -C {data_parent} (recreates {data_name}/)"
        );
        let _ = writeln!(
            out,
            "5. Restore the app volume: docker run --rm -v {}:/target -v \"$PWD\":/backup alpine tar -xzf /backup/{APP_ARCHIVE} -C /target",
            self.app_volume
        );
        let _ = writeln!(
            out,
            "6. Fix ownership: docker exec {} chown -R www-data:www-data /var/www/html",
            self.app_container
        );
        let _ = writeln!(
            out,
            "7. Disable maintenance mode: docker exec -u www-data {} php occ maintenance:mode --off",
            self.app_container
        );
        let _ = writeln!(
            out,
            "8. Rescan files: docker exec -u www-data {} php occ files:scan --all",
            self.app_container
        );
        out
    }

    /// Write the manifest into `dir`, returning its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, self.render())
            .with_context(|| format!("failed to write manifest {}", path.display()))?;
        info!(file = MANIFEST_FILE, app_version = %self.app_version, "manifest written");
        Ok(path)
    }
}

/// Run a lookup command; any failure yields `None`.
async fn query(runner: &dyn CommandRunner, invocation: &Invocation) -> Option<String> {
    match runner.run_checked(invocation).await {
        Ok(result) => Some(result.stdout),
        Err(e) => {
            debug!(command = %invocation, error = %e, "manifest lookup failed");
            None
        }
    }
}

/// Pull the version out of `occ status --output=json`.
///
/// Falls back to the first non-empty output line when the JSON cannot be
/// parsed, e.g. when `occ` prints a warning before it.
pub fn parse_app_version(output: &str) -> String {
    let json_start = output.find('{');
    let parsed = json_start
        .and_then(|start| output.get(start..))
        .and_then(|json| serde_json::from_str::<OccStatus>(json).ok());
    if let Some(status) = parsed {
        if let Some(version) = status.versionstring.or(status.version) {
            if !version.trim().is_empty() {
                return version.trim().to_owned();
            }
        }
    }
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| UNKNOWN.to_owned())
}
