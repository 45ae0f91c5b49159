//! Remote channel: ssh commands, in-process packaging, rsync upload.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::capture::{self, human_size};
use crate::config::{BackupConfig, RemoteConfig};
use crate::executor::{shell_quote, CommandRunner, ExecResult, ExecutorError, Invocation};
use crate::run::ArchiveName;
use crate::staging::StagingDir;

/// Authenticated remote shell parameters shared by `ssh` and `rsync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShell {
    host: String,
    port: u16,
    user: String,
    identity_file: PathBuf,
}

impl RemoteShell {
    /// Build from the `[remote]` settings.
    pub fn from_config(remote: &RemoteConfig) -> Self {
        Self {
            host: remote.host.clone(),
            port: remote.port,
            user: remote.user.clone(),
            identity_file: remote.identity_file.clone(),
        }
    }

    /// `user@host`.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_options(&self) -> Vec<String> {
        vec![
            "-i".to_owned(),
            self.identity_file.to_string_lossy().into_owned(),
            "-p".to_owned(),
            self.port.to_string(),
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            "StrictHostKeyChecking=accept-new".to_owned(),
        ]
    }

    /// `ssh` invocation running `words` on the remote host.
    ///
    /// The remote side re-parses its arguments with a shell, so every word
    /// is quoted individually.
    pub fn command<I, S>(&self, words: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Invocation::new("ssh")
            .args(self.ssh_options())
            .arg("--")
            .arg(self.destination())
            .args(words.into_iter().map(|word| shell_quote(word.as_ref())))
    }

    /// Remote-shell command string for `rsync -e`.
    ///
    /// rsync splits this itself and honours quotes but not backslashes.
    pub fn rsync_shell(&self) -> String {
        std::iter::once("ssh".to_owned())
            .chain(self.ssh_options().iter().map(|opt| rsync_quote(opt)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run `words` remotely and fail on non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns an error if `ssh` cannot start or the remote command fails.
    pub async fn run<I, S>(
        &self,
        runner: &dyn CommandRunner,
        words: I,
    ) -> Result<ExecResult, ExecutorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        runner.run_checked(&self.command(words)).await
    }
}

fn rsync_quote(word: &str) -> String {
    if !word.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        return word.to_owned();
    }
    if word.contains('\'') {
        format!("\"{word}\"")
    } else {
        format!("'{word}'")
    }
}

/// Local archive that is deleted when dropped.
#[derive(Debug)]
pub struct TransientArchive {
    path: PathBuf,
    size: u64,
    removed: bool,
}

impl TransientArchive {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            size: 0,
            removed: false,
        }
    }

    /// Archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compressed size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the archive now.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn discard(mut self) -> std::io::Result<()> {
        self.removed = true;
        remove_file_if_present(&self.path)
    }
}

impl Drop for TransientArchive {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_file_if_present(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove transient archive");
        }
    }
}

fn remove_file_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Package the staging directory into `destination` as a gzip'd tarball.
///
/// Entries are rooted at the staging directory's own name. Runs on the
/// blocking pool. The destination is owned by the returned guard from the
/// moment it is created, so a failed or cancelled packaging removes it.
///
/// # Errors
///
/// Returns an error if any file cannot be read or the archive cannot be written.
pub async fn package(staging: &StagingDir, destination: &Path) -> anyhow::Result<TransientArchive> {
    let source = staging.path().to_path_buf();
    let root_name = staging.name();

    let file = File::create(destination)
        .with_context(|| format!("failed to create archive {}", destination.display()))?;
    let mut archive = TransientArchive::new(destination.to_path_buf());

    tokio::task::spawn_blocking(move || package_sync(file, &source, &root_name))
        .await
        .context("packaging task panicked")??;

    archive.size = capture::file_size(archive.path())?;
    Ok(archive)
}

fn package_sync(file: File, source: &Path, root_name: &str) -> anyhow::Result<()> {
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(root_name, source)
        .with_context(|| format!("failed to add {} to archive", source.display()))?;
    let encoder = builder
        .into_inner()
        .context("failed to finish tar stream")?;
    encoder
        .finish()
        .context("failed to finish gzip stream")?
        .sync_all()
        .context("failed to flush archive")?;
    Ok(())
}

/// Outcome of a successful transport step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Archive name on the remote host.
    pub archive: ArchiveName,
    /// Local compressed size in bytes.
    pub size_bytes: u64,
    /// Size reported by the remote host, when available.
    pub remote_size: Option<String>,
}

/// Ship the staging directory to the remote host.
///
/// Re-verifies the artifacts, creates the remote directory, packages,
/// uploads with rsync, and deletes the local archive whatever the upload
/// outcome.
///
/// # Errors
///
/// Returns an error if verification, remote directory creation, packaging,
/// or the upload fails.
pub async fn send(
    runner: &dyn CommandRunner,
    config: &BackupConfig,
    staging: &StagingDir,
    archive: ArchiveName,
) -> anyhow::Result<UploadReport> {
    capture::verify_artifacts(staging.path())
        .context("refusing to transfer an incomplete staging directory")?;

    let shell = RemoteShell::from_config(&config.remote);
    let remote_dir = config.remote_directory();

    shell
        .run(runner, ["mkdir", "-p", remote_dir])
        .await
        .with_context(|| format!("failed to create remote directory {remote_dir}"))?;
    debug!(dir = remote_dir, "remote directory ready");

    let local_path = config.paths.staging_root.join(archive.to_string());
    let transient = package(staging, &local_path).await?;
    let size_bytes = transient.size();
    info!(archive = %archive, size = %human_size(size_bytes), "archive packaged");

    let rsync = Invocation::new("rsync")
        .args(["-a", "--partial", "--checksum", "--protect-args", "-e"])
        .arg(shell.rsync_shell())
        .path_arg(transient.path())
        .arg(format!("{}:{remote_dir}/", shell.destination()));
    let uploaded = runner.run_checked(&rsync).await;

    if let Err(e) = transient.discard() {
        warn!(path = %local_path.display(), error = %e, "failed to remove local archive");
    }
    uploaded.with_context(|| format!("upload of {archive} failed"))?;

    let remote_path = format!("{remote_dir}/{archive}");
    let remote_size = match shell.run(runner, ["du", "-h", remote_path.as_str()]).await {
        Ok(result) => result
            .stdout
            .split_whitespace()
            .next()
            .map(ToOwned::to_owned),
        Err(e) => {
            debug!(error = %e, "remote size query failed");
            None
        }
    };

    info!(
        archive = %archive,
        destination = %format!("{}:{remote_dir}", shell.destination()),
        remote_size = remote_size.as_deref().unwrap_or("unknown"),
        "archive uploaded"
    );
    Ok(UploadReport {
        archive,
        size_bytes,
        remote_size,
    })
}
