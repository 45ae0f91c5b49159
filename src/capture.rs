//! Capture steps: database dump, data directory archive, app volume archive.
//!
//! Each capture writes exactly one artifact into the staging directory and
//! fails the run on any error. Order is fixed by the pipeline: database
//! first, for a consistent snapshot, then the slower filesystem archives.

use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::read::GzDecoder;
use tracing::info;

use crate::config::StackConfig;
use crate::credentials::Secret;
use crate::executor::{CommandRunner, Invocation};
use crate::staging::StagingDir;

/// Compressed SQL dump.
pub const DATABASE_DUMP: &str = "database.sql.gz";
/// Archive of the host data directory.
pub const DATA_ARCHIVE: &str = "nextcloud-data.tar.gz";
/// Archive of the application volume.
pub const APP_ARCHIVE: &str = "nextcloud-app.tar.gz";
/// Every artifact a complete staging directory holds besides the manifest.
pub const ARTIFACTS: [&str; 3] = [DATABASE_DUMP, DATA_ARCHIVE, APP_ARCHIVE];

/// Mount point of the volume inside the helper container.
const HELPER_SOURCE: &str = "/source";
/// Mount point of the scratch directory inside the helper container.
const HELPER_OUTPUT: &str = "/backup";

/// Dump the database inside its container and gzip the stream into staging.
///
/// The password reaches `mysqldump` through `MYSQL_PWD` in the environment
/// of the `docker exec` client, never through the argument list.
///
/// Returns the compressed size in bytes.
///
/// # Errors
///
/// Returns an error if the dump exits non-zero or the result is missing,
/// empty, or not a complete gzip stream.
pub async fn capture_database(
    runner: &dyn CommandRunner,
    stack: &StackConfig,
    password: &Secret,
    staging: &StagingDir,
) -> anyhow::Result<u64> {
    let target = staging.file(DATABASE_DUMP);
    let invocation = Invocation::new("docker")
        .args(["exec", "-i", "-e", "MYSQL_PWD"])
        .arg(stack.db_container.as_str())
        .args([
            "mysqldump",
            "--single-transaction",
            "--routines",
            "--triggers",
            "--add-drop-database",
        ])
        .arg(format!("--user={}", stack.db_user))
        .arg("--databases")
        .arg(stack.db_name.as_str())
        .env("MYSQL_PWD", password.expose())
        .stdout_gzip(&target);

    runner
        .run_checked(&invocation)
        .await
        .context("database dump failed")?;

    let size = file_size(&target)?;
    anyhow::ensure!(size > 0, "database dump {} is empty", target.display());

    let check_path = target.clone();
    let sql_bytes = tokio::task::spawn_blocking(move || verify_gzip(&check_path))
        .await
        .context("gzip check task panicked")??;
    anyhow::ensure!(
        sql_bytes > 0,
        "database dump {} contains no SQL",
        target.display()
    );

    info!(
        file = DATABASE_DUMP,
        size = %human_size(size),
        size_bytes = size,
        "database dump captured"
    );
    Ok(size)
}

/// Archive the host data directory into staging with `tar -czf`.
///
/// Returns the archive size in bytes.
///
/// # Errors
///
/// Returns an error if the directory is missing or `tar` exits non-zero.
pub async fn capture_data(
    runner: &dyn CommandRunner,
    stack: &StackConfig,
    staging: &StagingDir,
) -> anyhow::Result<u64> {
    let data_dir = &stack.data_dir;
    anyhow::ensure!(
        data_dir.is_dir(),
        "data directory {} does not exist",
        data_dir.display()
    );
    let (parent, name) = split_dir(data_dir)?;
    let target = staging.file(DATA_ARCHIVE);

    let invocation = Invocation::new("tar")
        .arg("-czf")
        .path_arg(&target)
        .arg("-C")
        .path_arg(&parent)
        .arg(name);
    runner
        .run_checked(&invocation)
        .await
        .context("data directory archive failed")?;

    let size = file_size(&target)?;
    info!(file = DATA_ARCHIVE, size = %human_size(size), size_bytes = size, "data directory captured");
    Ok(size)
}

/// Archive the application volume through a throwaway helper container.
///
/// The volume is mounted read-only next to a scratch directory created
/// under `scratch_root`; the archive is then moved into staging and the
/// scratch directory removed.
///
/// Returns the archive size in bytes.
///
/// # Errors
///
/// Returns an error if the scratch directory cannot be created or removed,
/// the helper container fails, or the archive is missing afterwards.
pub async fn capture_volume(
    runner: &dyn CommandRunner,
    stack: &StackConfig,
    staging: &StagingDir,
    scratch_root: &Path,
) -> anyhow::Result<u64> {
    let scratch = tempfile::Builder::new()
        .prefix(".volume-")
        .tempdir_in(scratch_root)
        .with_context(|| format!("failed to create scratch directory in {}", scratch_root.display()))?;
    let host_dir = std::fs::canonicalize(scratch.path())
        .with_context(|| format!("failed to resolve {}", scratch.path().display()))?;

    let invocation = Invocation::new("docker")
        .args(["run", "--rm", "-v"])
        .arg(format!("{}:{HELPER_SOURCE}:ro", stack.app_volume))
        .arg("-v")
        .arg(format!("{}:{HELPER_OUTPUT}", host_dir.display()))
        .arg(stack.helper_image.as_str())
        .args(["tar", "-czf"])
        .arg(format!("{HELPER_OUTPUT}/{APP_ARCHIVE}"))
        .args(["-C", HELPER_SOURCE, "."]);
    runner
        .run_checked(&invocation)
        .await
        .with_context(|| format!("volume archive of {} failed", stack.app_volume))?;

    let produced = host_dir.join(APP_ARCHIVE);
    anyhow::ensure!(
        produced.is_file(),
        "helper container did not produce {}",
        produced.display()
    );
    let target = staging.file(APP_ARCHIVE);
    std::fs::rename(&produced, &target).with_context(|| {
        format!(
            "failed to move {} to {}",
            produced.display(),
            target.display()
        )
    })?;
    scratch
        .close()
        .context("failed to remove volume scratch directory")?;

    let size = file_size(&target)?;
    info!(file = APP_ARCHIVE, volume = %stack.app_volume, size = %human_size(size), size_bytes = size, "app volume captured");
    Ok(size)
}

/// Check that every artifact exists and the dump decompresses.
///
/// Guards transport: a staging directory that fails this never leaves the host.
///
/// # Errors
///
/// Returns an error naming the first missing or corrupt artifact.
pub fn verify_artifacts(staging_dir: &Path) -> anyhow::Result<()> {
    for name in ARTIFACTS {
        let path = staging_dir.join(name);
        anyhow::ensure!(path.is_file(), "artifact {name} is missing from staging");
    }
    let dump = staging_dir.join(DATABASE_DUMP);
    let sql_bytes = verify_gzip(&dump)?;
    anyhow::ensure!(sql_bytes > 0, "artifact {DATABASE_DUMP} contains no SQL");
    Ok(())
}

/// Decompress a gzip file to the end, returning the decompressed length.
///
/// Reading the whole stream validates the trailer checksum.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or is not valid gzip.
pub fn verify_gzip(path: &Path) -> anyhow::Result<u64> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut decoder = GzDecoder::new(file);
    let mut sink = std::io::sink();
    let bytes = std::io::copy(&mut decoder, &mut sink)
        .with_context(|| format!("{} failed gzip integrity check", path.display()))?;
    Ok(bytes)
}

/// Size of a file in bytes.
///
/// # Errors
///
/// Returns an error if the file does not exist.
pub fn file_size(path: &Path) -> anyhow::Result<u64> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("expected artifact {} was not created", path.display()))?;
    Ok(meta.len())
}

/// Format a byte count with a binary unit, e.g. `1.5 MiB`.
#[allow(clippy::cast_precision_loss)]
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = UNITS[0];
    for next in UNITS.iter().skip(1) {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    if unit == UNITS[0] {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {unit}")
    }
}

fn split_dir(dir: &Path) -> anyhow::Result<(PathBuf, String)> {
    let name = dir
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{} has no directory name", dir.display()))?
        .to_string_lossy()
        .into_owned();
    let parent = match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, name))
}
