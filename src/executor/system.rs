//! Process-backed runner built on `tokio::process`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::redactor::Redactor;
use super::{CommandRunner, ExecResult, ExecutorError, Invocation, StdoutSink};

const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// Runs invocations as real child processes.
///
/// Children are killed if the awaiting future is dropped, so an interrupted
/// run never leaves a dump or archive process behind.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    redactor: Redactor,
}

impl SystemRunner {
    /// Create a runner whose captured output passes through `redactor`.
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }

    fn command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(invocation.program());
        cmd.args(invocation.arguments())
            .envs(invocation.environment().iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_captured(&self, invocation: &Invocation) -> Result<ExecResult, ExecutorError> {
        let started = Instant::now();
        let output = Self::command(invocation)
            .output()
            .await
            .map_err(|source| ExecutorError::Spawn {
                program: invocation.program().to_owned(),
                source,
            })?;

        Ok(ExecResult {
            exit_code: output.status.code(),
            stdout: self.redactor.redact(&String::from_utf8_lossy(&output.stdout)),
            stderr: self.redactor.redact(&String::from_utf8_lossy(&output.stderr)),
            duration: started.elapsed(),
        })
    }

    async fn run_into_gzip(
        &self,
        invocation: &Invocation,
        destination: &Path,
    ) -> Result<ExecResult, ExecutorError> {
        let started = Instant::now();
        let io_error = |source: std::io::Error| ExecutorError::Io {
            command: invocation.command_line(),
            source,
        };

        let file = std::fs::File::create(destination).map_err(io_error)?;
        let mut child = Self::command(invocation)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: invocation.program().to_owned(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            io_error(std::io::Error::other("child stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            io_error(std::io::Error::other("child stderr was not captured"))
        })?;

        let mut encoder = GzEncoder::new(file, Compression::default());
        let (copied, stderr_text) =
            tokio::join!(pump_into(stdout, &mut encoder), read_all(stderr));
        let bytes = copied.map_err(io_error)?;
        let stderr_text = stderr_text.map_err(io_error)?;
        encoder
            .finish()
            .and_then(|mut file| file.flush())
            .map_err(io_error)?;

        let status = child.wait().await.map_err(io_error)?;
        debug!(
            command = %invocation.program(),
            uncompressed_bytes = bytes,
            path = %destination.display(),
            "stdout compressed to file"
        );

        Ok(ExecResult {
            exit_code: status.code(),
            stdout: String::new(),
            stderr: self.redactor.redact(&stderr_text),
            duration: started.elapsed(),
        })
    }
}

/// Copy an async stream into a blocking writer in fixed-size chunks.
async fn pump_into<R, W>(mut reader: R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut buf = vec![0_u8; COPY_BUFFER_BYTES];
    let mut total = 0_u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = buf.get(..n).unwrap_or_default();
        writer.write_all(chunk)?;
        total = total.saturating_add(u64::try_from(n).unwrap_or(u64::MAX));
    }
    Ok(total)
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ExecResult, ExecutorError> {
        debug!(command = %invocation, "running command");
        match invocation.stdout() {
            StdoutSink::Capture => self.run_captured(invocation).await,
            StdoutSink::GzipFile(path) => self.run_into_gzip(invocation, path).await,
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        let search_path = std::env::var_os("PATH")?;
        std::env::split_paths(&search_path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
