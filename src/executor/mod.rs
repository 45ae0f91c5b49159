//! Typed command invocations and the runner seam every pipeline step uses.
//!
//! Steps never assemble shell text. They build an [`Invocation`] (program,
//! argument list, extra environment, stdout sink) and hand it to a
//! [`CommandRunner`]. Production uses [`system::SystemRunner`]; tests swap in
//! a scripted double.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

pub mod redactor;
pub mod system;

/// Maximum number of stderr characters carried into an error message.
const STDERR_TAIL_CHARS: usize = 400;

/// Where a command's standard output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutSink {
    /// Capture into [`ExecResult::stdout`].
    Capture,
    /// Stream through a gzip encoder into the given file.
    GzipFile(PathBuf),
}

/// A single external command: program, arguments, extra environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdout: StdoutSink,
}

impl Invocation {
    /// Start building an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdout: StdoutSink::Capture,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a path argument.
    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    /// Set an environment variable for the child process only.
    ///
    /// Values never appear in the rendered command line or in logs.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Compress standard output with gzip into `path`.
    #[must_use]
    pub fn stdout_gzip(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = StdoutSink::GzipFile(path.into());
        self
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument list, without the program.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Extra environment for the child.
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Stdout handling.
    pub fn stdout(&self) -> &StdoutSink {
        &self.stdout
    }

    /// Program followed by arguments, space separated. For logs only.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field(
                "env",
                &self.env.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .field("stdout", &self.stdout)
            .finish()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Command execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code (`None` when the process was killed by a signal).
    pub exit_code: Option<i32>,
    /// Captured stdout text. Empty when stdout went to a file sink.
    pub stdout: String,
    /// Captured stderr text.
    pub stderr: String,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` when the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors produced by command execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The program could not be started at all.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The program ran and exited unsuccessfully.
    #[error("`{command}` exited with {}: {stderr}", describe_exit(.exit_code))]
    Failed {
        /// Rendered command line.
        command: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Tail of stderr.
        stderr: String,
    },
    /// Reading output or writing the stdout sink failed.
    #[error("i/o error while running `{command}`: {source}")]
    Io {
        /// Rendered command line.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}

/// Keep the last [`STDERR_TAIL_CHARS`] characters of stderr, trimmed.
pub fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    let skip = count.saturating_sub(STDERR_TAIL_CHARS);
    trimmed.chars().skip(skip).collect()
}

/// Runs [`Invocation`]s to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and return its result regardless of exit code.
    async fn run(&self, invocation: &Invocation) -> Result<ExecResult, ExecutorError>;

    /// Resolve a program name against the search path.
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Run the command and turn a non-zero exit into [`ExecutorError::Failed`].
    async fn run_checked(&self, invocation: &Invocation) -> Result<ExecResult, ExecutorError> {
        let result = self.run(invocation).await?;
        tracing::debug!(
            command = %invocation.program(),
            exit_code = ?result.exit_code,
            elapsed_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "command finished"
        );
        if result.success() {
            Ok(result)
        } else {
            Err(ExecutorError::Failed {
                command: invocation.command_line(),
                exit_code: result.exit_code,
                stderr: stderr_tail(&result.stderr),
            })
        }
    }
}

/// Shell-quote a string with single quotes (handles embedded single quotes).
///
/// Used for words handed to a remote shell, which re-parses its arguments.
pub fn shell_quote(raw: &str) -> String {
    let escaped = raw.replace('\'', r"'\''");
    format!("'{escaped}'")
}
