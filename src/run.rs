//! Run identity and archive naming.

use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, Timelike};

/// Prefix shared by staging directories and remote archives.
pub const ARCHIVE_PREFIX: &str = "nextcloud_backup_";
/// Extension of remote archives.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
/// `find -name` pattern matching every archive this tool produces.
pub const ARCHIVE_GLOB: &str = "nextcloud_backup_*.tar.gz";

const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Timestamp token identifying one run, e.g. `20261016_031500`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(NaiveDateTime);

impl RunId {
    /// Run id for the current local time.
    pub fn now() -> Self {
        Self::from_datetime(Local::now())
    }

    /// Run id for a specific instant, truncated to whole seconds.
    pub fn from_datetime(at: DateTime<Local>) -> Self {
        let naive = at.naive_local();
        Self(naive.with_nanosecond(0).unwrap_or(naive))
    }

    /// Parse a `YYYYmmdd_HHMMSS` token.
    pub fn parse(token: &str) -> Option<Self> {
        if token.len() != 15 {
            return None;
        }
        NaiveDateTime::parse_from_str(token, RUN_ID_FORMAT)
            .ok()
            .map(Self)
    }

    /// Local wall-clock time the run started.
    pub fn started_at(&self) -> NaiveDateTime {
        self.0
    }

    /// Staging directory name for this run.
    pub fn staging_dir_name(&self) -> String {
        format!("{ARCHIVE_PREFIX}{self}")
    }

    /// Archive name for this run.
    pub fn archive_name(&self) -> ArchiveName {
        ArchiveName(*self)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_ID_FORMAT))
    }
}

/// File name of a remote archive: `nextcloud_backup_<RunId>.tar.gz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveName(RunId);

impl ArchiveName {
    /// Parse a file name; anything not produced by this tool yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let token = file_name
            .strip_prefix(ARCHIVE_PREFIX)?
            .strip_suffix(ARCHIVE_SUFFIX)?;
        RunId::parse(token).map(Self)
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ARCHIVE_PREFIX}{}{ARCHIVE_SUFFIX}", self.0)
    }
}
