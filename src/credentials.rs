//! Secret values and private-key permission enforcement.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

/// Mode an SSH private key must carry.
pub const PRIVATE_KEY_MODE: u32 = 0o600;

/// A secret string whose `Debug`/`Display` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw value. Only hand this to a child environment.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the wrapped value is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&"[REDACTED]").finish()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// What [`ensure_private_key`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPermissions {
    /// The key already had mode `0600`.
    AlreadyPrivate,
    /// The key had a different mode and was corrected to `0600`.
    Corrected {
        /// Mode found on entry.
        previous_mode: u32,
    },
}

/// Ensure the private key exists and has exactly mode `0600`, fixing it if not.
///
/// # Errors
///
/// Returns an error if the key is missing, is not a regular file, or its
/// permissions cannot be read or corrected.
pub fn ensure_private_key(path: &Path) -> anyhow::Result<KeyPermissions> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("ssh key not found at {}", path.display()))?;
    anyhow::ensure!(
        metadata.is_file(),
        "ssh key {} is not a regular file",
        path.display()
    );

    let mode = file_mode(&metadata);
    if mode == PRIVATE_KEY_MODE {
        return Ok(KeyPermissions::AlreadyPrivate);
    }

    warn!(
        path = %path.display(),
        mode = %format!("{mode:o}"),
        "ssh key permissions are not 600, correcting"
    );
    enforce_private_file_permissions(path)?;
    info!(path = %path.display(), "ssh key permissions set to 600");
    Ok(KeyPermissions::Corrected {
        previous_mode: mode,
    })
}

/// Set a file's permissions to `0600` when supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = fs::Permissions::from_mode(PRIVATE_KEY_MODE);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    PRIVATE_KEY_MODE
}
