//! Configuration loading and validation.
//!
//! A [`BackupConfig`] is built once at startup and passed by reference to
//! every step. Precedence: env vars > config file > defaults.
//!
//! Config file path: `--config`, else `$BACKUP_CONFIG`, else
//! `/etc/nextcloud-backup/config.toml`. A missing file means defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credentials::Secret;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nextcloud-backup/config.toml";

// ── Top-level config ────────────────────────────────────────────

/// Immutable settings for one backup run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Remote backup target (`[remote]`).
    pub remote: RemoteConfig,
    /// Container stack being backed up (`[stack]`).
    pub stack: StackConfig,
    /// Local paths (`[paths]`).
    pub paths: PathsConfig,
    /// Database password. Environment only, never read from the TOML file.
    #[serde(skip)]
    pub db_password: Option<Secret>,
    /// Config file that was read, if one existed.
    #[serde(skip)]
    pub source: Option<PathBuf>,
    /// Environment overrides whose values could not be parsed.
    #[serde(skip)]
    pub rejected_overrides: Vec<RejectedOverride>,
}

/// An environment variable whose value did not parse for its setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOverride {
    /// Variable name.
    pub var: &'static str,
    /// Raw value as found in the environment.
    pub value: String,
}

/// Invalid or missing settings, detected before any step runs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting has no value.
    #[error("missing required setting `{setting}` (set {env})")]
    Missing {
        /// Dotted TOML key.
        setting: &'static str,
        /// Environment variable that can supply it.
        env: &'static str,
    },
    /// An environment override could not be parsed.
    #[error("invalid value `{value}` for {var}")]
    InvalidOverride {
        /// Variable name.
        var: &'static str,
        /// Rejected value.
        value: String,
    },
    /// A setting has a value that cannot work.
    #[error("invalid setting `{setting}`: {reason}")]
    Invalid {
        /// Dotted TOML key.
        setting: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl BackupConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path_with(|key| std::env::var(key).ok()),
        };
        let mut config = Self::load_from_file(&path)?;
        if path.exists() {
            config.source = Some(path);
        }
        config.apply_overrides(|key| std::env::var(key).ok());
        config.expand_home_paths();
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("BACKUP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown value types.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Numeric values that do not parse leave the setting untouched and are
    /// recorded in `rejected_overrides`, which validation reports.
    /// Takes a resolver function for testability (avoids `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Remote.
        if let Some(v) = env("BACKUP_REMOTE_HOST") {
            self.remote.host = v;
        }
        if let Some(v) = env("BACKUP_REMOTE_PORT") {
            match v.trim().parse() {
                Ok(port) => self.remote.port = port,
                Err(_) => self.rejected_overrides.push(RejectedOverride {
                    var: "BACKUP_REMOTE_PORT",
                    value: v,
                }),
            }
        }
        if let Some(v) = env("BACKUP_REMOTE_USER") {
            self.remote.user = v;
        }
        if let Some(v) = env("BACKUP_SSH_KEY") {
            self.remote.identity_file = PathBuf::from(v);
        }
        if let Some(v) = env("BACKUP_REMOTE_DIR") {
            self.remote.directory = v;
        }
        if let Some(v) = env("BACKUP_RETENTION_DAYS") {
            match v.trim().parse() {
                Ok(days) => self.remote.retention_days = days,
                Err(_) => self.rejected_overrides.push(RejectedOverride {
                    var: "BACKUP_RETENTION_DAYS",
                    value: v,
                }),
            }
        }

        // Stack.
        if let Some(v) = env("NEXTCLOUD_CONTAINER") {
            self.stack.app_container = v;
        }
        if let Some(v) = env("NEXTCLOUD_DB_CONTAINER") {
            self.stack.db_container = v;
        }
        if let Some(v) = env("MYSQL_DATABASE") {
            self.stack.db_name = v;
        }
        if let Some(v) = env("MYSQL_USER") {
            self.stack.db_user = v;
        }
        if let Some(v) = env("NEXTCLOUD_DATA_DIR") {
            self.stack.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("NEXTCLOUD_APP_VOLUME") {
            self.stack.app_volume = v;
        }

        // Paths.
        if let Some(v) = env("BACKUP_STAGING_ROOT") {
            self.paths.staging_root = PathBuf::from(v);
        }
        if let Some(v) = env("BACKUP_LOG_FILE") {
            self.paths.log_file = PathBuf::from(v);
        }

        // Secrets.
        if let Some(v) = env("MYSQL_PASSWORD") {
            self.db_password = Some(Secret::new(v));
        }
    }

    /// Expand a leading `~/` in local paths to the current user's home.
    pub fn expand_home_paths(&mut self) {
        self.remote.identity_file = expand_home(&self.remote.identity_file);
        self.stack.data_dir = expand_home(&self.stack.data_dir);
        self.paths.staging_root = expand_home(&self.paths.staging_root);
        self.paths.log_file = expand_home(&self.paths.log_file);
    }

    /// Check the settings needed to reach the remote host.
    ///
    /// Enough for commands that only talk to the remote (`prune`, `list`).
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate_remote(&self) -> Result<(), ConfigError> {
        if let Some(rejected) = self.rejected_overrides.first() {
            return Err(ConfigError::InvalidOverride {
                var: rejected.var,
                value: rejected.value.clone(),
            });
        }
        if self.remote.host.trim().is_empty() {
            return Err(ConfigError::Missing {
                setting: "remote.host",
                env: "BACKUP_REMOTE_HOST",
            });
        }
        if self.remote.user.trim().is_empty() {
            return Err(ConfigError::Missing {
                setting: "remote.user",
                env: "BACKUP_REMOTE_USER",
            });
        }
        if self.remote.port == 0 {
            return Err(ConfigError::Invalid {
                setting: "remote.port",
                reason: "port must be between 1 and 65535".to_owned(),
            });
        }
        let remote_dir = self.remote.directory.trim_end_matches('/');
        if !self.remote.directory.starts_with('/') || remote_dir.is_empty() {
            return Err(ConfigError::Invalid {
                setting: "remote.directory",
                reason: format!(
                    "must be an absolute path other than `/`, got `{}`",
                    self.remote.directory
                ),
            });
        }
        Ok(())
    }

    /// Check that every setting the pipeline needs is present and usable.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found, in declaration order.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_remote()?;
        if self.stack.app_container.trim().is_empty() {
            return Err(ConfigError::Missing {
                setting: "stack.app_container",
                env: "NEXTCLOUD_CONTAINER",
            });
        }
        if self.stack.db_container.trim().is_empty() {
            return Err(ConfigError::Missing {
                setting: "stack.db_container",
                env: "NEXTCLOUD_DB_CONTAINER",
            });
        }
        if self.stack.data_dir.file_name().is_none() {
            return Err(ConfigError::Invalid {
                setting: "stack.data_dir",
                reason: format!(
                    "`{}` does not name a directory",
                    self.stack.data_dir.display()
                ),
            });
        }
        if self.paths.log_file.file_name().is_none() {
            return Err(ConfigError::Invalid {
                setting: "paths.log_file",
                reason: format!("`{}` does not name a file", self.paths.log_file.display()),
            });
        }
        match &self.db_password {
            Some(secret) if !secret.is_blank() => Ok(()),
            _ => Err(ConfigError::Missing {
                setting: "database password",
                env: "MYSQL_PASSWORD",
            }),
        }
    }

    /// Remote directory without trailing slashes.
    pub fn remote_directory(&self) -> &str {
        self.remote.directory.trim_end_matches('/')
    }
}

// ── Remote config ───────────────────────────────────────────────

/// Remote backup host reached over SSH.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key used for both `ssh` and `rsync`.
    pub identity_file: PathBuf,
    /// Directory holding the archives on the remote host.
    pub directory: String,
    /// Archives older than this many days are deleted.
    pub retention_days: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            identity_file: PathBuf::from("~/.ssh/id_ed25519"),
            directory: "/backups/nextcloud".to_owned(),
            retention_days: 7,
        }
    }
}

// ── Stack config ────────────────────────────────────────────────

/// The containerized application stack.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Application container name.
    pub app_container: String,
    /// Database container name.
    pub db_container: String,
    /// Database schema to dump.
    pub db_name: String,
    /// Database user for the dump.
    pub db_user: String,
    /// Host directory holding the application's primary data.
    pub data_dir: PathBuf,
    /// Named volume with application code and configuration.
    pub app_volume: String,
    /// User that runs `occ` inside the application container.
    pub web_user: String,
    /// Image for the throwaway container that archives the volume.
    pub helper_image: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            app_container: "nextcloud-app".to_owned(),
            db_container: "nextcloud-db".to_owned(),
            db_name: "nextcloud".to_owned(),
            db_user: "nextcloud".to_owned(),
            data_dir: PathBuf::from("/srv/nextcloud/data"),
            app_volume: "nextcloud_app".to_owned(),
            web_user: "www-data".to_owned(),
            helper_image: "alpine:3".to_owned(),
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Local filesystem locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent of per-run staging directories and transient archives.
    pub staging_root: PathBuf,
    /// Append-only log file.
    pub log_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/var/tmp/nextcloud-backup"),
            log_file: PathBuf::from("/var/log/nextcloud-backup.log"),
        }
    }
}

/// Load `KEY=value` pairs from a `.env` file into the process environment.
///
/// Variables already set in the environment win. Returns `false` when the
/// file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_env_file(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    dotenvy::from_path(path)
        .with_context(|| format!("failed to load environment file {}", path.display()))?;
    Ok(true)
}

/// Expand a leading `~/` using the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}
