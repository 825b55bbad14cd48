use crate::backup::compress::CompressorConfig;
use crate::backup::lock::{LockManager, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention::DEFAULT_RETENTION_DAYS;
use crate::backup::scope::{CustomDeserializedGlob, ScopeRules, DEFAULT_MAX_DEPTH, DEFAULT_MAX_FILES};
use crate::backup::validate::{
    validate_absolute_paths, validate_dir_exist_or_created, validate_non_zero_duration,
    validate_writable_dir,
};
use bon::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

static DEFAULT_LOCK_DIR: &str = "/run/lock";
static DEFAULT_STATE_DIR: &str = "/var/lib/vbackup";

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_DIR)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}

fn default_lock_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_max_files() -> usize {
    DEFAULT_MAX_FILES
}

fn default_true() -> bool {
    true
}

/// Everything one backup run needs, loaded from YAML.
///
/// ```yaml
/// out_dir: /srv/backup
/// sources: [/etc, /home/alice]
/// sensitive: [/home/alice/.ssh]
/// exclude: ["**/node_modules/**"]
/// retention_days: 30
/// lock_timeout: 5m
/// compressor:
///   compressor_type: xz
///   level: 6
/// ```
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Backup root; each run creates `backup-<timestamp>` below it
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    #[getset(get = "pub")]
    out_dir: PathBuf,

    #[validate(length(min = 1), custom(function = validate_absolute_paths))]
    #[getset(get = "pub")]
    sources: Vec<PathBuf>,

    /// Directories stored only as an encrypted archive
    #[validate(custom(function = validate_absolute_paths))]
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    sensitive: Vec<PathBuf>,

    /// Globs excluded on top of the built-in transient filter
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    exclude: Vec<CustomDeserializedGlob>,

    #[validate(range(min = 1))]
    #[serde(default = "default_retention_days")]
    #[builder(default = DEFAULT_RETENTION_DAYS)]
    #[getset(get_copy = "pub")]
    retention_days: u32,

    #[validate(custom(function = validate_dir_exist_or_created))]
    #[serde(default = "default_lock_dir")]
    #[builder(into, default = default_lock_dir())]
    #[getset(get = "pub")]
    lock_dir: PathBuf,

    /// Holds the encryption key, created on first use
    #[serde(default = "default_state_dir")]
    #[builder(into, default = default_state_dir())]
    #[getset(get = "pub")]
    state_dir: PathBuf,

    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    #[builder(default = DEFAULT_LOCK_TIMEOUT)]
    #[getset(get_copy = "pub")]
    lock_timeout: Duration,

    #[validate(custom(function = validate_non_zero_duration))]
    #[serde(with = "humantime_serde", default = "default_lock_poll_interval")]
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    #[getset(get_copy = "pub")]
    lock_poll_interval: Duration,

    #[validate(range(min = 1))]
    #[serde(default = "default_max_depth")]
    #[builder(default = DEFAULT_MAX_DEPTH)]
    #[getset(get_copy = "pub")]
    max_depth: usize,

    #[validate(range(min = 1))]
    #[serde(default = "default_max_files")]
    #[builder(default = DEFAULT_MAX_FILES)]
    #[getset(get_copy = "pub")]
    max_files: usize,

    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    compressor: CompressorConfig,

    #[serde(default = "default_true")]
    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    write_manifest: bool,

    /// Copy pool size, rayon's default when unset
    #[validate(range(min = 1))]
    #[getset(get_copy = "pub")]
    threads: Option<usize>,
}

impl BackupConfig {
    /// Parses and validates a YAML config file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| {
                serde_yml::from_reader::<_, BackupConfig>(f)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {:?}", path))
            })?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    /// Scope filters for this config. The backup root and the sensitive
    /// directories are pruned from the walk: earlier runs are never copied,
    /// and sensitive data only lands in the run as an encrypted archive.
    pub fn scope_rules(&self) -> ScopeRules {
        let prune = std::iter::once(self.out_dir.clone())
            .chain(self.sensitive.iter().cloned())
            .collect();
        ScopeRules::builder()
            .max_depth(self.max_depth)
            .max_files(self.max_files)
            .exclude(self.exclude.clone())
            .prune(prune)
            .build()
    }

    pub fn lock_manager(&self) -> LockManager {
        LockManager::in_dir(&self.lock_dir, self.lock_poll_interval)
    }
}
