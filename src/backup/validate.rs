//! Validation functions for configuration values and backup sources.
//!
//! The `validate_*` helpers returning `ValidationError` plug into the
//! `validator` derive on [`BackupConfig`](crate::backup::backup_config::BackupConfig).
//! [`validate_paths`] is the fail-closed precondition run before any copy.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result;
use crate::backup::result_error::result::convert_error_vec;
use validator::ValidationError;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Roots that may never be backed up as a whole.
pub const PROTECTED_PATHS: [&str; 5] = ["/proc", "/sys", "/dev", "/run", "/tmp"];

/// Matches the path as written and, when it resolves, its canonical form, so
/// `/var/run` or a symlink to `/proc` is caught too.
pub fn is_protected_path<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let matches = |candidate: &Path| PROTECTED_PATHS.iter().any(|p| candidate == Path::new(p));
    matches(path) || std::fs::canonicalize(path).is_ok_and(|real| matches(&real))
}

/// Every source must exist and must not be one of [`PROTECTED_PATHS`].
///
/// All violations are collected so the operator sees them in one pass.
pub fn validate_paths<P: AsRef<Path>>(sources: &[P]) -> result::Result<()> {
    let errors = sources
        .iter()
        .filter_map(|source| {
            let source = AsRef::<Path>::as_ref(source);
            if is_protected_path(source) {
                Some(Error::ProtectedPath(source.to_path_buf()))
            } else if !source.exists() {
                Some(Error::SourceNotFound(source.to_path_buf()))
            } else {
                None
            }
        })
        .inspect(|e| tracing::error!("{e}"))
        .collect::<Vec<_>>();

    convert_error_vec(errors)
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_absolute_paths(paths: &[PathBuf]) -> Result<(), ValidationError> {
    match paths.iter().find(|p| !p.is_absolute()) {
        Some(p) => Err(ValidationError::new("RelativePath")
            .with_message(format!("{:?} must be an absolute path", p).into())),
        None => Ok(()),
    }
}

pub fn validate_non_zero_duration(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        Err(ValidationError::new("ZeroDuration").with_message("duration must be non-zero".into()))
    } else {
        Ok(())
    }
}
