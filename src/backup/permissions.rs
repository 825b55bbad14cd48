use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Bits cleared on everything inside a finished run directory.
const GROUP_OTHER_MASK: u32 = 0o077;

/// Clears group/other permission bits on `run_dir` and everything under it.
///
/// Symlinks are not followed. Every entry is attempted; failures are returned
/// together.
pub fn restrict_permissions<P: AsRef<Path>>(run_dir: P) -> Result<()> {
    let errors: Vec<Error> = WalkDir::new(run_dir.as_ref())
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(e.into()),
            };
            if entry.path_is_symlink() {
                return None;
            }
            restrict_one(entry.path()).err()
        })
        .collect();

    convert_error_vec(errors)
}

fn restrict_one(path: &Path) -> Result<()> {
    let mode = fs::symlink_metadata(path)?.permissions().mode();
    if mode & GROUP_OTHER_MASK != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & !GROUP_OTHER_MASK))?;
        tracing::trace!("Restricted {:?} to {:o}", path, mode & !GROUP_OTHER_MASK & 0o7777);
    }
    Ok(())
}
