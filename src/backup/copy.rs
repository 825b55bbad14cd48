use crate::backup::checksum::{checksum, Checksum};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use filetime::FileTime;
use std::fs::{self, File};
use std::path::Path;
use tempfile::NamedTempFile;

/// Copies `src` to `dst`, returning the verified digest.
pub fn copy_verified<P1: AsRef<Path>, P2: AsRef<Path>>(src: P1, dst: P2) -> Result<Checksum> {
    copy_verified_with(src, dst, |p: &Path| checksum(p))
}

/// Same as [`copy_verified`] with a caller supplied digest function.
pub fn copy_verified_with<P1, P2, F>(src: P1, dst: P2, digest: F) -> Result<Checksum>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    F: Fn(&Path) -> Result<Checksum>,
{
    let src = src.as_ref();
    let dst = dst.as_ref();
    let copy_failed = |source: std::io::Error| Error::CopyFailed {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        source,
    };

    let tmp = write_temp_copy(src, dst).map_err(copy_failed)?;

    let expected = digest(src)?;
    let actual = digest(tmp.path())?;
    if expected != actual {
        tracing::error!(
            "Checksum mismatch {:?} -> {:?}: {} != {}",
            src,
            tmp.path(),
            expected,
            actual
        );
        // Dropping the handle unlinks the temp file.
        drop(tmp);
        return Err(Error::ChecksumMismatch {
            src: src.to_path_buf(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    tmp.persist(dst).map_err(|e| copy_failed(e.error))?;
    tracing::info!("Verified {:?} -> {:?} ({})", src, dst, expected);
    Ok(expected)
}

/// Writes the source bytes and metadata into a temp file next to `dst`.
fn write_temp_copy(src: &Path, dst: &Path) -> std::io::Result<NamedTempFile> {
    let parent = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(&format!(".{}.tmp", std::process::id()))
        .tempfile_in(parent)?;

    let mut src_file = File::open(src)?;
    std::io::copy(&mut src_file, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;

    let metadata = src_file.metadata()?;
    fs::set_permissions(tmp.path(), metadata.permissions())?;
    filetime::set_file_mtime(
        tmp.path(),
        FileTime::from_last_modification_time(&metadata),
    )?;

    Ok(tmp)
}
