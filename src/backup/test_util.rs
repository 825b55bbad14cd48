use std::path::Path;
use tempfile::TempDir;

/// Temp dir without a leading dot so the transient filter keeps its contents.
pub fn test_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("vbackup-test-")
        .tempdir()
        .unwrap()
}

pub fn write_file<P: AsRef<Path>>(path: P, content: &str) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
