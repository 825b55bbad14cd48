use crate::backup::checksum::Checksum;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::fs::File;
use std::io::{BufReader, BufWriter, IntoInnerError, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Verified,
    ChecksumMismatch,
    CopyFailed,
}

/// Outcome of copying one file.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub status: RecordStatus,
}

impl BackupRecord {
    pub fn verified(source: PathBuf, destination: PathBuf, checksum: Checksum) -> Self {
        Self {
            source,
            destination,
            checksum: Some(checksum),
            status: RecordStatus::Verified,
        }
    }

    pub fn failed(source: PathBuf, destination: PathBuf, error: &Error) -> Self {
        Self {
            source,
            destination,
            checksum: None,
            status: error.copy_status(),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == RecordStatus::Verified
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_dir: PathBuf,
    pub success_count: usize,
    pub fail_count: usize,
    pub records: Vec<BackupRecord>,
    #[serde(default)]
    pub encrypted_archives: Vec<PathBuf>,
}

impl Manifest {
    pub fn new(
        started_at: DateTime<Utc>,
        run_dir: PathBuf,
        records: Vec<BackupRecord>,
        encrypted_archives: Vec<PathBuf>,
    ) -> Self {
        let success_count = records.iter().filter(|r| r.is_verified()).count();
        let fail_count = records.len() - success_count;
        Self {
            started_at,
            finished_at: Utc::now(),
            run_dir,
            success_count,
            fail_count,
            records,
            encrypted_archives,
        }
    }

    pub fn path<P: AsRef<Path>>(run_dir: P) -> PathBuf {
        run_dir.as_ref().join(MANIFEST_FILE_NAME)
    }

    /// Writes `run_dir/manifest.json` through a temp file and rename.
    pub fn write<P: AsRef<Path>>(&self, run_dir: P) -> Result<PathBuf> {
        let path = Self::path(&run_dir);
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{MANIFEST_FILE_NAME}."))
            .suffix(".tmp")
            .tempfile_in(run_dir.as_ref())?;

        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .sync_all()?;

        tmp.persist(&path).map_err(|e| Error::from(e.error))?;
        tracing::debug!("Wrote manifest {:?}", path);
        Ok(path)
    }

    pub fn read<P: AsRef<Path>>(run_dir: P) -> Result<Self> {
        let reader = BufReader::new(File::open(Self::path(run_dir))?);
        Ok(serde_json::from_reader(reader)?)
    }
}
