use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::run::BackupRun;
use crate::backup::AUDIT;
use chrono::{DateTime, Duration, TimeZone, Utc};
use itertools::Itertools;
use std::cmp::Reverse;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Age-based retention of backup run directories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionConfig {
    pub max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_age_days))
    }

    /// Items strictly older than the window, newest first.
    ///
    /// An item aged exactly `max_age_days` is kept.
    pub fn get_delete<R, T, I>(&self, iter: I, now: DateTime<Utc>) -> Vec<ItemWithDateTime<R, T>>
    where
        T: TimeZone,
        I: IntoIterator<Item = ItemWithDateTime<R, T>>,
    {
        let max_age = self.max_age();
        iter.into_iter()
            .filter(|item| now.signed_duration_since(item.date_time.to_utc()) > max_age)
            .sorted_unstable_by_key(|item| Reverse(item.date_time.to_utc()))
            .collect_vec()
    }
}

#[derive(Clone, Hash, Eq, PartialEq)]
pub struct ItemWithDateTime<R, T: TimeZone> {
    pub item: R,
    pub date_time: DateTime<T>,
}

impl<R, T: TimeZone> From<(R, DateTime<T>)> for ItemWithDateTime<R, T> {
    fn from(value: (R, DateTime<T>)) -> Self {
        Self {
            item: value.0,
            date_time: value.1,
        }
    }
}

impl<R: Debug, T: TimeZone> Debug for ItemWithDateTime<R, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} @ {:?}", self.item, self.date_time)
    }
}

/// Outcome of one retention pass. Failures do not stop the pass.
#[derive(Debug, Default)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, Error)>,
}

/// Run directories directly under `root`, paired with their modification time.
pub fn list_backup_runs<P: AsRef<Path>>(root: P) -> Result<Vec<ItemWithDateTime<PathBuf, Utc>>> {
    let runs = std::fs::read_dir(root.as_ref())?
        .filter_map(|r| match r {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Ignoring unreadable entry in {:?}: {e}", root.as_ref());
                None
            }
        })
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| BackupRun::is_run_dir_name(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let path = entry.path();
            match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => Some(ItemWithDateTime::from((path, DateTime::<Utc>::from(modified)))),
                Err(e) => {
                    tracing::warn!("Cannot read modification time of {:?}: {e}", path);
                    None
                }
            }
        })
        .collect_vec();
    Ok(runs)
}

pub fn enforce_retention<P: AsRef<Path>>(root: P, max_age_days: u32) -> Result<RetentionReport> {
    enforce_retention_at(root, max_age_days, Utc::now())
}

/// Deletes every run directory under `root` older than `max_age_days` at `now`.
pub fn enforce_retention_at<P: AsRef<Path>>(
    root: P,
    max_age_days: u32,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    enforce_retention_with(root, max_age_days, now, |p: &Path| std::fs::remove_dir_all(p))
}

pub fn enforce_retention_with<P, F>(
    root: P,
    max_age_days: u32,
    now: DateTime<Utc>,
    remove: F,
) -> Result<RetentionReport>
where
    P: AsRef<Path>,
    F: Fn(&Path) -> std::io::Result<()>,
{
    let config = RetentionConfig { max_age_days };
    let runs = list_backup_runs(root.as_ref())
        .with_msg(format!("Listing backup runs in {:?} failed", root.as_ref()))?;

    let mut report = RetentionReport::default();
    for to_delete in config.get_delete(runs, now) {
        let path = to_delete.item;
        match remove(&path) {
            Ok(()) => {
                tracing::info!(target: AUDIT, "Removed out of retention backup {:?} (modified {})", path, to_delete.date_time);
                report.deleted.push(path);
            }
            Err(e) => {
                tracing::warn!("Removing out of retention backup {:?} failed: {e}", path);
                report.failed.push((path, e.into()));
            }
        }
    }
    Ok(report)
}
