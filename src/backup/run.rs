//! One backup invocation, from lock acquisition to retention.

use crate::backup::backup_config::BackupConfig;
use crate::backup::copy::copy_verified;
use crate::backup::encrypt::key::EncryptionKey;
use crate::backup::manifest::{BackupRecord, Manifest};
use crate::backup::permissions::restrict_permissions;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention::{enforce_retention, RetentionReport};
use crate::backup::tar::{archive_and_encrypt, restore_archive};
use crate::backup::validate::validate_paths;
use crate::backup::AUDIT;
use bon::Builder;
use chrono::{DateTime, NaiveDateTime, Utc};
use getset::Getters;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub const RUN_DIR_PREFIX: &str = "backup-";
static RUN_DIR_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

pub const EXIT_OK: u8 = 0;
pub const EXIT_COPY_FAILURES: u8 = 1;
pub const EXIT_FATAL: u8 = 2;

/// Identity of one run: its start time and `out_dir/backup-<timestamp>`.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct BackupRun {
    started_at: DateTime<Utc>,
    dir: PathBuf,
}

impl BackupRun {
    pub fn new<P: AsRef<Path>>(out_dir: P, started_at: DateTime<Utc>) -> Self {
        Self {
            dir: out_dir.as_ref().join(Self::dir_name(started_at)),
            started_at,
        }
    }

    pub fn dir_name(started_at: DateTime<Utc>) -> String {
        format!("{RUN_DIR_PREFIX}{}", started_at.format(RUN_DIR_TIME_FORMAT))
    }

    pub fn is_run_dir_name(name: &str) -> bool {
        name.strip_prefix(RUN_DIR_PREFIX)
            .is_some_and(|ts| NaiveDateTime::parse_from_str(ts, RUN_DIR_TIME_FORMAT).is_ok())
    }

    /// Creates the run directory. Fails if it already exists.
    pub fn create(&self) -> Result<()> {
        DirBuilder::new().mode(0o700).create(&self.dir)?;
        Ok(())
    }

    /// Where `source` lands inside the run: its absolute path re-rooted at the run dir.
    pub fn destination_for<P: AsRef<Path>>(&self, source: P) -> PathBuf {
        source
            .as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .fold(self.dir.clone(), |acc, c| acc.join(c))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum RunState {
    Init,
    LockAcquired,
    Validated,
    Scoped,
    Copying,
    Archiving,
    RetentionApplied,
    Done,
    Failed,
}

/// What a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub records: Vec<BackupRecord>,
    pub encrypted: Vec<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub retention: RetentionReport,
}

impl RunSummary {
    pub fn success_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_verified()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.records.len() - self.success_count()
    }

    pub fn is_success(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            EXIT_OK
        } else {
            EXIT_COPY_FAILURES
        }
    }
}

#[derive(Builder)]
pub struct Orchestrator {
    config: BackupConfig,
    pool: Arc<ThreadPool>,
    /// Install SIGINT/SIGTERM/SIGHUP handlers that release the lock and exit
    #[builder(default = true)]
    release_on_signal: bool,
}

impl Orchestrator {
    /// Runs one backup. Errors returned here are fatal to the run; per-file
    /// and per-directory failures are reported through [`RunSummary`].
    pub fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut state = RunState::Init;
        tracing::info!(target: AUDIT, "Backup run starting into {:?}", self.config.out_dir());

        let result = self.run_from(started_at, &mut state);
        match &result {
            Ok(summary) => tracing::info!(
                target: AUDIT,
                "Backup run {:?} finished: {} succeeded, {} failed",
                summary.run_dir,
                summary.success_count(),
                summary.fail_count()
            ),
            Err(e) => {
                tracing::error!(target: AUDIT, "Backup run failed in state {state}: {e}");
                state = RunState::Failed;
                tracing::debug!("Run state: {state}");
            }
        }
        result
    }

    fn advance(state: &mut RunState, next: RunState) {
        tracing::debug!("Run state: {} -> {}", state, next);
        *state = next;
    }

    fn run_from(&self, started_at: DateTime<Utc>, state: &mut RunState) -> Result<RunSummary> {
        let config = &self.config;
        let mut lock = config
            .lock_manager()
            .acquire(config.lock_timeout())
            .with_msg("Acquire backup lock failed")?;
        if self.release_on_signal {
            lock.release_on_signal()?;
        }
        Self::advance(state, RunState::LockAcquired);

        validate_paths(config.sources()).with_msg("Source validation failed")?;
        Self::advance(state, RunState::Validated);

        let files = config.scope_rules().resolve_scope(config.sources())?;
        Self::advance(state, RunState::Scoped);

        let run = BackupRun::new(config.out_dir(), started_at);
        run.create()
            .with_msg(format!("Create run directory {:?} failed", run.dir()))?;
        Self::advance(state, RunState::Copying);
        let records = self.copy_all(&run, &files);
        if let Err(e) = restrict_permissions(run.dir()) {
            tracing::warn!("Restricting permissions under {:?} failed: {e}", run.dir());
        }

        Self::advance(state, RunState::Archiving);
        let encrypted = self.encrypt_sensitive(&run);
        let manifest = self.write_manifest(&run, &records, &encrypted);

        let retention = match enforce_retention(config.out_dir(), config.retention_days()) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Retention skipped: {e}");
                RetentionReport::default()
            }
        };
        Self::advance(state, RunState::RetentionApplied);

        if let Err(e) = lock.release() {
            tracing::error!("Release lock {:?} failed: {e}", lock.path());
        }
        Self::advance(state, RunState::Done);

        Ok(RunSummary {
            run_dir: run.dir().clone(),
            records,
            encrypted,
            manifest,
            retention,
        })
    }

    fn copy_all(&self, run: &BackupRun, files: &[PathBuf]) -> Vec<BackupRecord> {
        self.pool.install(|| {
            files
                .par_iter()
                .map(|src| {
                    let dst = run.destination_for(src);
                    match copy_verified(src, &dst) {
                        Ok(checksum) => BackupRecord::verified(src.clone(), dst, checksum),
                        Err(e) => {
                            tracing::error!("{e}");
                            BackupRecord::failed(src.clone(), dst, &e)
                        }
                    }
                })
                .collect()
        })
    }

    /// Archives each sensitive directory from its live location into the run
    /// and encrypts it. These directories are pruned from the copy, so the
    /// encrypted archive is their only form in the run.
    fn encrypt_sensitive(&self, run: &BackupRun) -> Vec<PathBuf> {
        let sensitive = self.config.sensitive();
        if sensitive.is_empty() {
            return vec![];
        }
        let key = match EncryptionKey::load_or_generate(self.config.state_dir()) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Encryption key unavailable, sensitive directories skipped: {e}");
                return vec![];
            }
        };

        sensitive
            .iter()
            .filter_map(
                |dir| match archive_and_encrypt(dir, run.dir(), &key, self.config.compressor()) {
                    Ok(encrypted) => Some(encrypted),
                    Err(e) => {
                        tracing::warn!("Encrypting sensitive directory {:?} failed: {e}", dir);
                        None
                    }
                },
            )
            .collect()
    }

    fn write_manifest(
        &self,
        run: &BackupRun,
        records: &[BackupRecord],
        encrypted: &[PathBuf],
    ) -> Option<PathBuf> {
        if !self.config.write_manifest() {
            return None;
        }
        let manifest = Manifest::new(
            *run.started_at(),
            run.dir().clone(),
            records.to_vec(),
            encrypted.to_vec(),
        );
        match manifest.write(run.dir()) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Writing manifest for {:?} failed: {e}", run.dir());
                None
            }
        }
    }
}

/// Unpacks an encrypted archive using the key under the configured state dir.
pub fn restore<P1: AsRef<Path>, P2: AsRef<Path>>(
    config: &BackupConfig,
    archive: P1,
    into: P2,
) -> Result<()> {
    let key_path = EncryptionKey::key_path(config.state_dir());
    let key = EncryptionKey::load(&key_path).with_msg(format!("Load key {:?} failed", key_path))?;
    restore_archive(archive.as_ref(), into.as_ref(), &key)
        .with_msg(format!("Restore {:?} failed", archive.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::checksum::checksum;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::lock::LOCK_FILE_NAME;
    use crate::backup::manifest::RecordStatus;
    use crate::backup::test_util::{test_dir, write_file};
    use chrono::TimeZone;
    use rayon::ThreadPoolBuilder;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self { dir: test_dir() }
        }

        fn source(&self) -> PathBuf {
            self.dir.path().join("source")
        }

        fn out(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn lock_dir(&self) -> PathBuf {
            self.dir.path().join("lock")
        }

        fn config(&self, sources: Vec<PathBuf>, sensitive: Vec<PathBuf>) -> BackupConfig {
            fs::create_dir_all(self.out()).unwrap();
            fs::create_dir_all(self.lock_dir()).unwrap();
            BackupConfig::builder()
                .out_dir(self.out())
                .sources(sources)
                .sensitive(sensitive)
                .lock_dir(self.lock_dir())
                .state_dir(self.dir.path().join("state"))
                .lock_timeout(Duration::from_millis(200))
                .lock_poll_interval(Duration::from_millis(20))
                .compressor(CompressorConfig::None)
                .build()
        }

        fn orchestrator(&self, config: BackupConfig) -> Orchestrator {
            let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
            Orchestrator::builder()
                .config(config)
                .pool(Arc::new(pool))
                .release_on_signal(false)
                .build()
        }

        fn run_dirs(&self) -> Vec<PathBuf> {
            fs::read_dir(self.out())
                .unwrap()
                .map(|e| e.unwrap().path())
                .filter(|p| p.is_dir())
                .collect()
        }
    }

    #[test]
    fn test_run_dir_name() {
        let started_at = Utc.with_ymd_and_hms(2025, 8, 1, 13, 5, 9).unwrap();
        let run = BackupRun::new("/b", started_at);
        assert_eq!(run.dir(), &PathBuf::from("/b/backup-20250801-130509"));

        assert!(BackupRun::is_run_dir_name("backup-20250801-130509"));
        assert!(!BackupRun::is_run_dir_name("backup-latest"));
        assert!(!BackupRun::is_run_dir_name("snapshot-20250801-130509"));
        assert!(!BackupRun::is_run_dir_name("backup-20251301-000000"));
    }

    #[test]
    fn test_destination_rerooted_under_run_dir() {
        let run = BackupRun::new("/b", Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap());
        assert_eq!(
            run.destination_for("/home/alice/a.txt"),
            PathBuf::from("/b/backup-20250801-000000/home/alice/a.txt")
        );
    }

    #[test]
    fn test_transient_files_excluded_and_copies_verified() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        write_file(source.join("b.tmp"), "scratch");

        let summary = fixture
            .orchestrator(fixture.config(vec![source.clone()], vec![]))
            .run()
            .unwrap();

        let run = BackupRun {
            started_at: Utc::now(),
            dir: summary.run_dir.clone(),
        };
        let copied = run.destination_for(source.join("a.txt"));
        assert_eq!(
            checksum(&copied).unwrap(),
            checksum(source.join("a.txt")).unwrap()
        );
        assert!(!run.destination_for(source.join("b.tmp")).exists());
        assert_eq!(summary.success_count(), 1);
        assert_eq!(summary.exit_code(), EXIT_OK);
        assert!(!fixture.lock_dir().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_copies_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        fs::set_permissions(source.join("a.txt"), fs::Permissions::from_mode(0o644)).unwrap();

        let summary = fixture
            .orchestrator(fixture.config(vec![source.clone()], vec![]))
            .run()
            .unwrap();

        let copied = &summary.records[0].destination;
        let mode = fs::metadata(copied).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_manifest_lists_records() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        write_file(source.join("nested/b.txt"), "beta");

        let summary = fixture
            .orchestrator(fixture.config(vec![source.clone()], vec![]))
            .run()
            .unwrap();

        let manifest = Manifest::read(&summary.run_dir).unwrap();
        assert_eq!(Some(Manifest::path(&summary.run_dir)), summary.manifest);
        assert_eq!(manifest.success_count, 2);
        assert_eq!(manifest.fail_count, 0);
        assert_eq!(manifest.records[0].source, source.join("a.txt"));
        assert_eq!(manifest.records[1].source, source.join("nested/b.txt"));
        assert!(manifest
            .records
            .iter()
            .all(|r| r.status == RecordStatus::Verified));
    }

    #[test]
    fn test_sensitive_dir_becomes_single_encrypted_archive() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        let secrets = source.join("secrets");
        write_file(secrets.join("password.txt"), "hunter22");
        write_file(secrets.join(".env"), "TOKEN=abc");

        let summary = fixture
            .orchestrator(fixture.config(vec![source.clone()], vec![secrets.clone()]))
            .run()
            .unwrap();

        let archive = summary.run_dir.join("secrets.tar.enc");
        assert_eq!(summary.encrypted, vec![archive.clone()]);
        let artifacts: Vec<_> = fs::read_dir(&summary.run_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tar"))
            .collect();
        assert_eq!(artifacts, vec!["secrets.tar.enc"]);

        let run = BackupRun {
            started_at: Utc::now(),
            dir: summary.run_dir.clone(),
        };
        assert!(!run.destination_for(&secrets).exists());
        assert!(run.destination_for(source.join("a.txt")).exists());
        assert_eq!(
            fs::read_to_string(secrets.join("password.txt")).unwrap(),
            "hunter22"
        );

        let config = fixture.config(vec![source.clone()], vec![]);
        let restored = fixture.dir.path().join("restored");
        restore(&config, &archive, &restored).unwrap();
        assert_eq!(
            fs::read_to_string(restored.join("secrets/password.txt")).unwrap(),
            "hunter22"
        );
        assert_eq!(
            fs::read_to_string(restored.join("secrets/.env")).unwrap(),
            "TOKEN=abc"
        );
        assert!(summary
            .records
            .iter()
            .all(|r| !r.source.starts_with(&secrets)));
    }

    #[test]
    fn test_sensitive_dir_outside_sources_archived_live() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        let secrets = fixture.dir.path().join("keys");
        write_file(secrets.join("id"), "private");

        let summary = fixture
            .orchestrator(fixture.config(vec![source], vec![secrets.clone()]))
            .run()
            .unwrap();

        assert_eq!(summary.encrypted, vec![summary.run_dir.join("keys.tar.enc")]);
        assert!(secrets.join("id").exists());
    }

    #[test]
    fn test_validation_failure_aborts_before_copy() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");

        let err = fixture
            .orchestrator(fixture.config(vec![source, fixture.dir.path().join("missing")], vec![]))
            .run()
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(fixture.run_dirs().is_empty());
        assert!(!fixture.lock_dir().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_held_lock_times_out() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        let config = fixture.config(vec![source], vec![]);
        let token = fixture.lock_dir().join(LOCK_FILE_NAME);
        fs::write(&token, std::process::id().to_string()).unwrap();

        let err = fixture.orchestrator(config).run().unwrap_err();

        assert!(err.is_fatal());
        assert!(err.to_string().contains("Timed out"));
        assert!(fixture.run_dirs().is_empty());
        assert!(token.exists());
    }

    #[test]
    fn test_backup_root_inside_source_not_copied() {
        let fixture = Fixture::new();
        let root = fixture.dir.path().to_path_buf();
        write_file(root.join("source/a.txt"), "alpha");
        write_file(fixture.out().join("backup-20000101-000000/old.txt"), "old");

        let summary = fixture
            .orchestrator(fixture.config(vec![root.join("source"), fixture.out()], vec![]))
            .run()
            .unwrap();

        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].source, root.join("source/a.txt"));
    }

    #[test]
    fn test_old_runs_do_not_use_up_file_limit() {
        let fixture = Fixture::new();
        let home = fixture.source();
        let out = home.join("aaa_backups");
        for i in 0..5 {
            write_file(out.join(format!("backup-20000101-00000{i}/old.txt")), "old");
        }
        write_file(home.join("data/real.txt"), "real");
        fs::create_dir_all(fixture.lock_dir()).unwrap();

        let config = BackupConfig::builder()
            .out_dir(out)
            .sources(vec![home.clone()])
            .lock_dir(fixture.lock_dir())
            .state_dir(fixture.dir.path().join("state"))
            .lock_poll_interval(Duration::from_millis(20))
            .max_files(3)
            .compressor(CompressorConfig::None)
            .build();
        let summary = fixture.orchestrator(config).run().unwrap();

        let sources: Vec<_> = summary.records.iter().map(|r| &r.source).collect();
        assert_eq!(sources, vec![&home.join("data/real.txt")]);
        assert_eq!(summary.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_old_runs_pruned() {
        let fixture = Fixture::new();
        let source = fixture.source();
        write_file(source.join("a.txt"), "alpha");
        let old = fixture.out().join("backup-20000101-000000");
        write_file(old.join("x"), "x");
        filetime::set_file_mtime(&old, filetime::FileTime::from_unix_time(946_684_800, 0))
            .unwrap();

        let summary = fixture
            .orchestrator(fixture.config(vec![source], vec![]))
            .run()
            .unwrap();

        assert_eq!(summary.retention.deleted, vec![old.clone()]);
        assert!(!old.exists());
        assert!(summary.run_dir.exists());
    }

    #[test]
    fn test_exit_code_reflects_failures() {
        let ok = BackupRecord {
            source: "/s/a".into(),
            destination: "/d/a".into(),
            checksum: None,
            status: RecordStatus::Verified,
        };
        let failed = BackupRecord {
            status: RecordStatus::CopyFailed,
            ..ok.clone()
        };
        let summary = |records| RunSummary {
            run_dir: "/d".into(),
            records,
            encrypted: vec![],
            manifest: None,
            retention: RetentionReport::default(),
        };

        assert_eq!(summary(vec![ok.clone()]).exit_code(), EXIT_OK);
        let mixed = summary(vec![ok, failed]);
        assert_eq!(mixed.success_count(), 1);
        assert_eq!(mixed.fail_count(), 1);
        assert_eq!(mixed.exit_code(), EXIT_COPY_FAILURES);
    }
}
