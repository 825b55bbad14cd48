//! # vbackup
//!
//! Host-local backups with checksum-verified copies, atomic commits,
//! encrypted archives for sensitive directories and age-based retention.
//!
//! ## Features
//!
//! - **Verified copies**: every file is written to a temporary sibling, checked
//!   with BLAKE3 and renamed into place only when the digests match
//! - **Single run at a time**: PID token lock with bounded wait, released on
//!   return, error and SIGINT/SIGTERM/SIGHUP
//! - **Sensitive directories**: tar + XZ, then Age encryption with a key
//!   generated on first use
//! - **Retention**: runs older than the window are removed
//! - **Manifest**: `manifest.json` per run listing every file and its digest
//!
//! ## Quick Start
//!
//! ```no_run
//! use vbackup::backup::backup_config::BackupConfig;
//! use vbackup::backup::run::Orchestrator;
//!
//! let config = BackupConfig::from_yaml_file("config.yml")?;
//! let pool = rayon::ThreadPoolBuilder::new().build()?;
//!
//! let summary = Orchestrator::builder()
//!     .config(config)
//!     .pool(std::sync::Arc::new(pool))
//!     .build()
//!     .run()?;
//! println!("{} succeeded, {} failed", summary.success_count(), summary.fail_count());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
