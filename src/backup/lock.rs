use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::AUDIT;
use bon::Builder;
use getset::Getters;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::fmt::{Debug, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const LOCK_FILE_NAME: &str = "vbackup.lock";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    Released,
}

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct LockManager {
    #[builder(into)]
    path: PathBuf,
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    poll_interval: Duration,
}

impl LockManager {
    pub fn in_dir<P: AsRef<Path>>(lock_dir: P, poll_interval: Duration) -> Self {
        Self::builder()
            .path(lock_dir.as_ref().join(LOCK_FILE_NAME))
            .poll_interval(poll_interval)
            .build()
    }

    /// Polls until no live token exists, then writes ours.
    ///
    /// Fails with [`Error::LockTimeout`] once a token has been observed for
    /// the whole of `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<LockHandle> {
        tracing::debug!("Lock {:?}: {} -> {}", self.path, LockState::Unlocked, LockState::Acquiring);
        let start = Instant::now();
        loop {
            if self.try_create_token()? {
                tracing::info!(target: AUDIT, "Acquired lock {:?} (pid {})", self.path, std::process::id());
                return Ok(LockHandle {
                    path: self.path.clone(),
                    state: LockState::Held,
                    signals: None,
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::error!("Lock {:?} still held after {:?}", self.path, waited);
                return Err(Error::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            tracing::info!("Lock {:?} is held by another run, waiting", self.path);
            std::thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    /// Removes the token whether or not this process holds it.
    pub fn release(&self) -> Result<()> {
        release_lock_file(&self.path)
    }

    /// Returns `Ok(true)` when our token was written.
    fn try_create_token(&self) -> Result<bool> {
        self.try_create_token_with(|f| {
            writeln!(f, "{}", std::process::id())?;
            f.sync_all()
        })
    }

    /// A token whose contents could not be written is removed again.
    fn try_create_token_with<W>(&self, write_pid: W) -> Result<bool>
    where
        W: FnOnce(&mut File) -> std::io::Result<()>,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                if let Err(e) = write_pid(&mut f) {
                    drop(f);
                    if let Err(remove_err) = release_lock_file(&self.path) {
                        tracing::error!("Removing half-written lock {:?} failed: {remove_err}", self.path);
                    }
                    return Err(e.into());
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self.remove_if_stale(),
            Err(e) => Err(e.into()),
        }
    }

    /// A token naming a dead process is removed so the next poll can take over.
    /// So is an empty token older than one poll interval: its writer died
    /// before recording a pid.
    fn remove_if_stale(&self) -> Result<bool> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.try_create_token(),
            Err(e) => return Err(e.into()),
        };

        let text = text.trim();
        if text.is_empty() {
            if !self.older_than_poll_interval()? {
                return Ok(false);
            }
            tracing::warn!("Removing empty stale lock {:?}", self.path);
            release_lock_file(&self.path)?;
            return self.try_create_token();
        }

        match text.parse::<u32>().ok() {
            Some(pid) if !process_alive(pid) => {
                tracing::warn!("Removing stale lock {:?} left by pid {}", self.path, pid);
                release_lock_file(&self.path)?;
                self.try_create_token()
            }
            _ => Ok(false),
        }
    }

    fn older_than_poll_interval(&self) -> Result<bool> {
        let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let age = modified.elapsed().unwrap_or(Duration::ZERO);
        Ok(age > self.poll_interval)
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Idempotent token removal, shared by [`LockHandle`] and the signal thread.
pub fn release_lock_file<P: AsRef<Path>>(path: P) -> Result<()> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => {
            tracing::info!(target: AUDIT, "Released lock {:?}", path.as_ref());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A held lock. The token is removed on [`LockHandle::release`] or drop.
pub struct LockHandle {
    path: PathBuf,
    state: LockState,
    signals: Option<Handle>,
}

impl Debug for LockHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("release_on_signal", &self.signals.is_some())
            .finish()
    }
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// Releases the token and exits with `128 + signal` on SIGINT, SIGTERM or SIGHUP.
    pub fn release_on_signal(&mut self) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        self.signals = Some(signals.handle());
        let path = self.path.clone();
        std::thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::warn!("Received signal {signal}, releasing lock and exiting");
                if let Err(e) = release_lock_file(&path) {
                    tracing::error!("Release lock on signal failed: {e}");
                }
                std::process::exit(128 + signal);
            }
        });
        Ok(())
    }

    pub fn release(&mut self) -> Result<()> {
        if let Some(signals) = self.signals.take() {
            signals.close();
        }
        if self.state == LockState::Released {
            return Ok(());
        }
        self.state = LockState::Released;
        release_lock_file(&self.path)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("Release lock {:?} failed: {e}", self.path);
        }
    }
}
