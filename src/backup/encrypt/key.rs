use crate::backup::redacted::RedactedString;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::AUDIT;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use validator::Validate;
use zeroize::Zeroize;

pub const KEY_FILE_NAME: &str = "encryption.key";
const KEY_BYTES: usize = 32;

/// Symmetric key material shared by every run. Created once, never rotated.
#[derive(Clone, Debug)]
pub struct EncryptionKey {
    secret: RedactedString,
}

impl EncryptionKey {
    pub fn key_path<P: AsRef<Path>>(state_dir: P) -> PathBuf {
        state_dir.as_ref().join(KEY_FILE_NAME)
    }

    /// Loads `state_dir/encryption.key`, generating it on first use.
    pub fn load_or_generate<P: AsRef<Path>>(state_dir: P) -> Result<Self> {
        let path = Self::key_path(&state_dir);
        match Self::load(&path) {
            Ok(key) => Ok(key),
            Err(crate::backup::result_error::error::Error::Io(e))
                if e.kind() == ErrorKind::NotFound =>
            {
                let key = Self::generate();
                key.persist(state_dir.as_ref())
                    .with_msg(format!("Persist key {:?} failed", path))?;
                tracing::info!(target: AUDIT, "Generated new encryption key {:?}", path);
                Ok(key)
            }
            Err(e) => Err(e.with_msg(format!("Load key {:?} failed", path))),
        }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let secret = RedactedString::from(hex::encode(bytes));
        bytes.zeroize();
        Self { secret }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        if metadata.permissions().mode() & 0o077 != 0 {
            tracing::warn!("Key file {:?} is accessible by others, restricting to owner", path);
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        let mut text = fs::read_to_string(path)?;
        let secret = RedactedString::from(text.trim().to_string());
        text.zeroize();
        secret.validate()?;
        Ok(Self { secret })
    }

    fn persist(&self, state_dir: &Path) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(state_dir)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(Self::key_path(state_dir))?;
        writeln!(file, "{}", self.secret.inner())?;
        file.sync_all()?;
        Ok(())
    }

    pub(crate) fn expose(&self) -> &str {
        self.secret.inner()
    }
}
