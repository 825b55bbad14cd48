use crate::backup::compress::{open_decompressor, CompressorBuilder, CompressorConfig};
use crate::backup::encrypt::key::EncryptionKey;
use crate::backup::encrypt::{DecryptorBuilder, EncryptorBuilder, ENCRYPTED_FILE_EXT};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::AUDIT;
use sanitize_filename::sanitize;
use std::fs::File;
use std::io::{BufReader, BufWriter, IntoInnerError};
use std::path::{Path, PathBuf};

/// Paths produced for one sensitive directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivePaths {
    pub plaintext: PathBuf,
    pub encrypted: PathBuf,
}

impl ArchivePaths {
    pub fn new<P: AsRef<Path>>(out_dir: P, name: &str, compressor: &CompressorConfig) -> Self {
        let tar_name = match compressor.file_ext() {
            Some(ext) => format!("{name}.tar.{ext}"),
            None => format!("{name}.tar"),
        };
        Self {
            plaintext: out_dir.as_ref().join(tar_name),
            encrypted: out_dir
                .as_ref()
                .join(format!("{name}.tar.{ENCRYPTED_FILE_EXT}")),
        }
    }
}

/// Archive base name derived from the directory's final component.
pub fn archive_name<P: AsRef<Path>>(directory: P) -> String {
    let name = directory
        .as_ref()
        .file_name()
        .map(|n| sanitize(n.to_string_lossy()))
        .unwrap_or_default();
    if name.is_empty() {
        "root".to_string()
    } else {
        name
    }
}

/// Writes a compressed tar of `directory` to `path`.
pub fn create_tar_archive<P1: AsRef<Path>, P2: AsRef<Path>>(
    directory: P1,
    path: P2,
    compressor: &CompressorConfig,
) -> Result<()> {
    let directory = directory.as_ref();
    let file = File::create_new(path.as_ref())?;
    let mut writer = compressor
        .build_compressor(BufWriter::new(file))
        .map(BufWriter::new)
        .map(tar::Builder::new)?;
    writer.follow_symlinks(false);
    writer.append_dir_all(archive_name(directory), directory)?;

    writer
        .into_inner()?
        .into_inner()
        .map_err(IntoInnerError::into_error)?
        .finish()?
        .into_inner()
        .map_err(IntoInnerError::into_error)?
        .sync_all()?;

    tracing::info!("Archived {:?} into {:?}", directory, path.as_ref());
    Ok(())
}

/// Encrypts `plaintext` into `encrypted` through a temp file and rename.
pub fn encrypt_file<P1: AsRef<Path>, P2: AsRef<Path>>(
    plaintext: P1,
    encrypted: P2,
    key: &EncryptionKey,
) -> Result<()> {
    let encrypted = encrypted.as_ref();
    let parent = encrypted.parent().unwrap_or(Path::new("."));
    let file_name = encrypted
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(&format!(".{}.tmp", std::process::id()))
        .tempfile_in(parent)?;

    let mut reader = BufReader::new(File::open(plaintext.as_ref())?);
    let mut writer = key
        .build_encryptor(BufWriter::new(tmp.as_file_mut()))
        .map(BufWriter::new)?;
    std::io::copy(&mut reader, &mut writer)?;
    writer
        .into_inner()
        .map_err(IntoInnerError::into_error)?
        .finish()?
        .into_inner()
        .map_err(IntoInnerError::into_error)?;
    tmp.as_file().sync_all()?;

    tmp.persist(encrypted).map_err(|e| Error::from(e.error))?;
    Ok(())
}

/// Archives and encrypts `directory` into `out_dir/<name>.tar.enc`.
///
/// The plaintext archive is removed only after the encrypted file has been
/// published. On failure it is left in place and the error says where.
/// `directory` itself is never modified.
pub fn archive_and_encrypt<P1: AsRef<Path>, P2: AsRef<Path>>(
    directory: P1,
    out_dir: P2,
    key: &EncryptionKey,
    compressor: &CompressorConfig,
) -> Result<PathBuf> {
    let directory = directory.as_ref();
    let paths = ArchivePaths::new(out_dir, &archive_name(directory), compressor);

    if let Err(mut e) = create_tar_archive(directory, &paths.plaintext, compressor) {
        match std::fs::remove_file(&paths.plaintext) {
            Ok(()) => {}
            Err(e2) if e2.kind() == std::io::ErrorKind::NotFound => {}
            Err(e2) => e = e.chain(e2.into()),
        }
        return Err(e.with_msg(format!("Archiving {:?} failed", directory)));
    }

    encrypt_file(&paths.plaintext, &paths.encrypted, key).with_msg(format!(
        "Encrypting {:?} failed, plaintext archive kept at {:?}",
        paths.plaintext, paths.plaintext
    ))?;

    std::fs::remove_file(&paths.plaintext)
        .map_err(Error::from)
        .with_msg(format!("Removing plaintext archive {:?} failed", paths.plaintext))?;

    tracing::info!(target: AUDIT, "Encrypted {:?} into {:?}", directory, paths.encrypted);
    Ok(paths.encrypted)
}

/// Decrypts, decompresses and unpacks an encrypted archive into `into`.
pub fn restore_archive<P1: AsRef<Path>, P2: AsRef<Path>>(
    encrypted: P1,
    into: P2,
    key: &EncryptionKey,
) -> Result<()> {
    let reader = BufReader::new(File::open(encrypted.as_ref())?);
    let decrypted = key.build_decryptor(reader)?;
    let decompressed = open_decompressor(decrypted)?;
    std::fs::create_dir_all(into.as_ref())?;
    tar::Archive::new(decompressed).unpack(into.as_ref())?;
    tracing::info!("Restored {:?} into {:?}", encrypted.as_ref(), into.as_ref());
    Ok(())
}
