use crate::backup::result_error::result::Result;
use derive_more::{Display, From};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// BLAKE3 digest of a file's content, displayed as lowercase hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, From)]
#[display("{}", _0.to_hex())]
pub struct Checksum(blake3::Hash);

impl FromStr for Checksum {
    type Err = blake3::HexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        blake3::Hash::from_hex(s).map(Checksum)
    }
}

/// Streams `path` through BLAKE3 in 64KB chunks.
pub fn checksum<P: AsRef<Path>>(path: P) -> Result<Checksum> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}
