pub mod age;
pub mod key;

use crate::backup::result_error::result::Result;
use ::age::stream::{StreamReader, StreamWriter};
use std::io::{Read, Write};

pub const ENCRYPTED_FILE_EXT: &str = "enc";

pub trait EncryptorBuilder<W: Write> {
    fn build_encryptor(&self, writer: W) -> Result<StreamWriter<W>>;
}

pub trait DecryptorBuilder<R: Read> {
    fn build_decryptor(&self, reader: R) -> Result<StreamReader<R>>;
}
