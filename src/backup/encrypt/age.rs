use crate::backup::encrypt::key::EncryptionKey;
use crate::backup::encrypt::{DecryptorBuilder, EncryptorBuilder};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use age::secrecy::SecretString;
use age::stream::{StreamReader, StreamWriter};
use std::io::{Read, Write};

impl EncryptionKey {
    fn secret(&self) -> SecretString {
        SecretString::from(self.expose().to_string())
    }
}

impl<W: Write> EncryptorBuilder<W> for EncryptionKey {
    /// Streams through age's passphrase recipient: a random salt, file key
    /// and payload nonce are drawn for every call.
    fn build_encryptor(&self, writer: W) -> Result<StreamWriter<W>> {
        tracing::debug!("Initializing Age encryption with persisted key");
        age::Encryptor::with_user_passphrase(self.secret())
            .wrap_output(writer)
            .map_err(Error::from)
            .with_msg("Initializing Age encryption failed")
    }
}

impl<R: Read> DecryptorBuilder<R> for EncryptionKey {
    fn build_decryptor(&self, reader: R) -> Result<StreamReader<R>> {
        let identity = age::scrypt::Identity::new(self.secret());
        let decryptor = age::Decryptor::new(reader)?;
        Ok(decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?)
    }
}
