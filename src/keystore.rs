//! RSA private keys on disk, PEM-encoded as PKCS#1 (`RSA PRIVATE KEY`).

use crate::crypto::SignatureError;
use crate::crypto::asymmetric::{RSA_PRIVATE_KEY_TAG, RsaKeyPair};
use crate::util::{KEY_FILE_MODE, write_file_with_mode};
use pem::{EncodeConfig, LineEnding};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file {0} does not exist")]
    NotFound(PathBuf),
    #[error("key file {0} does not contain a valid RSA private key: {1}")]
    InvalidKey(PathBuf, String),
    #[error("I/O error on key file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("generating a new key failed: {0}")]
    Generation(#[source] SignatureError),
}

/// Loads the PKCS#1 RSA key stored at `path`.
pub fn load(path: &Path) -> Result<RsaKeyPair, KeyError> {
    let pem_bytes = std::fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => KeyError::NotFound(path.to_path_buf()),
        _ => KeyError::Io(path.to_path_buf(), e),
    })?;
    let pem = pem::parse(&pem_bytes).map_err(|e| KeyError::InvalidKey(path.to_path_buf(), e.to_string()))?;
    if pem.tag() != RSA_PRIVATE_KEY_TAG {
        return Err(KeyError::InvalidKey(
            path.to_path_buf(),
            format!("unexpected PEM block {}", pem.tag()),
        ));
    }
    RsaKeyPair::from_pkcs1(pem.contents()).map_err(|e| KeyError::InvalidKey(path.to_path_buf(), e.to_string()))
}

/// Generates a fresh RSA-2048 key and writes it to `path`, readable only by the owner.
pub fn generate(path: &Path) -> Result<RsaKeyPair, KeyError> {
    let keypair = RsaKeyPair::generate().map_err(KeyError::Generation)?;
    let pem = keypair.to_pkcs1_pem().map_err(KeyError::Generation)?;
    let encoded = pem::encode_config(&pem, EncodeConfig::new().set_line_ending(LineEnding::LF));
    write_file_with_mode(path, KEY_FILE_MODE, encoded.as_bytes()).map_err(|e| KeyError::Io(path.to_path_buf(), e))?;
    debug!("Generated new RSA key at {}", path.display());
    Ok(keypair)
}

/// Loads the key at `path`, generating one if there is none yet. The flag tells whether the key was just created.
pub fn load_or_generate(path: &Path) -> Result<(RsaKeyPair, bool), KeyError> {
    match load(path) {
        Ok(keypair) => Ok((keypair, false)),
        Err(KeyError::NotFound(_)) => Ok((generate(path)?, true)),
        Err(e) => Err(e),
    }
}
