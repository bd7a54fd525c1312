use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod asymmetric;
pub mod jws;

pub const SHA256_LENGTH: usize = 32;

/// Computes the SHA2-256 digest over the provided byte slice.
pub fn sha256(input: &[u8]) -> [u8; SHA256_LENGTH] {
    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input);
    let mut hash = [0; SHA256_LENGTH];
    hash.copy_from_slice(digest.as_ref());
    hash
}

#[derive(Debug)]
pub enum SignatureError {
    Serialization(serde_json::Error),
    SignatureGeneration(&'static str),
    EncodingFailed(&'static str),
    InvalidKey(&'static str),
}

impl Error for SignatureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SignatureError::Serialization(ser) => ser.source(),
            SignatureError::EncodingFailed(_)
            | SignatureError::SignatureGeneration(_)
            | SignatureError::InvalidKey(_) => None,
        }
    }
}

impl Display for SignatureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            SignatureError::Serialization(e) => write!(f, "JSON encoding failed: {e}"),
            SignatureError::EncodingFailed(msg)
            | SignatureError::SignatureGeneration(msg)
            | SignatureError::InvalidKey(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

impl From<serde_json::Error> for SignatureError {
    fn from(e: serde_json::Error) -> Self {
        SignatureError::Serialization(e)
    }
}
