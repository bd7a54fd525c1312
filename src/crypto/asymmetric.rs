use crate::crypto::SignatureError;
use crate::crypto::jws::{Algorithm, JsonWebKeyRsa};
use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::rsa::KeySize;
use aws_lc_rs::signature;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use pem::Pem;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use std::fmt::{Debug, Formatter};

/// All keys we create (account and certificate keys) are RSA-2048
pub const RSA_KEY_SIZE: KeySize = KeySize::Rsa2048;
/// PEM label of a PKCS#1 `RSAPrivateKey` structure
pub const RSA_PRIVATE_KEY_TAG: &str = "RSA PRIVATE KEY";
const PKCS8_PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// An RSA private key.
///
/// The key is held by aws-lc-rs for signing. The PKCS#8 encoding is kept alongside, because on disk we
/// store the traditional PKCS#1 form, which aws-lc-rs can't produce.
pub struct RsaKeyPair {
    keypair: signature::RsaKeyPair,
    pkcs8: Vec<u8>,
}

impl Debug for RsaKeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Never print private key material
        f.debug_struct("RsaKeyPair")
            .field("modulus_bits", &(self.keypair.public_modulus_len() * 8))
            .finish_non_exhaustive()
    }
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self, SignatureError> {
        let keypair = signature::RsaKeyPair::generate(RSA_KEY_SIZE)
            .map_err(|_| SignatureError::SignatureGeneration("Could not generate RSA key"))?;
        let pkcs8 = keypair
            .as_der()
            .map_err(|_| SignatureError::EncodingFailed("Serializing RSA keypair failed"))?;
        let pkcs8 = pkcs8.as_ref().to_vec();
        Ok(Self { keypair, pkcs8 })
    }

    pub fn from_pkcs8(der: &[u8]) -> Result<Self, SignatureError> {
        let keypair = signature::RsaKeyPair::from_pkcs8(der)
            .map_err(|_| SignatureError::InvalidKey("RSA private key is corrupted or invalid"))?;
        Ok(Self {
            keypair,
            pkcs8: der.to_vec(),
        })
    }

    pub fn from_pkcs1(der: &[u8]) -> Result<Self, SignatureError> {
        let key = rsa::RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|_| SignatureError::InvalidKey("PKCS#1 RSA private key could not be decoded"))?;
        let pkcs8 = key
            .to_pkcs8_der()
            .map_err(|_| SignatureError::EncodingFailed("Converting RSA key to PKCS#8 failed"))?;
        Self::from_pkcs8(pkcs8.as_bytes())
    }

    /// Encodes the key as PKCS#1 PEM (`RSA PRIVATE KEY`)
    pub fn to_pkcs1_pem(&self) -> Result<Pem, SignatureError> {
        let key = rsa::RsaPrivateKey::from_pkcs8_der(&self.pkcs8)
            .map_err(|_| SignatureError::EncodingFailed("Decoding PKCS#8 RSA key failed"))?;
        let der = key
            .to_pkcs1_der()
            .map_err(|_| SignatureError::EncodingFailed("Serializing RSA keypair failed"))?;
        Ok(Pem::new(RSA_PRIVATE_KEY_TAG, der.as_bytes()))
    }

    pub fn to_rcgen_keypair(&self) -> anyhow::Result<rcgen::KeyPair> {
        let pem = Pem::new(PKCS8_PRIVATE_KEY_TAG, self.pkcs8.as_slice());
        Ok(rcgen::KeyPair::from_pem(&pem::encode(&pem))?)
    }

    pub fn get_jws_algorithm(&self) -> Algorithm {
        Algorithm::RsaPkcs1Sha256
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let random = SystemRandom::new();
        let sig_len = self.keypair.public_modulus_len();
        let mut signature = vec![0; sig_len];
        self.keypair
            .sign(
                &signature::RSA_PKCS1_SHA256,
                &random,
                message,
                &mut signature,
            )
            .map_err(|_| SignatureError::SignatureGeneration("RSA signing failed"))?;
        Ok(signature)
    }

    pub fn to_jwk_parameters(&self) -> JsonWebKeyRsa {
        let public_key = signature::KeyPair::public_key(&self.keypair);
        let modulus = public_key.modulus();
        let exponent = public_key.exponent();
        let modulus = BASE64_URL_SAFE_NO_PAD.encode(modulus.big_endian_without_leading_zero());
        let exponent = BASE64_URL_SAFE_NO_PAD.encode(exponent.big_endian_without_leading_zero());
        JsonWebKeyRsa::new(modulus, exponent)
    }
}
