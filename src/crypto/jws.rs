use crate::acme::object::Nonce;
use crate::crypto::asymmetric::RsaKeyPair;
use crate::crypto::{SignatureError, sha256};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: Algorithm,
    #[serde(skip_serializing_if = "Nonce::is_empty")]
    pub nonce: Nonce,
    #[serde(rename = "url")]
    target_url: Url,
    #[serde(flatten)]
    key: KeyParameters,
}

impl ProtectedHeader {
    pub fn new(algorithm: Algorithm, nonce: Nonce, target_url: Url, key: KeyParameters) -> Self {
        Self {
            algorithm,
            nonce,
            target_url,
            key,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    #[serde(rename = "RS256")]
    RsaPkcs1Sha256,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum KeyParameters {
    #[serde(rename = "jwk")]
    FullKey(JsonWebKeyRsa),
    #[serde(rename = "kid")]
    AccountUrl(Url),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonWebKeyRsa {
    #[serde(rename = "kty")]
    key_type: &'static str,
    #[serde(rename = "n")]
    modulus: String,
    #[serde(rename = "e")]
    exponent: String,
}

impl JsonWebKeyRsa {
    pub fn new(modulus: String, exponent: String) -> Self {
        Self {
            key_type: "RSA",
            modulus,
            exponent,
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the required members in lexicographic order, without whitespace
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"e":"{}","kty":"{}","n":"{}"}}"#,
            self.exponent, self.key_type, self.modulus
        );
        BASE64_URL_SAFE_NO_PAD.encode(sha256(canonical.as_bytes()))
    }
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String, SignatureError> {
    Ok(BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

pub const EMPTY_PAYLOAD: Option<&()> = None;

/// An ACME account key, together with the way the CA knows it.
///
/// Before registration, requests carry the full public key (`jwk`). Afterwards, they carry the account URL (`kid`).
#[derive(Debug)]
pub struct JsonWebKey {
    keypair: RsaKeyPair,
    parameters: KeyParameters,
    thumbprint: String,
}

impl JsonWebKey {
    fn with_parameters(keypair: RsaKeyPair, account_url: Option<Url>) -> Self {
        let jwk = keypair.to_jwk_parameters();
        let thumbprint = jwk.thumbprint();
        let parameters = match account_url {
            Some(url) => KeyParameters::AccountUrl(url),
            None => KeyParameters::FullKey(jwk),
        };
        Self {
            keypair,
            parameters,
            thumbprint,
        }
    }

    /// A key not yet known to the CA
    pub fn new(keypair: RsaKeyPair) -> Self {
        Self::with_parameters(keypair, None)
    }

    pub fn new_existing(keypair: RsaKeyPair, url: Url) -> Self {
        Self::with_parameters(keypair, Some(url))
    }

    #[must_use]
    pub fn into_existing(self, account_url: Url) -> Self {
        Self::new_existing(self.keypair, account_url)
    }

    pub fn get_algorithm(&self) -> Algorithm {
        self.keypair.get_jws_algorithm()
    }

    pub fn get_parameters(&self) -> &KeyParameters {
        &self.parameters
    }

    pub fn account_url(&self) -> Option<&Url> {
        match &self.parameters {
            KeyParameters::AccountUrl(url) => Some(url),
            KeyParameters::FullKey(_) => None,
        }
    }

    pub fn sign<T: Serialize>(
        &self,
        header: &ProtectedHeader,
        payload: Option<&T>,
    ) -> Result<FlatJsonWebSignature, SignatureError> {
        let header = encode_json(header)?;
        let payload = payload.map(encode_json).transpose()?.unwrap_or_default();
        let signature = self.keypair.sign(format!("{header}.{payload}").as_bytes())?;
        let signature = BASE64_URL_SAFE_NO_PAD.encode(signature);
        Ok(FlatJsonWebSignature {
            header,
            payload,
            signature,
        })
    }

    pub fn get_acme_thumbprint(&self) -> &str {
        &self.thumbprint
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatJsonWebSignature {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

#[cfg(test)]
impl FlatJsonWebSignature {
    fn parse_base64_json(value: &str) -> anyhow::Result<serde_json::Value> {
        let raw_json = BASE64_URL_SAFE_NO_PAD.decode(value)?;
        Ok(serde_json::from_slice(&raw_json)?)
    }

    fn header_json(&self) -> anyhow::Result<serde_json::Value> {
        Self::parse_base64_json(&self.header)
    }

    fn payload_json(&self) -> anyhow::Result<serde_json::Value> {
        Self::parse_base64_json(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::asymmetric::tests::test_key;

    #[test]
    fn test_serialize_protected_header_with_rsa() {
        let header = ProtectedHeader {
            algorithm: Algorithm::RsaPkcs1Sha256,
            nonce: Nonce::try_from("QWERTZ".to_string()).unwrap(),
            target_url: Url::parse("https://example.com/protected-header-test").unwrap(),
            key: KeyParameters::FullKey(JsonWebKeyRsa::new(
                "longModulusIsTooLongForTestSoThisSubstitutesBase64".to_string(),
                "AQAB".to_string(),
            )),
        };
        let expected_header = r#"{
  "alg": "RS256",
  "nonce": "QWERTZ",
  "url": "https://example.com/protected-header-test",
  "jwk": {
    "kty": "RSA",
    "n": "longModulusIsTooLongForTestSoThisSubstitutesBase64",
    "e": "AQAB"
  }
}"#;
        let actual_header = serde_json::to_string_pretty(&header).unwrap();
        assert_eq!(
            expected_header, actual_header,
            "serialization failed, expected {expected_header}, got {actual_header}"
        );
    }

    #[test]
    fn test_serialize_protected_header_with_account_url() {
        let header = ProtectedHeader::new(
            Algorithm::RsaPkcs1Sha256,
            Nonce::new_empty(),
            Url::parse("https://example.com/new-order").unwrap(),
            KeyParameters::AccountUrl(Url::parse("https://example.com/acct/1").unwrap()),
        );
        let actual_header = serde_json::to_string(&header).unwrap();
        assert_eq!(
            actual_header,
            r#"{"alg":"RS256","url":"https://example.com/new-order","kid":"https://example.com/acct/1"}"#
        );
    }

    #[test]
    fn test_rfc7638_thumbprint() {
        // RFC 7638, section 3.1
        let parameters = JsonWebKeyRsa::new("0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_string(), "AQAB".to_string());
        assert_eq!(parameters.thumbprint(), "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs");
    }

    #[test]
    fn test_sign() -> anyhow::Result<()> {
        let key = JsonWebKey::new_existing(test_key(), Url::parse("https://example.com/acct/7")?);
        let header = ProtectedHeader::new(
            key.get_algorithm(),
            Nonce::try_from("abc".to_string())?,
            Url::parse("https://example.com/authz/1")?,
            key.get_parameters().clone(),
        );

        let signature = key.sign(&header, Some(&serde_json::json!({"status": "valid"})))?;

        let header = signature.header_json()?;
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "https://example.com/acct/7");
        assert_eq!(header["nonce"], "abc");
        assert_eq!(signature.payload_json()?["status"], "valid");
        Ok(())
    }

    #[test]
    fn test_sign_with_empty_payload() -> anyhow::Result<()> {
        let key = JsonWebKey::new(test_key());
        let header = ProtectedHeader::new(
            key.get_algorithm(),
            Nonce::new_empty(),
            Url::parse("https://example.com/cert/1")?,
            key.get_parameters().clone(),
        );

        let signature = key.sign(&header, EMPTY_PAYLOAD)?;

        assert!(signature.payload.is_empty());
        assert!(key.account_url().is_none());
        Ok(())
    }
}
