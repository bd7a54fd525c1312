use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Private keys are only readable by the owner
pub const KEY_FILE_MODE: u32 = 0o600;
/// Certificates are public information
pub const CERT_FILE_MODE: u32 = 0o644;

/// Creates (or truncates) `path` with the given permission bits and writes `contents`.
///
/// The mode only applies when the file is created.
pub fn write_file_with_mode(path: &Path, mode: u32, contents: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

pub(crate) mod serde_helper {
    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::fmt::Formatter;

    /// RFC 3339 timestamps that may be absent, for `#[serde(with = ...)]`
    pub(crate) use time::serde::rfc3339::option as optional_offset_date_time;

    /// Raw response body. The certificate download is the only ACME response that isn't JSON.
    #[derive(Debug)]
    pub struct PassthroughBytes(Vec<u8>);

    impl PassthroughBytes {
        pub fn into_inner(self) -> Vec<u8> {
            self.0
        }
    }

    impl<'de> Deserialize<'de> for PassthroughBytes {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct BytesVisitor;

            impl Visitor<'_> for BytesVisitor {
                type Value = PassthroughBytes;

                fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
                    formatter.write_str("a byte buffer")
                }

                fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(PassthroughBytes(v.to_vec()))
                }

                fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(PassthroughBytes(v))
                }
            }

            deserializer.deserialize_byte_buf(BytesVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::serde_helper::optional_offset_date_time;
    use super::*;
    use rstest::rstest;
    use std::os::unix::fs::PermissionsExt;
    use time::OffsetDateTime;
    use time::macros::datetime;

    #[rstest]
    #[case("\"1985-04-12T23:20:50.52Z\"", Some(datetime!(1985-04-12 23:20:50.52 UTC)))]
    #[case("\"1996-12-19T16:39:57-08:00\"", Some(datetime!(1996-12-20 00:39:57 UTC)))]
    #[case("null", None)]
    fn test_deserialize_optional_rfc339(#[case] test_value: &str, #[case] expected: Option<OffsetDateTime>) {
        let mut deserializer = serde_json::Deserializer::from_str(test_value);
        let date_time: Option<OffsetDateTime> = optional_offset_date_time::deserialize(&mut deserializer).unwrap();
        assert_eq!(date_time, expected);
    }

    #[rstest]
    #[case(Some(datetime!(1996-12-20 00:39:57 UTC)), "\"1996-12-20T00:39:57Z\"")]
    #[case(None, "null")]
    fn test_serialize_optional_rfc339(#[case] test_value: Option<OffsetDateTime>, #[case] expected: &str) {
        let mut serialized = Vec::new();
        let mut serializer = serde_json::Serializer::new(&mut serialized);
        optional_offset_date_time::serialize(&test_value, &mut serializer).unwrap();
        assert_eq!(String::from_utf8_lossy(&serialized), expected);
    }

    #[rstest]
    #[case::key(KEY_FILE_MODE)]
    #[case::cert(CERT_FILE_MODE)]
    fn test_write_file_with_mode(#[case] mode: u32) -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("file");

        write_file_with_mode(&path, mode, b"first, longer content")?;
        write_file_with_mode(&path, mode, b"second")?;

        assert_eq!(std::fs::read(&path)?, b"second");
        assert_eq!(std::fs::metadata(&path)?.permissions().mode() & 0o777, mode);
        Ok(())
    }
}
