//! Content digests (`algorithm:hex`).

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::DigestError;

/// A validated content digest, e.g. `sha256:0a1b…`.
///
/// Only `sha256` and `sha512` are accepted, which covers every digest the
/// distribution protocol produces in practice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    /// The canonical algorithm used for everything the facade computes itself.
    pub const SHA256: &'static str = "sha256";

    /// The only other algorithm accepted on parse.
    pub const SHA512: &'static str = "sha512";

    /// Parses and validates a digest string.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        if s.is_empty() {
            return Err(DigestError::Empty);
        }

        let Some((algorithm, encoded)) = s.split_once(':') else {
            return Err(DigestError::MissingSeparator);
        };

        let (algorithm, expected) = match algorithm {
            Self::SHA256 => (Self::SHA256, 64),
            Self::SHA512 => (Self::SHA512, 128),
            other => return Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        };

        if encoded.len() != expected {
            return Err(DigestError::InvalidLength {
                algorithm,
                expected,
                actual: encoded.len(),
            });
        }

        if !encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidEncoding(encoded.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Computes the sha256 digest of `data`.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut digester = Digester::new();
        digester.update(data);
        digester.finalize()
    }

    /// Hashes `data` with the algorithm of this digest, for checking content
    /// against a digest that may not be sha256.
    #[must_use]
    pub fn rehash(&self, data: &[u8]) -> Self {
        match self.algorithm() {
            Self::SHA512 => Self(format!("{}:{}", Self::SHA512, hex::encode(Sha512::digest(data)))),
            _ => Self::from_bytes(data),
        }
    }

    /// The algorithm part (`sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The hex-encoded part.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }

    /// The full `algorithm:hex` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental sha256 digester for streamed content.
#[derive(Debug, Clone, Default)]
pub struct Digester {
    hasher: Sha256,
    written: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.written += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finalize(self) -> Digest {
        Digest(format!(
            "{}:{}",
            Digest::SHA256,
            hex::encode(self.hasher.finalize())
        ))
    }
}

impl std::io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
