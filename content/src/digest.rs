//! Content digests and the incremental digest calculator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::error::Error;

/// Hash algorithms accepted in content digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the registry default.
    Sha256,

    /// SHA-512
    Sha512,
}

impl Algorithm {
    /// Name of the algorithm as it appears in a digest string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in an encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::InvalidDigest(format!("unsupported algorithm {s:?}"))),
        }
    }
}

/// A content digest, `algorithm:hex`.
///
/// Digests are compared by value. Two blobs with equal digests are treated as
/// byte-identical everywhere in this crate.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Hash `data` with SHA-256.
    pub fn sha256(data: impl AsRef<[u8]>) -> Self {
        Self::compute(Algorithm::Sha256, data)
    }

    /// Hash `data` with the given algorithm.
    pub fn compute(algorithm: Algorithm, data: impl AsRef<[u8]>) -> Self {
        let hex = match algorithm {
            Algorithm::Sha256 => hex::encode(sha2::Sha256::digest(data.as_ref())),
            Algorithm::Sha512 => hex::encode(sha2::Sha512::digest(data.as_ref())),
        };
        Digest { algorithm, hex }
    }

    /// The hash algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lower-case hex encoding of the hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// A fresh calculator using this digest's algorithm.
    pub fn digester(&self) -> Digester {
        Digester::new(self.algorithm)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(format!("{s:?} has no algorithm")))?;
        let algorithm: Algorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_len() {
            return Err(Error::InvalidDigest(format!(
                "{s:?}: expected {} hex characters",
                algorithm.hex_len()
            )));
        }

        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidDigest(format!(
                "{s:?}: digest must be lower-case hex"
            )));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_owned(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(hasher) => hasher.update(data),
            Hasher::Sha512(hasher) => hasher.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Incremental digest calculator.
///
/// Bytes are fed with [`Digester::update`] in stream order; the result is the
/// same regardless of how the stream was split into chunks. A calculator can
/// be finalized exactly once, and only after at least one `update` (an empty
/// `update` is how an empty stream is marked complete).
pub struct Digester {
    algorithm: Algorithm,
    hasher: Option<Hasher>,
    updated: bool,
    written: u64,
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("algorithm", &self.algorithm)
            .field("finalized", &self.hasher.is_none())
            .field("written", &self.written)
            .finish()
    }
}

impl Digester {
    /// Start a new calculation.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            hasher: Some(Hasher::new(algorithm)),
            updated: false,
            written: 0,
        }
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Number of bytes fed so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Whether [`Digester::finalize`] has already been called.
    pub fn is_finalized(&self) -> bool {
        self.hasher.is_none()
    }

    /// Feed the next bytes of the stream.
    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        let hasher = self.hasher.as_mut().ok_or_else(|| {
            Error::ProtocolViolation("digest updated after it was finalized".into())
        })?;
        hasher.update(data);
        self.updated = true;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Produce the digest of everything fed so far.
    pub fn finalize(&mut self) -> Result<Digest, Error> {
        if !self.updated {
            return Err(Error::ProtocolViolation(
                "digest finalized before any data was fed".into(),
            ));
        }
        let hasher = self
            .hasher
            .take()
            .ok_or_else(|| Error::ProtocolViolation("digest finalized twice".into()))?;
        Ok(Digest {
            algorithm: self.algorithm,
            hex: hasher.finalize(),
        })
    }
}
