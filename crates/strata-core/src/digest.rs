//! Content digests.
//!
//! One algorithm (SHA-256) for the whole system, always rendered as
//! `sha256:<64 lowercase hex>`.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::canonical::CanonicalBytes;
use crate::error::{BundleError, BundleResult};

/// Algorithm prefix used in every digest string.
pub const ALGORITHM: &str = "sha256";

const HEX_LEN: usize = 64;

/// A validated `sha256:<hex>` digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> BundleResult<Self> {
        let hex = s
            .strip_prefix(ALGORITHM)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| BundleError::validation(format!("digest '{}' must start with '{}:'", s, ALGORITHM)))?;

        if hex.len() != HEX_LEN {
            return Err(BundleError::validation(format!(
                "digest '{}' must have {} hex characters, found {}",
                s,
                HEX_LEN,
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(BundleError::validation(format!(
                "digest '{}' must be lowercase hex",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Whether `s` is a well-formed digest.
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// Digest of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(bytes);
        hasher.finish()
    }

    /// Digest of canonical metadata bytes.
    pub fn of_canonical(bytes: &CanonicalBytes) -> Self {
        Self::of_bytes(bytes.as_bytes())
    }

    /// Stream a reader through the hasher.
    pub fn of_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut hasher = ContentHasher::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// Filesystem- and tag-safe spelling: `sha256-<hex>`.
    pub fn key(&self) -> String {
        format!("{}-{}", ALGORITHM, self.hex())
    }

    /// Inverse of [`Digest::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        let hex = key.strip_prefix(ALGORITHM)?.strip_prefix('-')?;
        Self::parse(&format!("{}:{}", ALGORITHM, hex)).ok()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = BundleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Incremental SHA-256 that yields a [`Digest`].
///
/// Implements [`Write`] so it can sit behind `io::copy` or a tee writer.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
    written: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.written += bytes.len() as u64;
    }

    /// Bytes fed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{}:{}", ALGORITHM, hex::encode(self.inner.finalize())))
    }
}

impl Write for ContentHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
