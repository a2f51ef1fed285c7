//! Incremental artifact checksums
//!
//! Hints arrive as `algo:hex` strings (`sha256:…`, `md5:…`). Hashing is
//! wired into the transfer stream so checksums never require a second pass
//! over the artifact.

use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed checksum hint: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn parse(tag: &str) -> Result<Self, ChecksumError> {
        match tag.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "md5" | "md-5" => Ok(ChecksumAlgorithm::Md5),
            other => Err(ChecksumError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Parsed `algo:hex` checksum hint with a normalized (lowercase) digest.
#[derive(Debug, Clone)]
pub struct ChecksumHint {
    pub algorithm: ChecksumAlgorithm,
    pub expected: String,
}

impl ChecksumHint {
    pub fn parse(hint: &str) -> Result<Self, ChecksumError> {
        let (tag, digest) = hint
            .split_once(':')
            .ok_or_else(|| ChecksumError::Malformed(hint.to_string()))?;
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::Malformed(hint.to_string()));
        }
        Ok(Self {
            algorithm: ChecksumAlgorithm::parse(tag)?,
            expected: digest.to_ascii_lowercase(),
        })
    }
}

/// Streaming digest over one artifact body.
pub struct StreamingDigest {
    inner: DigestKind,
}

enum DigestKind {
    Sha256(Sha256),
    Md5(Md5),
}

impl StreamingDigest {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let inner = match algorithm {
            ChecksumAlgorithm::Sha256 => DigestKind::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => DigestKind::Md5(Md5::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match &mut self.inner {
            DigestKind::Sha256(hasher) => hasher.update(chunk),
            DigestKind::Md5(hasher) => hasher.update(chunk),
        }
    }

    /// Finish and return the digest as lowercase hex.
    pub fn finalize(self) -> String {
        match self.inner {
            DigestKind::Sha256(hasher) => hex::encode(hasher.finalize()),
            DigestKind::Md5(hasher) => hex::encode(hasher.finalize()),
        }
    }
}
