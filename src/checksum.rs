//! Streaming checksum computation.
//!
//! The engine is fed arbitrary slices as bytes arrive from the client; the digest depends
//! only on the concatenated bytes, never on how they were chunked.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::constants::DEFAULT_BLOCK_SIZE;
use crate::error::{ArchiveError, Result};

/// Digest algorithm used for a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumVariant {
    #[default]
    Crc32,
    /// Castagnoli polynomial; hardware accelerated where available.
    Crc32c,
    Sha256,
    Blake3,
}

impl ChecksumVariant {
    /// Identifier recorded in the catalog next to the checksum value.
    #[must_use]
    pub fn plugin_id(self) -> &'static str {
        match self {
            Self::Crc32 => "crc32",
            Self::Crc32c => "crc32c",
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    #[must_use]
    pub fn from_plugin_id(id: &str) -> Option<Self> {
        match id {
            "crc32" => Some(Self::Crc32),
            "crc32c" => Some(Self::Crc32c),
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }

    /// Parse a per-request override. Accepts a variant name or its numeric code;
    /// `-1` and `none` disable checksumming and yield `Ok(None)`.
    pub fn parse_request_param(value: &str) -> Result<Option<Self>> {
        match value.trim().to_ascii_lowercase().as_str() {
            "-1" | "none" => Ok(None),
            "0" | "crc32" => Ok(Some(Self::Crc32)),
            "1" | "crc32c" => Ok(Some(Self::Crc32c)),
            "2" | "sha256" => Ok(Some(Self::Sha256)),
            "3" | "blake3" => Ok(Some(Self::Blake3)),
            other => Err(ArchiveError::InvalidRequest(format!(
                "unknown checksum variant: {other}"
            ))),
        }
    }
}

impl fmt::Display for ChecksumVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plugin_id())
    }
}

/// A finalized digest together with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub variant: ChecksumVariant,
    pub value: String,
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.variant, self.value)
    }
}

enum DigestState {
    Crc32(crc32fast::Hasher),
    Crc32c(u32),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

/// Running digest state for one request.
pub struct ChecksumEngine {
    state: DigestState,
    bytes: u64,
}

impl fmt::Debug for ChecksumEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumEngine")
            .field("variant", &self.variant())
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl ChecksumEngine {
    #[must_use]
    pub fn new(variant: ChecksumVariant) -> Self {
        let state = match variant {
            ChecksumVariant::Crc32 => DigestState::Crc32(crc32fast::Hasher::new()),
            ChecksumVariant::Crc32c => DigestState::Crc32c(0),
            ChecksumVariant::Sha256 => DigestState::Sha256(sha2::Sha256::new()),
            ChecksumVariant::Blake3 => DigestState::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self { state, bytes: 0 }
    }

    #[must_use]
    pub fn variant(&self) -> ChecksumVariant {
        match self.state {
            DigestState::Crc32(_) => ChecksumVariant::Crc32,
            DigestState::Crc32c(_) => ChecksumVariant::Crc32c,
            DigestState::Sha256(_) => ChecksumVariant::Sha256,
            DigestState::Blake3(_) => ChecksumVariant::Blake3,
        }
    }

    pub fn update(&mut self, buffer: &[u8]) {
        match &mut self.state {
            DigestState::Crc32(hasher) => hasher.update(buffer),
            DigestState::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, buffer),
            DigestState::Sha256(hasher) => hasher.update(buffer),
            DigestState::Blake3(hasher) => {
                hasher.update(buffer);
            }
        }
        self.bytes += buffer.len() as u64;
    }

    /// Number of bytes fed so far.
    #[must_use]
    pub fn bytes_processed(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn finalize(self) -> Checksum {
        let variant = self.variant();
        let value = match self.state {
            // crc32 is rendered as an unsigned decimal, as the catalog has always stored it
            DigestState::Crc32(hasher) => hasher.finalize().to_string(),
            DigestState::Crc32c(crc) => crc.to_string(),
            DigestState::Sha256(hasher) => hex::encode(hasher.finalize()),
            DigestState::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        };
        Checksum { variant, value }
    }
}

/// Compute a checksum over a reader in fixed-size blocks.
pub fn checksum_reader(
    reader: &mut dyn Read,
    variant: ChecksumVariant,
    block_size: usize,
) -> Result<Checksum> {
    let mut engine = ChecksumEngine::new(variant);
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        engine.update(&buf[..n]);
    }
    Ok(engine.finalize())
}

/// Recompute the checksum of a file on disk.
pub fn checksum_file(path: &Path, variant: ChecksumVariant) -> Result<Checksum> {
    let mut file = fs_err::File::open(path)?;
    checksum_reader(&mut file, variant, DEFAULT_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARIANTS: [ChecksumVariant; 4] = [
        ChecksumVariant::Crc32,
        ChecksumVariant::Crc32c,
        ChecksumVariant::Sha256,
        ChecksumVariant::Blake3,
    ];

    fn digest_in_blocks(data: &[u8], variant: ChecksumVariant, block: usize) -> Checksum {
        let mut engine = ChecksumEngine::new(variant);
        for chunk in data.chunks(block) {
            engine.update(chunk);
        }
        engine.finalize()
    }

    #[test]
    fn digest_is_block_size_independent() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..8 {
            let len = rng.usize(0..200_000);
            let data: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
            for variant in VARIANTS {
                let whole = digest_in_blocks(&data, variant, data.len().max(1));
                for block in [1, 7, 512, 4096, 65_536, rng.usize(1..10_000)] {
                    assert_eq!(digest_in_blocks(&data, variant, block), whole);
                }
            }
        }
    }

    #[test]
    fn irregular_chunking_matches_single_update() {
        let mut rng = fastrand::Rng::with_seed(42);
        let data: Vec<u8> = (0..50_000).map(|_| rng.u8(..)).collect();
        for variant in VARIANTS {
            let mut engine = ChecksumEngine::new(variant);
            let mut offset = 0;
            while offset < data.len() {
                let take = rng.usize(0..3000).min(data.len() - offset);
                engine.update(&data[offset..offset + take]);
                offset += take;
            }
            assert_eq!(engine.bytes_processed(), data.len() as u64);
            assert_eq!(engine.finalize(), digest_in_blocks(&data, variant, data.len()));
        }
    }

    #[test]
    fn known_crc32_value() {
        let mut engine = ChecksumEngine::new(ChecksumVariant::Crc32);
        engine.update(b"123456789");
        assert_eq!(engine.finalize().value, "3421780262");
    }

    #[test]
    fn known_crc32c_value() {
        let mut engine = ChecksumEngine::new(ChecksumVariant::Crc32c);
        engine.update(b"12345");
        engine.update(b"6789");
        let checksum = engine.finalize();
        assert_eq!(checksum.value, "3808858755");
        assert_eq!(checksum.to_string(), "crc32c:3808858755");
    }

    #[test]
    fn known_sha256_value() {
        let mut engine = ChecksumEngine::new(ChecksumVariant::Sha256);
        engine.update(b"abc");
        assert_eq!(
            engine.finalize().value,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn request_param_parsing() {
        assert_eq!(
            ChecksumVariant::parse_request_param("0").unwrap(),
            Some(ChecksumVariant::Crc32)
        );
        assert_eq!(
            ChecksumVariant::parse_request_param("1").unwrap(),
            Some(ChecksumVariant::Crc32c)
        );
        assert_eq!(
            ChecksumVariant::parse_request_param("crc32c").unwrap(),
            Some(ChecksumVariant::Crc32c)
        );
        assert_eq!(
            ChecksumVariant::parse_request_param("2").unwrap(),
            Some(ChecksumVariant::Sha256)
        );
        assert_eq!(
            ChecksumVariant::parse_request_param("CRC32").unwrap(),
            Some(ChecksumVariant::Crc32)
        );
        assert_eq!(ChecksumVariant::parse_request_param("-1").unwrap(), None);
        assert!(ChecksumVariant::parse_request_param("md5").is_err());
    }

    #[test]
    fn abandoned_engine_needs_no_finalize() {
        let mut engine = ChecksumEngine::new(ChecksumVariant::Blake3);
        engine.update(b"partial upload");
        drop(engine);
    }
}
