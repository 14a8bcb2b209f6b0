//! Persisted blob framing
//!
//! A snapshot blob is a fixed header (magic number, format version, payload
//! length), the JSON payload, and a SHA-256 checksum of the payload. Any
//! framing defect (wrong magic, unsupported version, truncation, checksum
//! mismatch) fails the load as a whole; the driver must cold-start rather
//! than partially apply a snapshot.

use crate::error::SerializationError;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Magic number identifying a weft snapshot: "WEFTSNAP" (little-endian)
pub const SNAPSHOT_MAGIC: u64 = u64::from_le_bytes(*b"WEFTSNAP");

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot header (20 bytes, little-endian)
#[derive(Debug, Clone)]
pub struct SnapshotHeader {
    /// Magic number (must be [`SNAPSHOT_MAGIC`])
    pub magic: u64,
    /// Snapshot format version
    pub version: u32,
    /// Length of the JSON payload in bytes
    pub payload_len: u64,
}

impl SnapshotHeader {
    /// Header for a payload of the given length
    pub fn new(payload_len: u64) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            payload_len,
        }
    }

    /// Reject foreign or incompatible blobs
    pub fn validate(&self) -> Result<(), SerializationError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(SerializationError::InvalidMagic);
        }
        if self.version != SNAPSHOT_VERSION {
            return Err(SerializationError::UnsupportedVersion {
                expected: SNAPSHOT_VERSION,
                actual: self.version,
            });
        }
        Ok(())
    }

    /// Encode the header in little-endian form
    pub fn encode(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.magic.to_le_bytes())?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.payload_len.to_le_bytes())?;
        Ok(())
    }

    /// Decode a header
    pub fn decode(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let magic = u64::from_le_bytes(buf);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        let version = u32::from_le_bytes(buf);

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let payload_len = u64::from_le_bytes(buf);

        Ok(Self {
            magic,
            version,
            payload_len,
        })
    }
}

/// SHA-256 checksum guarding snapshot integrity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChecksum {
    hash: [u8; 32],
}

impl SnapshotChecksum {
    /// Compute the checksum of a payload
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self { hash }
    }

    /// Whether the checksum matches the payload
    pub fn verify(&self, data: &[u8]) -> bool {
        *self == Self::compute(data)
    }

    /// Hex rendering for diagnostics
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Encode the raw hash bytes
    pub fn encode(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.hash)
    }

    /// Decode the raw hash bytes
    pub fn decode(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut hash = [0u8; 32];
        reader.read_exact(&mut hash)?;
        Ok(Self { hash })
    }
}

/// Frame a payload into a complete snapshot blob
pub fn seal(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 52);
    let header = SnapshotHeader::new(payload.len() as u64);
    // Writing to a Vec cannot fail.
    let _ = header.encode(&mut out);
    let _ = out.write_all(payload);
    let _ = SnapshotChecksum::compute(payload).encode(&mut out);
    out
}

/// Unframe a snapshot blob, verifying magic, version, length, and checksum
pub fn open(blob: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let mut reader = blob;
    let header = SnapshotHeader::decode(&mut reader).map_err(|_| SerializationError::Truncated)?;
    header.validate()?;

    let len = header.payload_len as usize;
    if reader.len() < len + 32 {
        return Err(SerializationError::Truncated);
    }
    let payload = &reader[..len];
    let mut tail = &reader[len..];
    let recorded =
        SnapshotChecksum::decode(&mut tail).map_err(|_| SerializationError::Truncated)?;

    let actual = SnapshotChecksum::compute(payload);
    if recorded != actual {
        return Err(SerializationError::ChecksumMismatch {
            expected: recorded.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(payload.to_vec())
}
