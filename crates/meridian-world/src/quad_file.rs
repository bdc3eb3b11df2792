//! On-disk quad file format.
//!
//! One file per quad anchor holds the records of its members. Quads whose
//! members are all flagged uniform have no file:
//!
//! ```text
//! [u32 header length, LE][bincode QuadFileHeader][lz4(bincode Vec<ChunkRecord>)]
//! ```
//!
//! Files are written to a sibling temporary path and renamed into place so a
//! crash mid-write never leaves a torn quad behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use meridian_common::{MagicBytes, QuadAnchor, SchemaVersion, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunk::ChunkRecord;

/// File extension of quad files.
pub const QUAD_FILE_EXTENSION: &str = "map";

/// Quad file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadFileHeader {
    /// Magic bytes for format identification
    pub magic: [u8; 4],
    /// Container schema version
    pub version: SchemaVersion,
    /// Quad the file belongs to
    pub anchor: QuadAnchor,
    /// Number of chunk records in the body
    pub record_count: u32,
}

impl QuadFileHeader {
    /// Creates a header for `record_count` records.
    #[must_use]
    pub fn new(anchor: QuadAnchor, record_count: u32) -> Self {
        Self {
            magic: MagicBytes::QUAD.0,
            version: SchemaVersion::QUAD_FILE,
            anchor,
            record_count,
        }
    }

    /// Validates magic bytes and version.
    pub fn validate(&self, path: &Path) -> StreamResult<()> {
        if self.magic != MagicBytes::QUAD.0 {
            return Err(StreamError::InvalidFormat(path.to_path_buf()));
        }
        if !SchemaVersion::QUAD_FILE.can_read(&self.version) {
            return Err(StreamError::VersionMismatch {
                expected: SchemaVersion::QUAD_FILE.to_string(),
                actual: self.version.to_string(),
            });
        }
        Ok(())
    }
}

/// Returns the path of the quad file for `anchor` under a dimension root.
#[must_use]
pub fn quad_path(dimension_root: &Path, anchor: QuadAnchor) -> PathBuf {
    let region = anchor.region();
    let (sx, sy) = region.segment();
    dimension_root
        .join("maps")
        .join(format!("{sx}.{sy}.{}", region.z))
        .join(format!(
            "{}.{}.{}.{QUAD_FILE_EXTENSION}",
            region.x, region.y, region.z
        ))
}

/// Returns the path an unreadable quad file is moved to.
#[must_use]
pub fn corrupt_path(path: &Path) -> PathBuf {
    path.with_extension(format!("{QUAD_FILE_EXTENSION}.corrupt"))
}

/// Encodes a quad file.
pub fn encode(anchor: QuadAnchor, records: &[ChunkRecord]) -> StreamResult<Vec<u8>> {
    let header = QuadFileHeader::new(anchor, records.len() as u32);
    let header_bytes =
        bincode::serialize(&header).map_err(|e| StreamError::Serialization(e.to_string()))?;
    let body_bytes =
        bincode::serialize(records).map_err(|e| StreamError::Serialization(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&body_bytes);

    let mut result = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
    result.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    result.extend_from_slice(&header_bytes);
    result.extend_from_slice(&compressed);
    Ok(result)
}

/// Decodes a quad file. `path` is only used for diagnostics.
///
/// Records with an unreadable schema version are skipped with a warning.
pub fn decode(path: &Path, bytes: &[u8]) -> StreamResult<(QuadFileHeader, Vec<ChunkRecord>)> {
    let corrupt = |reason: &str| StreamError::Deserialization {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let Some(len_bytes) = bytes.get(..4) else {
        return Err(corrupt("data too short"));
    };
    let header_len =
        u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    let Some(header_bytes) = bytes.get(4..4 + header_len) else {
        return Err(corrupt("header length mismatch"));
    };

    let header: QuadFileHeader =
        bincode::deserialize(header_bytes).map_err(|e| corrupt(&e.to_string()))?;
    header.validate(path)?;

    let body = lz4_flex::decompress_size_prepended(&bytes[4 + header_len..])
        .map_err(|e| corrupt(&e.to_string()))?;
    let records: Vec<ChunkRecord> =
        bincode::deserialize(&body).map_err(|e| corrupt(&e.to_string()))?;

    if records.len() != header.record_count as usize {
        warn!(
            "Quad file {} declares {} records but holds {}",
            path.display(),
            header.record_count,
            records.len()
        );
    }

    let records = records
        .into_iter()
        .filter(|record| {
            let readable = SchemaVersion::CHUNK_RECORD.can_read(&record.version);
            if !readable {
                warn!(
                    "Skipping chunk record {} with unsupported version {} in {}",
                    record.pos(),
                    record.version,
                    path.display()
                );
            }
            readable
        })
        .collect();

    Ok((header, records))
}

/// Reads and decodes a quad file. A missing file is `Ok(None)`.
pub fn read(path: &Path) -> StreamResult<Option<Vec<ChunkRecord>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let (_, records) = decode(path, &bytes)?;
    Ok(Some(records))
}

/// Writes a quad file through a temporary file and an atomic rename.
pub fn write(path: &Path, anchor: QuadAnchor, records: &[ChunkRecord]) -> StreamResult<()> {
    let bytes = encode(anchor, records)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{QUAD_FILE_EXTENSION}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Deletes the quad file if present.
pub fn remove(path: &Path) -> StreamResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
