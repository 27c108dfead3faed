//! GGUF header validation
//!
//! Checked before handing a file to llama.cpp so a wrong path or a truncated
//! download fails with a clear message instead of a native loader error.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

use crate::inference::error::EngineError;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to read model file: {0}")]
    Io(#[from] io::Error),

    #[error("Not a GGUF file: magic 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    Truncated,
}

impl From<GgufError> for EngineError {
    fn from(e: GgufError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, GgufError> {
        let mut buf = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match reader.read(&mut buf[filled..])? {
                0 => return Err(GgufError::Truncated),
                n => filled += n,
            }
        }

        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let magic = u32_at(0);
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }
        let version = u32_at(4);
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: u64_at(8),
            metadata_kv_count: u64_at(16),
        })
    }
}

/// Read and check the header of the model file at `path`.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let header = GgufHeader::read_from(File::open(path.as_ref())?)?;
    tracing::debug!(
        "GGUF v{} with {} tensors: {:?}",
        header.version,
        header.tensor_count,
        path.as_ref()
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn header_bytes(magic: u32, version: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&magic.to_le_bytes());
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&291u64.to_le_bytes());
        bytes.extend_from_slice(&24u64.to_le_bytes());
        bytes
    }

    #[test]
    fn test_reads_valid_header() {
        let header = GgufHeader::read_from(Cursor::new(header_bytes(GGUF_MAGIC, 3))).unwrap();
        assert_eq!(
            header,
            GgufHeader {
                version: 3,
                tensor_count: 291,
                metadata_kv_count: 24
            }
        );
    }

    #[test]
    fn test_rejects_bad_magic() {
        let result = GgufHeader::read_from(Cursor::new(header_bytes(0xDEADBEEF, 3)));
        assert!(matches!(result, Err(GgufError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_rejects_old_version() {
        let result = GgufHeader::read_from(Cursor::new(header_bytes(GGUF_MAGIC, 1)));
        assert!(matches!(result, Err(GgufError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        assert!(matches!(validate_gguf(file.path()), Err(GgufError::Truncated)));
    }

    #[test]
    fn test_missing_file_maps_to_engine_error() {
        let err: EngineError = validate_gguf("/nonexistent/model.gguf").unwrap_err().into();
        assert!(matches!(err, EngineError::ModelValidation(_)));
    }
}
