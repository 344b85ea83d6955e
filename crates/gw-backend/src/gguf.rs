//! Lightweight GGUF header validation, used to fail fast before handing a
//! path to llama.cpp. Mirrors the header layout llama.cpp itself checks:
//! a 4-byte magic, a u32 version, and two u64 counts.

use std::io::Read;
use std::path::Path;

const GGUF_MAGIC: u32 = 0x4655_4747;
const HEADER_SIZE: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum GgufError {
    #[error("could not open {path}: {source}")]
    FileOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is too small to be a valid GGUF file")]
    FileTooSmall { path: String },
    #[error("{path} has an invalid GGUF magic number")]
    InvalidMagic { path: String },
    #[error("{path} uses unsupported GGUF version {version}")]
    UnsupportedVersion { path: String, version: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, GgufError> {
    let path_str = path.display().to_string();
    let mut file = std::fs::File::open(path).map_err(|source| GgufError::FileOpen {
        path: path_str.clone(),
        source,
    })?;

    let mut header = [0u8; HEADER_SIZE];
    let read = file.read(&mut header).map_err(|source| GgufError::FileOpen {
        path: path_str.clone(),
        source,
    })?;
    if read < HEADER_SIZE {
        return Err(GgufError::FileTooSmall { path: path_str });
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic { path: path_str });
    }

    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if version != 2 && version != 3 {
        return Err(GgufError::UnsupportedVersion { path: path_str, version });
    }

    let tensor_count = u64::from_le_bytes(header[8..16].try_into().unwrap());
    let metadata_kv_count = u64::from_le_bytes(header[16..24].try_into().unwrap());

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

pub fn is_gguf_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gguf").unwrap_or(false) && validate_gguf(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_header(bytes: &mut Vec<u8>, magic: u32, version: u32, tensors: u64, kvs: u64) {
        bytes.extend_from_slice(&magic.to_le_bytes());
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&tensors.to_le_bytes());
        bytes.extend_from_slice(&kvs.to_le_bytes());
    }

    #[test]
    fn validates_well_formed_header() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, GGUF_MAGIC, 3, 10, 2);
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&bytes).unwrap();

        let meta = validate_gguf(file.path()).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.tensor_count, 10);
        assert_eq!(meta.metadata_kv_count, 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, 0xDEAD_BEEF, 3, 0, 0);
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&bytes).unwrap();

        assert!(matches!(
            validate_gguf(file.path()),
            Err(GgufError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, GGUF_MAGIC, 99, 0, 0);
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&bytes).unwrap();

        assert!(matches!(
            validate_gguf(file.path()),
            Err(GgufError::UnsupportedVersion { version: 99, .. })
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        let file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        assert!(matches!(
            validate_gguf(file.path()),
            Err(GgufError::FileTooSmall { .. })
        ));
    }
}
