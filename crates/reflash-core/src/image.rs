//! Firmware images and dump files

use std::ops::Range;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::info;

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Immutable firmware image, read once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Bytes,
}

impl FirmwareImage {
    /// Read a whole image file into memory
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        info!(path = %path.display(), len = data.len(), "Loaded firmware image");
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Hash of a file range; `None` if the range is out of bounds
    pub fn hash(&self, range: Range<usize>) -> Option<[u8; 32]> {
        self.data.get(range).map(sha256)
    }

    /// Whether `pattern` occurs anywhere in `range`
    pub fn contains(&self, range: Range<usize>, pattern: &[u8]) -> bool {
        match self.data.get(range) {
            Some(slice) if !pattern.is_empty() => {
                slice.windows(pattern.len()).any(|window| window == pattern)
            }
            _ => false,
        }
    }
}

impl AsRef<[u8]> for FirmwareImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Path of the hash sidecar for a dump
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Write a dump and its `<path>.sha256` sidecar
///
/// The sidecar uses the `sha256sum` line format. Returns the sidecar path.
pub fn write_dump(path: impl AsRef<Path>, data: &[u8]) -> std::io::Result<PathBuf> {
    let path = path.as_ref();
    std::fs::write(path, data)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = sidecar_path(path);
    std::fs::write(
        &sidecar,
        format!("{}  {}\n", hex::encode(sha256(data)), file_name),
    )?;

    info!(path = %path.display(), len = data.len(), "Dump written");
    Ok(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hash_and_bounds() {
        let image = FirmwareImage::from_bytes(vec![0u8; 64]);
        assert_eq!(image.hash(0..64), Some(sha256(&[0u8; 64])));
        assert_eq!(image.hash(32..65), None);
        assert_ne!(image.hash(0..32), image.hash(0..33));
    }

    #[test]
    fn test_contains_pattern_in_range() {
        let mut data = vec![0xFFu8; 256];
        data[200..204].copy_from_slice(b"VKEY");
        let image = FirmwareImage::from_bytes(data);

        assert!(image.contains(128..256, b"VKEY"));
        assert!(!image.contains(0..128, b"VKEY"));
        assert!(!image.contains(0..256, b""));
        assert!(!image.contains(0..512, b"VKEY"));
    }

    #[test]
    fn test_load_and_dump_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecu.bin");
        let data: Vec<u8> = (0..=255).collect();

        let sidecar = write_dump(&path, &data).unwrap();
        assert_eq!(sidecar, dir.path().join("ecu.bin.sha256"));

        let loaded = FirmwareImage::load(&path).unwrap();
        assert_eq!(loaded.as_ref(), data.as_slice());

        let line = std::fs::read_to_string(&sidecar).unwrap();
        assert_eq!(line, format!("{}  ecu.bin\n", hex::encode(sha256(&data))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FirmwareImage::load(dir.path().join("absent.bin")).is_err());
    }
}
