//! Target descriptors
//!
//! ECU variants differ only in data: partition tables, identifiers, routine
//! numbers and safety rules. The orchestrator is parameterized over a
//! [`TargetDescriptor`] selected by [`TargetId`].

use std::fmt;
use std::ops::Range;

use reflash_uds::{AddressWidth, ServiceOverrides};
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::keys::{self, KeyFamily};

/// Partition indices are bit positions in a 32-bit mask
pub const MASK_BITS: u8 = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("Partition {name} has index {index}, outside the 32-bit mask")]
    IndexOutOfMask { name: String, index: u8 },

    #[error("Partition index {0} is used twice")]
    DuplicateIndex(u8),

    #[error("Protected partition {0} is not in the partition table")]
    UnknownProtected(u8),
}

fn mask_bit(index: u8) -> u32 {
    1u32.checked_shl(u32::from(index)).unwrap_or(0)
}

fn mask_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let index = u8::deserialize(deserializer)?;
    if index >= MASK_BITS {
        return Err(de::Error::custom(format!(
            "partition index {} outside the {}-bit mask",
            index, MASK_BITS
        )));
    }
    Ok(index)
}

fn optional_mask_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
    match Option::<u8>::deserialize(deserializer)? {
        Some(index) if index >= MASK_BITS => Err(de::Error::custom(format!(
            "protected partition {} outside the {}-bit mask",
            index, MASK_BITS
        ))),
        other => Ok(other),
    }
}

/// Known ECU variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    E39,
    E78,
}

impl TargetId {
    pub fn descriptor(self) -> TargetDescriptor {
        match self {
            TargetId::E39 => e39(),
            TargetId::E78 => e78(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::E39 => write!(f, "E39"),
            TargetId::E78 => write!(f, "E78"),
        }
    }
}

/// How a written partition is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStrategy {
    /// The loader hashes the physical range itself
    RemoteHash,
    /// Read the range back and hash it locally
    ReadBack,
}

/// One erasable region of flash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Bit position in the partition mask
    #[serde(deserialize_with = "mask_index")]
    pub index: u8,
    pub name: String,
    pub file_start: u32,
    pub file_end: u32,
    pub phys_start: u32,
    pub phys_end: u32,
    /// Never diffed, erased or written
    #[serde(default)]
    pub excluded: bool,
}

impl Partition {
    /// Partition whose physical range equals its file range
    pub fn new(index: u8, name: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            index,
            name: name.into(),
            file_start: start,
            file_end: end,
            phys_start: start,
            phys_end: end,
            excluded: false,
        }
    }

    /// Place the partition in a separate physical window
    pub fn at_physical(mut self, phys_start: u32) -> Self {
        self.phys_end = phys_start + (self.file_end - self.file_start);
        self.phys_start = phys_start;
        self
    }

    pub fn excluded(mut self) -> Self {
        self.excluded = true;
        self
    }

    /// Mask bit; zero for an index outside the mask, which is never selected
    pub fn bit(&self) -> u32 {
        mask_bit(self.index)
    }

    pub fn len(&self) -> usize {
        self.file_end.saturating_sub(self.file_start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.file_end <= self.file_start
    }

    /// Physical address differs from the file offset
    pub fn is_shadow(&self) -> bool {
        self.phys_start != self.file_start
    }

    /// File range, if it is well formed and fits an image of `image_len` bytes
    pub fn file_range(&self, image_len: usize) -> Option<Range<usize>> {
        if self.file_start >= self.file_end || self.phys_start >= self.phys_end {
            return None;
        }
        if self.phys_end - self.phys_start != self.file_end - self.file_start
            || self.file_end as usize > image_len
        {
            return None;
        }
        Some(self.file_start as usize..self.file_end as usize)
    }

    /// Physical address of a file offset inside this partition
    pub fn physical(&self, file_offset: usize) -> u32 {
        self.phys_start + (file_offset as u32 - self.file_start)
    }
}

/// Everything the engine needs to know about one ECU variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub id: TargetId,
    /// Expected firmware image length in bytes
    pub image_len: usize,
    pub partitions: Vec<Partition>,
    /// Partition holding recovery/key material, written only on its own
    #[serde(default, deserialize_with = "optional_mask_index")]
    pub protected_partition: Option<u8>,
    /// Byte patterns that must not appear in the protected partition's content
    pub guard_patterns: Vec<Vec<u8>>,

    /// Identifier carrying the hardware ID
    pub hardware_id_did: u8,
    pub hardware_id_mask: u32,
    pub hardware_id: u32,

    /// Identifier the loader answers with its signature
    pub identity_did: u8,
    pub loader_signature: String,
    /// Where the loader binary is downloaded and started
    pub loader_address: u32,
    pub address_width: AddressWidth,

    pub security_level: u8,
    pub key_family: KeyFamily,

    /// Identifier for the inter-frame delay parameter
    pub frame_delay_did: u8,

    pub hash_routine: u16,
    pub erase_routine: u16,
    pub verify: VerifyStrategy,

    /// Compressed writes are understood by this target's loader
    pub compressed_write: bool,

    #[serde(default)]
    pub services: ServiceOverrides,
}

impl TargetDescriptor {
    pub fn partition(&self, index: u8) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// Partitions that take part in diffing and writing
    pub fn candidates(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| !p.excluded)
    }

    /// Mask with every writable partition set
    pub fn writable_mask(&self) -> u32 {
        self.candidates().fold(0, |mask, p| mask | p.bit())
    }

    pub fn protected_bit(&self) -> u32 {
        self.protected_partition.map_or(0, mask_bit)
    }

    /// Check the partition table against the 32-bit mask
    pub fn validate(&self) -> Result<(), TargetError> {
        let mut seen = 0u32;
        for p in &self.partitions {
            if p.index >= MASK_BITS {
                return Err(TargetError::IndexOutOfMask {
                    name: p.name.clone(),
                    index: p.index,
                });
            }
            if seen & p.bit() != 0 {
                return Err(TargetError::DuplicateIndex(p.index));
            }
            seen |= p.bit();
        }
        match self.protected_partition {
            Some(index) if self.partition(index).is_none() => {
                Err(TargetError::UnknownProtected(index))
            }
            _ => Ok(()),
        }
    }

    /// Partitions selected by `mask`, in table order
    pub fn selected(&self, mask: u32) -> impl Iterator<Item = &Partition> {
        self.candidates().filter(move |p| mask & p.bit() != 0)
    }

    /// Hardware ID comparison after masking
    pub fn hardware_matches(&self, reported: u32) -> bool {
        reported & self.hardware_id_mask == self.hardware_id & self.hardware_id_mask
    }
}

fn e39() -> TargetDescriptor {
    let table = [
        (1, 0x020000, 0x040000),
        (2, 0x040000, 0x060000),
        (3, 0x060000, 0x0A0000),
        (4, 0x0A0000, 0x100000),
        (5, 0x100000, 0x180000),
        (6, 0x180000, 0x200000),
        (7, 0x200000, 0x300000),
    ];

    let mut partitions = vec![Partition::new(0, "boot", 0x000000, 0x020000).excluded()];
    partitions.extend(
        table
            .iter()
            .map(|&(index, start, end)| Partition::new(index, format!("bank{}", index), start, end)),
    );
    partitions.push(Partition::new(8, "shadow", 0x300000, 0x300400).at_physical(0x400000));

    TargetDescriptor {
        id: TargetId::E39,
        image_len: 0x300400,
        partitions,
        protected_partition: Some(8),
        guard_patterns: vec![b"VKEY".to_vec(), vec![0xA5, 0x5A, 0xC3, 0x3C]],
        hardware_id_did: 0xC1,
        hardware_id_mask: 0xFFFF_FF00,
        hardware_id: 0x00BC_6100,
        identity_did: 0x90,
        loader_signature: "RFL-E39".to_string(),
        loader_address: 0x003F_8000,
        address_width: AddressWidth::Bits32,
        security_level: keys::level::BASE,
        key_family: KeyFamily::RotateAdd,
        frame_delay_did: 0x9A,
        hash_routine: 0x0201,
        erase_routine: 0xFF00,
        verify: VerifyStrategy::RemoteHash,
        compressed_write: true,
        services: ServiceOverrides::default(),
    }
}

fn e78() -> TargetDescriptor {
    let table = [
        (1, 0x010000, 0x020000),
        (2, 0x020000, 0x040000),
        (3, 0x040000, 0x080000),
        (4, 0x080000, 0x100000),
        (5, 0x100000, 0x180000),
        (6, 0x180000, 0x200000),
    ];

    let mut partitions = vec![Partition::new(0, "boot", 0x000000, 0x010000).excluded()];
    partitions.extend(
        table
            .iter()
            .map(|&(index, start, end)| Partition::new(index, format!("bank{}", index), start, end)),
    );

    TargetDescriptor {
        id: TargetId::E78,
        image_len: 0x200000,
        partitions,
        protected_partition: None,
        guard_patterns: Vec::new(),
        hardware_id_did: 0xC1,
        hardware_id_mask: 0xFFFF_0000,
        hardware_id: 0x00C8_0000,
        identity_did: 0x90,
        loader_signature: "RFL-E78".to_string(),
        loader_address: 0x4000,
        address_width: AddressWidth::Bits16,
        security_level: keys::level::PROGRAMMING,
        key_family: KeyFamily::RotateAdd,
        frame_delay_did: 0x9A,
        hash_routine: 0x0201,
        erase_routine: 0xFF00,
        verify: VerifyStrategy::ReadBack,
        compressed_write: true,
        services: ServiceOverrides::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e39_table_covers_image() {
        let target = TargetId::E39.descriptor();
        assert_eq!(target.image_len, 0x300400);

        let mut end = 0;
        for p in &target.partitions {
            assert_eq!(p.file_start as usize, end, "gap before {}", p.name);
            assert!(p.file_range(target.image_len).is_some());
            end = p.file_end as usize;
        }
        assert_eq!(end, target.image_len);
    }

    #[test]
    fn test_e39_shadow_partition() {
        let target = TargetId::E39.descriptor();
        let shadow = target.partition(8).unwrap();

        assert!(shadow.is_shadow());
        assert_eq!(shadow.phys_start, 0x400000);
        assert_eq!(shadow.phys_end, 0x400400);
        assert_eq!(shadow.physical(0x300010), 0x400010);
        assert_eq!(target.protected_bit(), 0x100);
        assert!(!target.partition(3).unwrap().is_shadow());
    }

    #[test]
    fn test_boot_partition_never_selected() {
        let target = TargetId::E39.descriptor();
        assert_eq!(target.writable_mask(), 0x1FE);
        let selected: Vec<u8> = target.selected(0xFFFF_FFFF).map(|p| p.index).collect();
        assert_eq!(selected, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_malformed_ranges_rejected() {
        let beyond = Partition::new(1, "beyond", 0x1000, 0x3000);
        assert!(beyond.file_range(0x2000).is_none());

        let mut inverted = Partition::new(2, "inverted", 0x2000, 0x1000);
        inverted.phys_end = inverted.phys_start + 1;
        assert!(inverted.file_range(0x4000).is_none());
    }

    #[test]
    fn test_builtin_descriptors_are_valid() {
        assert_eq!(TargetId::E39.descriptor().validate(), Ok(()));
        assert_eq!(TargetId::E78.descriptor().validate(), Ok(()));
    }

    #[test]
    fn test_index_beyond_mask_has_no_bit() {
        let mut target = TargetId::E39.descriptor();
        target.partitions.push(Partition::new(40, "stray", 0x300400, 0x300500));

        assert_eq!(target.partitions.last().unwrap().bit(), 0);
        // bit 8 is the protected shadow partition; 40 must not alias onto it
        assert!(target.selected(0x100).all(|p| p.index == 8));
        assert!(matches!(
            target.validate(),
            Err(TargetError::IndexOutOfMask { index: 40, .. })
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_indices_rejected() {
        let mut target = TargetId::E78.descriptor();
        target.partitions.push(Partition::new(3, "again", 0x1F0000, 0x200000));
        assert_eq!(target.validate(), Err(TargetError::DuplicateIndex(3)));

        let mut target = TargetId::E78.descriptor();
        target.protected_partition = Some(9);
        assert_eq!(target.validate(), Err(TargetError::UnknownProtected(9)));
    }

    #[test]
    fn test_loading_rejects_index_beyond_mask() {
        let mut value = serde_json::to_value(TargetId::E39.descriptor()).unwrap();
        value["partitions"][1]["index"] = serde_json::json!(40);
        let err = serde_json::from_value::<TargetDescriptor>(value).unwrap_err();
        assert!(err.to_string().contains("outside the 32-bit mask"));

        let mut value = serde_json::to_value(TargetId::E39.descriptor()).unwrap();
        value["protected_partition"] = serde_json::json!(33);
        assert!(serde_json::from_value::<TargetDescriptor>(value).is_err());

        let value = serde_json::to_value(TargetId::E39.descriptor()).unwrap();
        let loaded: TargetDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, TargetId::E39.descriptor());
    }

    #[test]
    fn test_hardware_id_masking() {
        let target = TargetId::E39.descriptor();
        assert!(target.hardware_matches(0x00BC_61FF));
        assert!(!target.hardware_matches(0x00BC_6200));
    }

    #[test]
    fn test_e78_uses_read_back() {
        let target = TargetId::E78.descriptor();
        assert_eq!(target.verify, VerifyStrategy::ReadBack);
        assert_eq!(target.protected_partition, None);
        assert_eq!(target.image_len, 2 * 1024 * 1024);
        assert_eq!(target.id.to_string(), "E78");
    }
}
