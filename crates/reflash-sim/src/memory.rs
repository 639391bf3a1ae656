//! Physical memory of the simulated ECU

use reflash_core::TargetDescriptor;

/// Base address of the simulated RAM window
pub const RAM_BASE: u32 = 0x00E0_0000;
/// Size of the simulated RAM window
pub const RAM_SIZE: usize = 0x4000;

#[derive(Debug, Clone)]
struct Region {
    start: u32,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u32 {
        self.start + self.data.len() as u32
    }
}

/// Flash banks laid out by a target's physical partition ranges, plus RAM
#[derive(Debug, Clone)]
pub struct Memory {
    regions: Vec<Region>,
}

impl Memory {
    /// Erased flash for every partition of `target`; adjacent ranges merge
    pub fn for_target(target: &TargetDescriptor) -> Self {
        let mut ranges: Vec<(u32, u32)> = target
            .partitions
            .iter()
            .map(|p| (p.phys_start, p.phys_end))
            .collect();
        ranges.sort_unstable();

        let mut regions: Vec<Region> = Vec::new();
        for (start, end) in ranges {
            match regions.last_mut() {
                Some(last) if last.end() == start => {
                    last.data.resize((end - last.start) as usize, 0xFF);
                }
                _ => regions.push(Region {
                    start,
                    data: vec![0xFF; (end - start) as usize],
                }),
            }
        }

        regions.push(Region {
            start: RAM_BASE,
            data: (0..RAM_SIZE).map(|i| (i * 7 % 256) as u8).collect(),
        });

        Self { regions }
    }

    pub fn slice(&self, address: u32, len: usize) -> Option<&[u8]> {
        let region = self.regions.iter().find(|r| r.start <= address && address < r.end())?;
        let offset = (address - region.start) as usize;
        region.data.get(offset..offset.checked_add(len)?)
    }

    pub fn slice_mut(&mut self, address: u32, len: usize) -> Option<&mut [u8]> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.start <= address && address < r.end())?;
        let offset = (address - region.start) as usize;
        region.data.get_mut(offset..offset.checked_add(len)?)
    }

    pub fn write(&mut self, address: u32, data: &[u8]) -> bool {
        match self.slice_mut(address, data.len()) {
            Some(dest) => {
                dest.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn erase(&mut self, start: u32, end: u32) -> bool {
        match self.slice_mut(start, end.saturating_sub(start) as usize) {
            Some(dest) => {
                dest.fill(0xFF);
                true
            }
            None => false,
        }
    }

    /// Program every partition from a file image
    pub fn load_image(&mut self, target: &TargetDescriptor, image: &[u8]) {
        for p in &target.partitions {
            if let Some(range) = p.file_range(image.len()) {
                self.write(p.phys_start, &image[range]);
            }
        }
    }

    /// Reassemble a file image from the partitions
    pub fn to_image(&self, target: &TargetDescriptor) -> Vec<u8> {
        let mut image = vec![0xFF; target.image_len];
        for p in &target.partitions {
            if let (Some(range), Some(data)) = (
                p.file_range(target.image_len),
                self.slice(p.phys_start, p.len()),
            ) {
                image[range].copy_from_slice(data);
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflash_core::TargetId;

    #[test]
    fn test_adjacent_partitions_merge() {
        let memory = Memory::for_target(&TargetId::E39.descriptor());
        // flash, shadow and RAM
        assert_eq!(memory.regions.len(), 3);
        assert!(memory.slice(0x01_FFF0, 0x20).is_some());
        assert!(memory.slice(0x2F_FFF0, 0x20).is_none());
        assert_eq!(memory.slice(0x40_0000, 4), Some(&[0xFF; 4][..]));
    }

    #[test]
    fn test_image_round_trip() {
        let target = TargetId::E39.descriptor();
        let image: Vec<u8> = (0..target.image_len).map(|i| (i >> 8) as u8).collect();
        let mut memory = Memory::for_target(&target);
        memory.load_image(&target, &image);

        assert_eq!(memory.slice(0x40_0000, 2), Some(&image[0x30_0000..0x30_0002]));
        assert!(memory.to_image(&target) == image);
    }

    #[test]
    fn test_erase() {
        let target = TargetId::E78.descriptor();
        let mut memory = Memory::for_target(&target);
        assert!(memory.write(0x1_0000, &[1, 2, 3]));
        assert!(memory.erase(0x1_0000, 0x2_0000));
        assert_eq!(memory.slice(0x1_0000, 3), Some(&[0xFF; 3][..]));
        assert!(!memory.erase(0x20_0000, 0x20_0010));
    }
}
