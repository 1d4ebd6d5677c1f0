//! Facilities for building the patch overlay: a small set of CAM blocks that
//! make the tracer supply fixed content in place of real memory.

use thiserror::Error;

mod load;

pub use load::{load_patch, push_region};

//===========================================================================//

/// The maximum number of CAM blocks the hardware provides.
pub const MAX_BLOCKS: usize = 16;

/// The capacity of the patch content memory, in bytes.
pub const MAX_CONTENT: usize = 2048;

/// The largest block mask the CAM can match, covering the whole 24-bit
/// byte address space of the traced bus.
pub const MAX_BLOCK_MASK: u32 = 0xff_ffff;

//===========================================================================//

/// An error encountered while allocating patch regions.
///
/// These only ever arise while configuring a patch, before a capture starts.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PatchError {
    /// The region's content would not fit in the remaining content memory.
    #[error("patch content full: need {requested} bytes, {available} left")]
    ContentFull {
        /// The (rounded-up) size of the rejected region.
        requested: usize,
        /// The number of content bytes still unallocated.
        available: usize,
    },
    /// Covering the region would take more CAM blocks than remain.
    #[error("out of CAM blocks: need {needed}, {available} left")]
    TooManyBlocks {
        /// The number of blocks the region would have needed.
        needed: usize,
        /// The number of blocks still unallocated.
        available: usize,
    },
    /// The region started at an odd address, which the word-addressed CAM
    /// cannot match.
    #[error("patch region at {addr:#08x} is not word-aligned")]
    UnalignedAddress {
        /// The requested base address.
        addr: u32,
    },
    /// The region extended past the end of the bus address space.
    #[error("patch region {addr:#08x}+{size:#x} is out of range")]
    OutOfRange {
        /// The requested base address.
        addr: u32,
        /// The requested size.
        size: usize,
    },
    /// The region overlapped a region allocated earlier.
    #[error("patch region at {addr:#08x} overlaps an existing region")]
    Overlap {
        /// The requested base address.
        addr: u32,
    },
}

//===========================================================================//

/// One CAM entry: a power-of-two, naturally aligned address block whose
/// reads are served from patch content.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CamBlock {
    /// The byte address of the first byte in the block.
    pub addr: u32,
    /// The block size minus one; always of the form `2^n - 1`.
    pub mask: u32,
    /// The offset of the block's content within the patch content, in
    /// bytes.
    pub content_offset: usize,
}

impl CamBlock {
    /// Returns the number of bytes covered by this block.
    pub fn size(self) -> usize {
        self.mask as usize + 1
    }

    /// Returns the byte address of the last byte in the block.
    pub fn last(self) -> u32 {
        self.addr + self.mask
    }

    /// Returns true if this block covers `addr`.
    pub fn contains(self, addr: u32) -> bool {
        addr & !self.mask == self.addr
    }
}

//===========================================================================//

/// A handle to the content of one allocated region within a [`HwPatch`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PatchRegion {
    addr: u32,
    content_offset: usize,
    len: usize,
}

impl PatchRegion {
    /// Returns the bus address of the start of the region.
    pub fn addr(self) -> u32 {
        self.addr
    }

    /// Returns the offset of the region's content within the patch content.
    pub fn content_offset(self) -> usize {
        self.content_offset
    }

    /// Returns the size of the region in bytes (always even).
    pub fn len(self) -> usize {
        self.len
    }

    /// Returns true if the region covers no bytes.
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    fn overlaps(self, addr: u32, len: usize) -> bool {
        let (start, end) = (u64::from(addr), u64::from(addr) + len as u64);
        let mine = u64::from(self.addr);
        start < mine + self.len as u64 && mine < end
    }
}

//===========================================================================//

/// The patch overlay: backing content plus the CAM blocks that map it onto
/// the bus.
#[derive(Clone, Debug, Default)]
pub struct HwPatch {
    content: Vec<u8>,
    blocks: Vec<CamBlock>,
    regions: Vec<PatchRegion>,
}

impl HwPatch {
    /// Returns an empty patch.
    pub fn new() -> HwPatch {
        HwPatch::default()
    }

    /// Returns the content of all regions, in allocation order.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Returns the CAM blocks, in allocation order.
    pub fn blocks(&self) -> &[CamBlock] {
        &self.blocks
    }

    /// Returns all regions allocated so far.
    pub fn regions(&self) -> &[PatchRegion] {
        &self.regions
    }

    /// Returns the region that starts exactly at `addr`, if any.
    pub fn region_at(&self, addr: u32) -> Option<PatchRegion> {
        self.regions.iter().copied().find(|region| region.addr == addr)
    }

    /// Returns the content of the given region.
    pub fn region_content(&self, region: PatchRegion) -> &[u8] {
        let start = region.content_offset;
        &self.content[start..start + region.len]
    }

    /// Returns the content of the given region, for modification.
    pub fn region_content_mut(&mut self, region: PatchRegion) -> &mut [u8] {
        let start = region.content_offset;
        &mut self.content[start..start + region.len]
    }

    /// Allocates a region of `size` bytes at `base`, covered by as few CAM
    /// blocks as the address alignment allows, and returns its (zeroed)
    /// content for the caller to fill in.
    ///
    /// The size is rounded up to an even number of bytes.  If allocation
    /// fails, the patch is left unchanged.
    pub fn allocate_region(
        &mut self,
        base: u32,
        size: usize,
    ) -> Result<&mut [u8], PatchError> {
        let region = self.allocate(base, size)?;
        Ok(self.region_content_mut(region))
    }

    /// Allocates a region at `base` holding a copy of `content`, padded with
    /// a zero byte if its length is odd.
    pub fn allocate_with(
        &mut self,
        base: u32,
        content: &[u8],
    ) -> Result<PatchRegion, PatchError> {
        let region = self.allocate(base, content.len())?;
        self.region_content_mut(region)[..content.len()]
            .copy_from_slice(content);
        Ok(region)
    }

    fn allocate(
        &mut self,
        base: u32,
        size: usize,
    ) -> Result<PatchRegion, PatchError> {
        if base & 1 != 0 {
            return Err(PatchError::UnalignedAddress { addr: base });
        }
        let size = size.saturating_add(size & 1);
        if u64::from(base) + size as u64 > u64::from(MAX_BLOCK_MASK) + 1 {
            return Err(PatchError::OutOfRange { addr: base, size });
        }
        let available = MAX_CONTENT - self.content.len();
        if size > available {
            return Err(PatchError::ContentFull { requested: size, available });
        }
        if self.regions.iter().any(|region| region.overlaps(base, size)) {
            return Err(PatchError::Overlap { addr: base });
        }
        let content_offset = self.content.len();
        let blocks = split_into_blocks(base, size as u32, content_offset);
        let available = MAX_BLOCKS - self.blocks.len();
        if blocks.len() > available {
            return Err(PatchError::TooManyBlocks {
                needed: blocks.len(),
                available,
            });
        }
        self.blocks.extend(blocks);
        self.content.resize(content_offset + size, 0);
        let region = PatchRegion { addr: base, content_offset, len: size };
        if size > 0 {
            self.regions.push(region);
        }
        Ok(region)
    }
}

/// Greedily covers `size` bytes at `addr` with CAM blocks.  Each block is the
/// largest power of two that both fits in what remains and is aligned at the
/// current address; alignment can force a smaller block than the remaining
/// size alone would allow.
fn split_into_blocks(
    mut addr: u32,
    mut size: u32,
    mut content_offset: usize,
) -> Vec<CamBlock> {
    let mut blocks = Vec::new();
    while size > 0 {
        let mut mask = MAX_BLOCK_MASK;
        while mask >= size || mask & addr != 0 {
            mask >>= 1;
        }
        blocks.push(CamBlock { addr, mask, content_offset });
        addr += mask + 1;
        size -= mask + 1;
        content_offset += mask as usize + 1;
    }
    blocks
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::{
        CamBlock, HwPatch, MAX_BLOCKS, MAX_CONTENT, PatchError,
        split_into_blocks,
    };

    fn check_coverage(blocks: &[CamBlock], base: u32, size: usize) {
        let mut next = base;
        let mut offset = blocks.first().map_or(0, |block| block.content_offset);
        for block in blocks {
            assert!(block.size().is_power_of_two(), "{block:?}");
            assert_eq!(block.addr & block.mask, 0, "{block:?} unaligned");
            assert_eq!(block.addr, next, "gap or overlap at {block:?}");
            assert_eq!(block.content_offset, offset);
            next = block.last() + 1;
            offset += block.size();
        }
        let total: usize = blocks.iter().map(|block| block.size()).sum();
        assert_eq!(total, size);
    }

    #[test]
    fn three_bytes_rounds_to_four() {
        let mut patch = HwPatch::new();
        let content = patch.allocate_region(0x1000, 3).unwrap();
        assert_eq!(content.len(), 4);
        assert_eq!(patch.content().len(), 4);
        check_coverage(patch.blocks(), 0x1000, 4);
    }

    #[test]
    fn alignment_limits_block_size() {
        let blocks = split_into_blocks(0x1002, 8, 0);
        assert_eq!(
            blocks,
            vec![
                CamBlock { addr: 0x1002, mask: 0x1, content_offset: 0 },
                CamBlock { addr: 0x1004, mask: 0x3, content_offset: 2 },
                CamBlock { addr: 0x1008, mask: 0x1, content_offset: 6 },
            ]
        );
        let blocks = split_into_blocks(0x2000, 0x600, 0);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].mask, 0x3ff);
        assert_eq!(blocks[1].addr, 0x2400);
        assert_eq!(blocks[1].mask, 0x1ff);
    }

    #[test]
    fn blocks_cover_request_exactly() {
        let bases = [0x0, 0x2, 0x6, 0x1000, 0x1ffe, 0x3f_ffe0, 0x12_3456];
        for base in bases {
            for size in (0..=MAX_CONTENT).step_by(14).chain([1, 3, 2047]) {
                let mut patch = HwPatch::new();
                let rounded = size + (size & 1);
                let result = patch
                    .allocate_region(base, size)
                    .map(|content| content.len());
                match result {
                    Ok(len) => {
                        assert_eq!(len, rounded);
                        assert!(patch.blocks().len() <= MAX_BLOCKS);
                        check_coverage(patch.blocks(), base, rounded);
                    }
                    Err(PatchError::TooManyBlocks { needed, .. }) => {
                        assert!(needed > MAX_BLOCKS);
                        assert!(patch.blocks().is_empty());
                        assert!(patch.content().is_empty());
                    }
                    Err(error) => panic!("{base:#x}+{size}: {error}"),
                }
            }
        }
    }

    #[test]
    fn content_capacity() {
        let mut patch = HwPatch::new();
        patch.allocate_region(0x10_0000, MAX_CONTENT - 2).unwrap();
        let blocks_before = patch.blocks().len();
        assert_eq!(
            patch.allocate_region(0x20_0000, 3),
            Err(PatchError::ContentFull { requested: 4, available: 2 })
        );
        assert_eq!(patch.blocks().len(), blocks_before);
        assert_eq!(patch.content().len(), MAX_CONTENT - 2);
        assert!(patch.allocate_region(0x20_0000, 2).is_ok());
    }

    #[test]
    fn block_capacity() {
        let mut patch = HwPatch::new();
        for index in 0..MAX_BLOCKS as u32 {
            patch.allocate_region(0x1000 * index, 2).unwrap();
        }
        assert_eq!(
            patch.allocate_region(0x10_0000, 2),
            Err(PatchError::TooManyBlocks { needed: 1, available: 0 })
        );
        assert_eq!(patch.regions().len(), MAX_BLOCKS);
    }

    #[test]
    fn rejects_bad_requests() {
        let mut patch = HwPatch::new();
        assert_eq!(
            patch.allocate_region(0x1001, 4),
            Err(PatchError::UnalignedAddress { addr: 0x1001 })
        );
        assert_eq!(
            patch.allocate_region(0xff_fffe, 4),
            Err(PatchError::OutOfRange { addr: 0xff_fffe, size: 4 })
        );
        patch.allocate_region(0x1000, 0x20).unwrap();
        assert_eq!(
            patch.allocate_region(0x101e, 4),
            Err(PatchError::Overlap { addr: 0x101e })
        );
        assert!(patch.allocate_region(0x1020, 4).is_ok());
    }

    #[test]
    fn regions_track_content() {
        let mut patch = HwPatch::new();
        let first = patch.allocate_with(0x100, b"hello").unwrap();
        let second = patch.allocate_with(0x200, b"hi").unwrap();
        assert_eq!(first.len(), 6);
        assert_eq!(second.content_offset(), 6);
        assert_eq!(patch.region_content(first), b"hello\0");
        assert_eq!(patch.region_at(0x200), Some(second));
        assert_eq!(patch.region_at(0x202), None);
        patch.region_content_mut(second).copy_from_slice(b"yo");
        assert_eq!(patch.content(), b"hello\0yo");
        assert!(patch.blocks().iter().any(|block| block.contains(0x105)));
    }
}

//===========================================================================//
