use super::{HwPatch, PatchRegion};
use crate::transport::{
    REG_CAM, REG_PATCH_CONTENT, REG_PATCH_OFFSETS, Transport,
};
use byteorder::{ByteOrder, LittleEndian};
use std::io;

//===========================================================================//

/// Loads the whole patch into the hardware.
///
/// Content is written first, then block offsets, then CAM entries, so that
/// no CAM entry becomes active while the content it refers to is still
/// stale.
pub fn load_patch<T: Transport + ?Sized>(
    transport: &mut T,
    patch: &HwPatch,
) -> io::Result<()> {
    let mut writes = content_writes(patch.content(), 0);
    for (index, block) in patch.blocks().iter().enumerate() {
        let offset = (block.content_offset / 2) as u16;
        writes.push((REG_PATCH_OFFSETS + index as u16, offset));
    }
    for (index, block) in patch.blocks().iter().enumerate() {
        let base = REG_CAM + 4 * index as u16;
        writes.push((base, block.addr as u16));
        writes.push((base + 1, (block.addr >> 16) as u16));
        writes.push((base + 2, block.mask as u16));
        writes.push((base + 3, (block.mask >> 16) as u16));
    }
    log::debug!(
        "loading patch: {} content bytes, {} CAM blocks",
        patch.content().len(),
        patch.blocks().len()
    );
    transport.write_registers(&writes)
}

/// Rewrites the content of a single region in the hardware, leaving the CAM
/// configuration untouched.
pub fn push_region<T: Transport + ?Sized>(
    transport: &mut T,
    patch: &HwPatch,
    region: PatchRegion,
) -> io::Result<()> {
    let writes =
        content_writes(patch.region_content(region), region.content_offset());
    transport.write_registers(&writes)
}

fn content_writes(content: &[u8], byte_offset: usize) -> Vec<(u16, u16)> {
    let first = REG_PATCH_CONTENT as usize + byte_offset / 2;
    content
        .chunks_exact(2)
        .enumerate()
        .map(|(index, word)| {
            ((first + index) as u16, LittleEndian::read_u16(word))
        })
        .collect()
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::{load_patch, push_region};
    use crate::patch::HwPatch;
    use crate::transport::{
        REG_CAM, REG_PATCH_CONTENT, REG_PATCH_OFFSETS, ReplayTransport,
    };

    #[test]
    fn content_then_offsets_then_cam() {
        let mut patch = HwPatch::new();
        patch.allocate_with(0x1002, &[1, 2, 3, 4, 5, 6]).unwrap();
        let mut transport = ReplayTransport::new(&[][..]);
        load_patch(&mut transport, &patch).unwrap();
        assert_eq!(
            transport.writes(),
            &[
                (REG_PATCH_CONTENT, 0x0201),
                (REG_PATCH_CONTENT + 1, 0x0403),
                (REG_PATCH_CONTENT + 2, 0x0605),
                (REG_PATCH_OFFSETS, 0),
                (REG_PATCH_OFFSETS + 1, 1),
                (REG_CAM, 0x1002),
                (REG_CAM + 1, 0),
                (REG_CAM + 2, 1),
                (REG_CAM + 3, 0),
                (REG_CAM + 4, 0x1004),
                (REG_CAM + 5, 0),
                (REG_CAM + 6, 3),
                (REG_CAM + 7, 0),
            ]
        );
    }

    #[test]
    fn high_address_bits() {
        let mut patch = HwPatch::new();
        patch.allocate_region(0x3f_0000, 0x100).unwrap();
        let mut transport = ReplayTransport::new(&[][..]);
        load_patch(&mut transport, &patch).unwrap();
        assert_eq!(transport.register(REG_CAM), 0x0000);
        assert_eq!(transport.register(REG_CAM + 1), 0x003f);
        assert_eq!(transport.register(REG_CAM + 2), 0x00ff);
    }

    #[test]
    fn push_single_region() {
        let mut patch = HwPatch::new();
        patch.allocate_with(0x100, &[0; 4]).unwrap();
        let region = patch.allocate_with(0x200, &[0xaa, 0xbb]).unwrap();
        let mut transport = ReplayTransport::new(&[][..]);
        push_region(&mut transport, &patch, region).unwrap();
        assert_eq!(transport.writes(), &[(REG_PATCH_CONTENT + 2, 0xbbaa)]);
    }
}

//===========================================================================//
