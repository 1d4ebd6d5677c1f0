//! The interface between a capture session and the tracing hardware.

use std::io;

mod replay;

pub use replay::ReplayTransport;

//===========================================================================//

/// The register controlling which bus cycles are traced.
pub const REG_TRACE_FLAGS: u16 = 0x0000;
/// Trace flag: emit packets for write cycles.
pub const TRACE_WRITES: u16 = 0x0001;
/// Trace flag: emit packets for read cycles.
pub const TRACE_READS: u16 = 0x0002;
/// Trace flag: hold the traced target in reset.
pub const TRACE_RESET: u16 = 0x8000;

/// The first of [`MAX_BLOCKS`](crate::patch::MAX_BLOCKS) registers holding
/// each CAM block's content offset, in words.
pub const REG_PATCH_OFFSETS: u16 = 0x0100;
/// The first of four registers per CAM block: address low/high halves, then
/// mask low/high halves.
pub const REG_CAM: u16 = 0x0200;
/// The first register of patch content memory, one 16-bit word per
/// register.
pub const REG_PATCH_CONTENT: u16 = 0x1000;

//===========================================================================//

/// A connection to the tracing hardware.
///
/// All methods block the calling thread; a capture session calls them from
/// a single thread only.
pub trait Transport {
    /// Writes a 16-bit configuration register.
    fn write_register(&mut self, addr: u16, value: u16) -> io::Result<()>;

    /// Reads a 16-bit configuration register.
    fn read_register(&mut self, addr: u16) -> io::Result<u16>;

    /// Writes a sequence of registers, strictly in the order given.
    ///
    /// The default implementation writes them one at a time; transports that
    /// can batch register writes should override this.
    fn write_registers(&mut self, writes: &[(u16, u16)]) -> io::Result<()> {
        for &(addr, value) in writes {
            self.write_register(addr, value)?;
        }
        Ok(())
    }

    /// Discards any trace bytes already buffered but not yet delivered.
    fn drain(&mut self) -> io::Result<()>;

    /// Replaces the contents of `buffer` with the next chunk of trace bytes,
    /// blocking until one is available.  Returns `false` once the stream
    /// has ended.
    fn read_chunk(&mut self, buffer: &mut Vec<u8>) -> io::Result<bool>;
}

//===========================================================================//
