use super::error::DecodeError;
use super::packet::Packet;

//===========================================================================//

/// Returns the offset of the first byte in `chunk` that could begin a
/// packet, or `None` if there is no such byte.
///
/// The tracer may emit the tail of a packet before a capture officially
/// starts; only the first byte of each packet has its high bit set.
pub fn stream_start(chunk: &[u8]) -> Option<usize> {
    chunk.iter().position(|&byte| byte & 0x80 != 0)
}

//===========================================================================//

/// Splits a stream of arbitrarily-sized chunks into packets.
///
/// Bytes that don't yet make up a whole packet are carried over to the next
/// call to [`PacketFramer::push`], so packet boundaries are preserved across
/// chunk boundaries.
#[derive(Default)]
pub struct PacketFramer {
    pending: Vec<u8>,
    position: usize,
}

impl PacketFramer {
    /// Returns a new framer with nothing buffered.
    pub fn new() -> PacketFramer {
        PacketFramer::default()
    }

    /// Appends a chunk of stream bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.drain(..self.position);
        self.position = 0;
        self.pending.extend_from_slice(chunk);
    }

    /// Returns the number of bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.pending.len() - self.position
    }

    /// Returns the next packet in the stream, or `None` if fewer than four
    /// bytes are buffered.
    ///
    /// If the next four bytes aren't correctly framed, a single byte is
    /// discarded and [`DecodeError::Sync`] is returned; calling again
    /// continues the search for alignment.
    pub fn next_packet(&mut self) -> Option<Result<Packet, DecodeError>> {
        let end = self.position + Packet::SIZE;
        let bytes: [u8; Packet::SIZE] =
            self.pending.get(self.position..end)?.try_into().ok()?;
        let packet = Packet::decode(bytes);
        if packet.is_aligned() {
            self.position += Packet::SIZE;
            Some(Ok(packet))
        } else {
            self.position += 1;
            Some(Err(DecodeError::Sync { byte: bytes[0] }))
        }
    }
}

//===========================================================================//


//===========================================================================//
