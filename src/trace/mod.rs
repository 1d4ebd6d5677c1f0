//! Facilities for decoding the bit-packed trace stream into packets and
//! reconstructing bus bursts from them.

mod burst;
mod error;
mod framer;
mod packet;

pub use burst::{
    AccessWidth, Burst, BurstKind, DecoderState, RAM_CLOCK_HZ, Timestamp,
};
pub use error::{DecodeError, MalformedReason};
pub use framer::{PacketFramer, stream_start};
pub use packet::{
    BusCycle, OVERFLOW_PAYLOAD, PAYLOAD_BITS, PAYLOAD_MASK, Packet,
    PacketKind, PacketType,
};

//===========================================================================//
