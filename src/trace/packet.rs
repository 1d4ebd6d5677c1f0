use byteorder::{BigEndian, ByteOrder};
use std::fmt;

//===========================================================================//

const FRAMING_MASK: u32 = 0x8080_8080;
const FRAMING_VALUE: u32 = 0x8000_0000;

const TYPE_SHIFT: u32 = 29;
const CHECK_MASK: u32 = 0x7;

/// Bit groups of the payload within a trace word, as `(word_shift,
/// payload_shift, width)`, from the least significant payload bit up.
const PAYLOAD_GROUPS: [(u32, u32, u32); 4] =
    [(3, 0, 4), (8, 4, 7), (16, 11, 7), (24, 18, 5)];

/// The number of meaningful bits in a packet payload.
pub const PAYLOAD_BITS: u32 = 23;

/// A mask covering all payload bits.
pub const PAYLOAD_MASK: u32 = (1 << PAYLOAD_BITS) - 1;

/// The payload value the hardware emits when its internal buffer overruns.
pub const OVERFLOW_PAYLOAD: u32 = PAYLOAD_MASK;

//===========================================================================//

/// The four kinds of trace packet.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PacketType {
    /// Sets the word address for subsequent bus cycles.
    Addr,
    /// A write cycle on the traced bus.
    Write,
    /// A read cycle on the traced bus.
    Read,
    /// Advances the timestamp without any bus activity.
    Timestamp,
}

impl PacketType {
    /// All packet types, in wire order.
    pub const ALL: [PacketType; 4] = [
        PacketType::Addr,
        PacketType::Write,
        PacketType::Read,
        PacketType::Timestamp,
    ];

    fn from_bits(bits: u32) -> PacketType {
        match bits & 0x3 {
            0 => PacketType::Addr,
            1 => PacketType::Write,
            2 => PacketType::Read,
            _ => PacketType::Timestamp,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            PacketType::Addr => 0,
            PacketType::Write => 1,
            PacketType::Read => 2,
            PacketType::Timestamp => 3,
        }
    }
}

//===========================================================================//

/// One bus cycle, as carried in the payload of a READ or WRITE packet.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BusCycle {
    /// Clocks elapsed since the previous packet, minus one.
    pub delta: u8,
    /// True if the upper (odd) byte lane was active.
    pub upper_enable: bool,
    /// True if the lower (even) byte lane was active.
    pub lower_enable: bool,
    /// The 16-bit value on the data bus.
    pub data: u16,
}

impl BusCycle {
    const DELTA_SHIFT: u32 = 18;
    const UPPER_BIT: u32 = 1 << 17;
    const LOWER_BIT: u32 = 1 << 16;

    /// Returns a full-width cycle carrying `data`.
    pub fn word(delta: u8, data: u16) -> BusCycle {
        BusCycle { delta, upper_enable: true, lower_enable: true, data }
    }

    /// Returns a byte-wide cycle.  `upper` selects the odd byte lane;
    /// `value` is placed on that lane.
    pub fn byte(delta: u8, upper: bool, value: u8) -> BusCycle {
        let data = if upper { u16::from(value) << 8 } else { value.into() };
        BusCycle { delta, upper_enable: upper, lower_enable: !upper, data }
    }

    /// Splits a READ/WRITE payload into its fields.
    pub fn from_payload(payload: u32) -> BusCycle {
        BusCycle {
            delta: ((payload >> BusCycle::DELTA_SHIFT) & 0x1f) as u8,
            upper_enable: payload & BusCycle::UPPER_BIT != 0,
            lower_enable: payload & BusCycle::LOWER_BIT != 0,
            data: payload as u16,
        }
    }

    /// Packs this cycle back into a 23-bit payload.
    pub fn to_payload(self) -> u32 {
        let mut payload = (u32::from(self.delta) & 0x1f)
            << BusCycle::DELTA_SHIFT
            | u32::from(self.data);
        if self.upper_enable {
            payload |= BusCycle::UPPER_BIT;
        }
        if self.lower_enable {
            payload |= BusCycle::LOWER_BIT;
        }
        payload
    }

    /// Returns true if both byte lanes were active.
    pub fn is_word(self) -> bool {
        self.upper_enable && self.lower_enable
    }
}

//===========================================================================//

/// A decoded packet, with its payload interpreted according to its type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketKind {
    /// A new word address.
    Addr(u32),
    /// A number of idle clocks.
    Timestamp(u32),
    /// A read cycle.
    Read(BusCycle),
    /// A write cycle.
    Write(BusCycle),
}

//===========================================================================//

/// One 32-bit trace packet, exactly as it arrived on the wire.
///
/// A `Packet` can be constructed from any four bytes; whether those bytes
/// actually form a valid packet is reported by [`Packet::is_aligned`] and
/// [`Packet::is_checksum_valid`] rather than by failing to decode.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Packet(u32);

impl Packet {
    /// The number of bytes in one packet on the wire.
    pub const SIZE: usize = 4;

    /// Reassembles four wire bytes (big-endian) into a packet.
    pub fn decode(bytes: [u8; 4]) -> Packet {
        Packet(BigEndian::read_u32(&bytes))
    }

    /// Encodes a packet of the given type and payload, with correct framing
    /// and checksum.  Payload bits above bit 22 are ignored.
    pub fn encode(packet_type: PacketType, payload: u32) -> Packet {
        let payload = payload & PAYLOAD_MASK;
        let mut word = FRAMING_VALUE | (packet_type.to_bits() << TYPE_SHIFT);
        for (word_shift, payload_shift, width) in PAYLOAD_GROUPS {
            let group = (payload >> payload_shift) & ((1 << width) - 1);
            word |= group << word_shift;
        }
        word |= checksum(packet_type.to_bits(), payload);
        Packet(word)
    }

    /// Returns the packet as a raw 32-bit word.
    pub fn word(self) -> u32 {
        self.0
    }

    /// Returns the four wire bytes of this packet.
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, self.0);
        bytes
    }

    /// Returns true if the framing bit of each byte matches the expected
    /// pattern (set in the first byte, clear in the other three).
    pub fn is_aligned(self) -> bool {
        self.0 & FRAMING_MASK == FRAMING_VALUE
    }

    /// Returns the type field of this packet.
    pub fn packet_type(self) -> PacketType {
        PacketType::from_bits(self.0 >> TYPE_SHIFT)
    }

    /// Returns the 23-bit payload of this packet.
    pub fn payload(self) -> u32 {
        let mut payload = 0;
        for (word_shift, payload_shift, width) in PAYLOAD_GROUPS {
            let group = (self.0 >> word_shift) & ((1 << width) - 1);
            payload |= group << payload_shift;
        }
        payload
    }

    /// Returns the checksum field carried in the packet.
    pub fn check(self) -> u32 {
        self.0 & CHECK_MASK
    }

    /// Returns true if the carried checksum matches the type and payload.
    pub fn is_checksum_valid(self) -> bool {
        self.check()
            == checksum(self.packet_type().to_bits(), self.payload())
    }

    /// Returns true if this packet signals a hardware buffer overrun.
    pub fn is_overflow(self) -> bool {
        self.payload() == OVERFLOW_PAYLOAD
    }

    /// Returns the payload interpreted according to the packet type.
    pub fn kind(self) -> PacketKind {
        let payload = self.payload();
        match self.packet_type() {
            PacketType::Addr => PacketKind::Addr(payload),
            PacketType::Timestamp => PacketKind::Timestamp(payload),
            PacketType::Read => {
                PacketKind::Read(BusCycle::from_payload(payload))
            }
            PacketType::Write => {
                PacketKind::Write(BusCycle::from_payload(payload))
            }
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "Packet({:08x}: {:?} {:06x})",
            self.0,
            self.packet_type(),
            self.payload()
        )
    }
}

/// Computes the 3-bit packet checksum: the inverted sum, modulo 8, of the
/// type and each 3-bit window of the payload.
fn checksum(type_bits: u32, payload: u32) -> u32 {
    let mut sum = type_bits;
    for window in 0..8 {
        sum += (payload >> (3 * window)) & 0x7;
    }
    !sum & CHECK_MASK
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::{
        BusCycle, OVERFLOW_PAYLOAD, PAYLOAD_MASK, Packet, PacketKind,
        PacketType,
    };

    #[test]
    fn known_addr_packet() {
        let packet = Packet::decode([0x80, 0x00, 0x00, 0x07]);
        assert!(packet.is_aligned());
        assert!(packet.is_checksum_valid());
        assert_eq!(packet.packet_type(), PacketType::Addr);
        assert_eq!(packet.payload(), 0);
        assert_eq!(packet.kind(), PacketKind::Addr(0));
        assert_eq!(Packet::encode(PacketType::Addr, 0), packet);
    }

    #[test]
    fn framing_bits() {
        assert!(!Packet::decode([0x00, 0x00, 0x00, 0x07]).is_aligned());
        assert!(!Packet::decode([0x80, 0x80, 0x00, 0x07]).is_aligned());
        assert!(!Packet::decode([0x80, 0x00, 0x80, 0x07]).is_aligned());
        assert!(!Packet::decode([0x80, 0x00, 0x00, 0x87]).is_aligned());
        for packet_type in PacketType::ALL {
            assert!(Packet::encode(packet_type, PAYLOAD_MASK).is_aligned());
        }
    }

    #[test]
    fn round_trip_every_payload() {
        let single_bits = (0..23).map(|bit| 1u32 << bit);
        let strided = (0..=PAYLOAD_MASK).step_by(97);
        let payloads: Vec<u32> = single_bits.chain(strided).collect();
        for packet_type in PacketType::ALL {
            for &payload in &payloads {
                let packet = Packet::encode(packet_type, payload);
                let decoded = Packet::decode(packet.to_bytes());
                assert_eq!(decoded.packet_type(), packet_type);
                assert_eq!(decoded.payload(), payload);
                assert!(decoded.is_aligned());
                assert!(decoded.is_checksum_valid());
            }
        }
    }

    #[test]
    fn payload_bit_positions() {
        // Each payload bit lands in exactly one non-framing word bit.
        let mut seen = 0u32;
        for bit in 0..23 {
            let word = Packet::encode(PacketType::Addr, 1 << bit).word()
                & !0x8000_0007;
            assert_eq!(word.count_ones(), 1, "payload bit {bit}");
            assert_eq!(word & seen, 0);
            seen |= word;
        }
        assert_eq!(seen, 0x1f7f_7f78);
    }

    #[test]
    fn checksum_detects_corruption() {
        let packet = Packet::encode(PacketType::Write, 0x12345);
        for bit in [3, 8, 16, 24, 29, 30] {
            let corrupted = Packet::decode((packet.word() ^ (1 << bit))
                .to_be_bytes());
            assert!(corrupted.is_aligned());
            assert!(!corrupted.is_checksum_valid(), "bit {bit}");
        }
        let bad_check = Packet::decode((packet.word() ^ 1).to_be_bytes());
        assert!(!bad_check.is_checksum_valid());
    }

    #[test]
    fn decoding_is_deterministic() {
        let bytes = [0x93, 0x12, 0x5a, 0x3b];
        let first = Packet::decode(bytes);
        let second = Packet::decode(bytes);
        assert_eq!(first.payload(), second.payload());
        assert_eq!(first.is_checksum_valid(), second.is_checksum_valid());
    }

    #[test]
    fn overflow_sentinel() {
        for packet_type in PacketType::ALL {
            let overflow = Packet::encode(packet_type, OVERFLOW_PAYLOAD);
            assert!(overflow.is_overflow());
            assert!(!Packet::encode(packet_type, 0x3f_ffff).is_overflow());
        }
    }

    #[test]
    fn bus_cycle_fields() {
        let cycle = BusCycle::word(5, 0xbeef);
        assert_eq!(cycle.to_payload(), (5 << 18) | (3 << 16) | 0xbeef);
        assert_eq!(BusCycle::from_payload(cycle.to_payload()), cycle);
        let packet = Packet::encode(PacketType::Write, cycle.to_payload());
        assert_eq!(packet.kind(), PacketKind::Write(cycle));

        let low = BusCycle::byte(0, false, 0x42);
        assert_eq!(low.data, 0x0042);
        assert!(low.lower_enable && !low.upper_enable && !low.is_word());
        let high = BusCycle::byte(31, true, 0x42);
        assert_eq!(high.data, 0x4200);
        assert!(high.upper_enable && !high.lower_enable);
        assert_eq!(BusCycle::from_payload(high.to_payload()), high);
    }
}

//===========================================================================//
