use super::error::{DecodeError, MalformedReason};
use super::packet::{BusCycle, PAYLOAD_MASK, Packet, PacketKind};
use std::fmt;
use std::mem;

//===========================================================================//

/// The frequency of the traced bus clock, in Hz.
pub const RAM_CLOCK_HZ: u64 = 16_756_991;

//===========================================================================//

/// A point in time on the traced bus, counted in bus clocks since the start
/// of the capture.
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The start of the capture.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Returns a timestamp for the given clock count.
    pub fn from_clocks(clocks: u64) -> Timestamp {
        Timestamp(clocks)
    }

    /// Returns the number of bus clocks since the start of the capture.
    pub fn clocks(self) -> u64 {
        self.0
    }

    /// Returns the time since the start of the capture, in seconds.
    pub fn seconds(self) -> f64 {
        self.0 as f64 / RAM_CLOCK_HZ as f64
    }

    fn advance(&mut self, clocks: u64) {
        self.0 = self.0.wrapping_add(clocks);
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:.6}", self.seconds())
    }
}

//===========================================================================//

/// The direction of a burst.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BurstKind {
    /// The target read from memory.
    Read,
    /// The target wrote to memory.
    Write,
}

/// How many byte lanes each cycle of a burst used.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AccessWidth {
    /// One byte lane per cycle.
    Byte,
    /// Both byte lanes per cycle.
    Word,
}

//===========================================================================//

/// A contiguous run of same-direction, same-width bus cycles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Burst {
    serial: u64,
    kind: BurstKind,
    width: AccessWidth,
    start: u32,
    timestamp: Timestamp,
    data: Vec<u8>,
}

impl Burst {
    /// Returns the position of this burst among all bursts begun by the
    /// decoder, starting from zero.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns the direction of this burst.
    pub fn kind(&self) -> BurstKind {
        self.kind
    }

    /// Returns the access width used by every cycle of this burst.
    pub fn width(&self) -> AccessWidth {
        self.width
    }

    /// Returns the byte address of the first byte in the burst.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Returns the time of the burst's first cycle.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the bytes transferred so far, in address order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the number of bytes transferred so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no bytes have been transferred yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn mismatch(
        &self,
        kind: BurstKind,
        width: AccessWidth,
    ) -> Option<MalformedReason> {
        if kind != self.kind {
            Some(MalformedReason::DirectionChange)
        } else if width != self.width {
            Some(MalformedReason::MixedWidth)
        } else {
            None
        }
    }

    fn append(&mut self, cycle: BusCycle) {
        match self.width {
            AccessWidth::Word => {
                self.data.extend_from_slice(&cycle.data.to_le_bytes())
            }
            AccessWidth::Byte if cycle.upper_enable => {
                self.data.push((cycle.data >> 8) as u8)
            }
            AccessWidth::Byte => self.data.push(cycle.data as u8),
        }
    }
}

//===========================================================================//

enum BurstState {
    Idle,
    Open(Burst),
    // A malformed burst was dropped; cycles are ignored until the next ADDR.
    Discarding,
}

/// The state of the trace decoder between packets.
///
/// One `DecoderState` lives for exactly one capture session; independent
/// sessions each get their own.
pub struct DecoderState {
    timestamp: Timestamp,
    next_addr: u32,
    burst: BurstState,
    next_serial: u64,
}

impl DecoderState {
    /// Returns the state at the start of a capture.
    pub fn new() -> DecoderState {
        DecoderState {
            timestamp: Timestamp::ZERO,
            next_addr: 0,
            burst: BurstState::Idle,
            next_serial: 0,
        }
    }

    /// Returns the current time on the traced bus.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the word address that the next bus cycle will access.
    pub fn next_addr(&self) -> u32 {
        self.next_addr
    }

    /// Returns the burst in progress, if any.
    pub fn open_burst(&self) -> Option<&Burst> {
        match &self.burst {
            BurstState::Open(burst) => Some(burst),
            BurstState::Idle | BurstState::Discarding => None,
        }
    }

    /// Applies one packet, returning the burst that it completed, if any.
    ///
    /// A malformed burst is discarded and reported as an error; decoding
    /// may continue afterwards, with the next burst starting at the next
    /// ADDR packet.  An overflow packet leaves the state unchanged.
    pub fn advance(
        &mut self,
        packet: Packet,
    ) -> Result<Option<Burst>, DecodeError> {
        if packet.is_overflow() {
            return Err(DecodeError::Overflow {
                clocks: self.timestamp.clocks(),
            });
        }
        match packet.kind() {
            PacketKind::Addr(addr) => {
                self.timestamp.advance(1);
                self.next_addr = addr;
                Ok(self.finish())
            }
            PacketKind::Timestamp(clocks) => {
                self.timestamp.advance(u64::from(clocks));
                Ok(None)
            }
            PacketKind::Read(cycle) => self.bus_cycle(BurstKind::Read, cycle),
            PacketKind::Write(cycle) => {
                self.bus_cycle(BurstKind::Write, cycle)
            }
        }
    }

    /// Ends the burst in progress (if any) and returns it.
    pub fn finish(&mut self) -> Option<Burst> {
        match mem::replace(&mut self.burst, BurstState::Idle) {
            BurstState::Open(burst) => Some(burst),
            BurstState::Idle | BurstState::Discarding => None,
        }
    }

    fn bus_cycle(
        &mut self,
        kind: BurstKind,
        cycle: BusCycle,
    ) -> Result<Option<Burst>, DecodeError> {
        self.timestamp.advance(u64::from(cycle.delta) + 1);
        let word_addr = self.next_addr;
        self.next_addr = (self.next_addr + 1) & PAYLOAD_MASK;
        if !cycle.upper_enable && !cycle.lower_enable {
            return Ok(None);
        }
        let width = match cycle.is_word() {
            true => AccessWidth::Word,
            false => AccessWidth::Byte,
        };
        let malformed = match &self.burst {
            BurstState::Discarding => return Ok(None),
            BurstState::Idle => None,
            BurstState::Open(burst) => burst
                .mismatch(kind, width)
                .map(|reason| (burst.start, reason)),
        };
        if let Some((addr, reason)) = malformed {
            self.burst = BurstState::Discarding;
            return Err(DecodeError::MalformedBurst { addr, reason });
        }
        if let BurstState::Idle = self.burst {
            let odd = if cycle.lower_enable { 0 } else { 1 };
            self.burst = BurstState::Open(Burst {
                serial: self.next_serial,
                kind,
                width,
                start: (word_addr << 1) | odd,
                timestamp: self.timestamp,
                data: Vec::new(),
            });
            self.next_serial += 1;
        }
        if let BurstState::Open(burst) = &mut self.burst {
            burst.append(cycle);
        }
        Ok(None)
    }
}

impl Default for DecoderState {
    fn default() -> DecoderState {
        DecoderState::new()
    }
}

//===========================================================================//


//===========================================================================//
