use thiserror::Error;

//===========================================================================//

/// Why a burst was judged malformed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MalformedReason {
    /// A read cycle arrived during a write burst, or vice versa.
    DirectionChange,
    /// Byte-wide and word-wide cycles were mixed within one burst.
    MixedWidth,
}

//===========================================================================//

/// An error encountered while decoding the trace stream.
///
/// Only [`DecodeError::Overflow`] is fatal to a capture session; the other
/// variants are data-quality events, after which decoding carries on.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    /// The framing bits did not match, so one byte was discarded to regain
    /// packet alignment.
    #[error("lost packet sync, discarded byte {byte:#04x}")]
    Sync {
        /// The discarded byte.
        byte: u8,
    },
    /// A packet's checksum did not match its type and payload.
    #[error("checksum mismatch in packet {word:#010x}")]
    Checksum {
        /// The raw packet word.
        word: u32,
    },
    /// The burst in progress was inconsistent and has been discarded.
    #[error("malformed burst at {addr:#08x} ({reason:?})")]
    MalformedBurst {
        /// The start address of the discarded burst.
        addr: u32,
        /// What was wrong with it.
        reason: MalformedReason,
    },
    /// The tracing hardware overran its internal buffer; everything after
    /// this point in the stream is unreliable.
    #[error("trace buffer overflow after {clocks} clocks")]
    Overflow {
        /// The timestamp at which the overflow was reported.
        clocks: u64,
    },
}

impl DecodeError {
    /// Returns true if this error must end the capture session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Overflow { .. })
    }
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::{DecodeError, MalformedReason};

    #[test]
    fn only_overflow_is_fatal() {
        assert!(!DecodeError::Sync { byte: 0 }.is_fatal());
        assert!(!DecodeError::Checksum { word: 0 }.is_fatal());
        let reason = MalformedReason::MixedWidth;
        assert!(!DecodeError::MalformedBurst { addr: 0, reason }.is_fatal());
        assert!(DecodeError::Overflow { clocks: 0 }.is_fatal());
    }

    #[test]
    fn display() {
        let error = DecodeError::Checksum { word: 0x8000_0006 };
        assert_eq!(error.to_string(), "checksum mismatch in packet 0x80000006");
        let error = DecodeError::Sync { byte: 0x5 };
        assert_eq!(error.to_string(), "lost packet sync, discarded byte 0x05");
    }
}

//===========================================================================//
