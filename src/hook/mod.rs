//! The I/O hook channel: remote procedure calls that the traced target makes
//! by writing a request buffer to a reserved address, answered through the
//! patch overlay at that same address.

use crate::patch::{HwPatch, PatchRegion};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use thiserror::Error;

mod service;

pub use service::{
    ConsoleService, EchoService, SVC_CONSOLE, SVC_ECHO, Service,
};

//===========================================================================//

/// The number of 16-bit words in a hook buffer.
pub const HOOK_WORDS: usize = 16;

/// The size of a hook buffer, in bytes.
pub const HOOK_BUFFER_SIZE: usize = 2 * HOOK_WORDS;

/// The largest request or response payload, in bytes.  The rest of the
/// buffer holds the footer.
pub const MAX_HOOK_DATA: usize = HOOK_BUFFER_SIZE - 4;

/// Bit position of the checksum within the footer word.
pub const IOH_CHECK_SHIFT: u32 = 24;
/// Bit position of the sequence number within the footer word.
pub const IOH_SEQ_SHIFT: u32 = 16;
/// Bit position of the service ID within the footer word.
pub const IOH_SVC_SHIFT: u32 = 8;
/// Bit position of the payload length within the footer word.
pub const IOH_LEN_SHIFT: u32 = 0;

//===========================================================================//

/// An error in a single I/O hook call.  The call is dropped, but the hook
/// channel (and the capture) carry on.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum HookError {
    /// The buffer's checksum did not match its data.
    #[error("hook checksum mismatch: carried {carried:#04x}, computed \
             {computed:#04x}")]
    Checksum {
        /// The checksum carried in the footer.
        carried: u8,
        /// The checksum computed from the data words.
        computed: u8,
    },
    /// The buffer's sequence number was not the one expected, meaning a
    /// call was dropped or repeated.
    #[error("hook sequence mismatch: expected {expected}, received \
             {received}")]
    Sequence {
        /// The sequence number expected next.
        expected: u8,
        /// The sequence number carried in the footer.
        received: u8,
    },
    /// The footer claimed more payload than a buffer can hold.
    #[error("hook payload length {length} is too long")]
    Length {
        /// The length carried in the footer.
        length: u8,
    },
    /// No handler was registered for the requested service.
    #[error("no handler for hook service {service:#04x}")]
    UnknownService {
        /// The requested service ID.
        service: u8,
    },
    /// A handler produced a response too long to fit in a buffer.
    #[error("hook service {service:#04x} returned {length} bytes")]
    ResponseTooLong {
        /// The service ID.
        service: u8,
        /// The length of the rejected response.
        length: usize,
    },
}

//===========================================================================//

/// The last 32-bit word of a hook buffer, describing the payload before it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct HookFooter {
    /// Checksum over the seven payload words.
    pub checksum: u8,
    /// Call sequence number, incremented by the target for each call.
    pub sequence: u8,
    /// Which service to call.
    pub service: u8,
    /// Number of meaningful payload bytes.
    pub length: u8,
}

impl HookFooter {
    /// Unpacks a footer word.
    pub fn from_word(word: u32) -> HookFooter {
        HookFooter {
            checksum: (word >> IOH_CHECK_SHIFT) as u8,
            sequence: (word >> IOH_SEQ_SHIFT) as u8,
            service: (word >> IOH_SVC_SHIFT) as u8,
            length: (word >> IOH_LEN_SHIFT) as u8,
        }
    }

    /// Packs this footer into a word.
    pub fn to_word(self) -> u32 {
        u32::from(self.checksum) << IOH_CHECK_SHIFT
            | u32::from(self.sequence) << IOH_SEQ_SHIFT
            | u32::from(self.service) << IOH_SVC_SHIFT
            | u32::from(self.length) << IOH_LEN_SHIFT
    }
}

//===========================================================================//

/// The 32-byte buffer exchanged for one hook call: seven little-endian
/// payload words followed by a [`HookFooter`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IoHookBuffer {
    words: [u16; HOOK_WORDS],
}

impl IoHookBuffer {
    /// The index of the last 16-bit word; storing it completes the buffer.
    pub const LAST_WORD: usize = HOOK_WORDS - 1;

    /// Returns an all-zero buffer.
    pub fn new() -> IoHookBuffer {
        IoHookBuffer::default()
    }

    /// Returns a well-formed buffer carrying `data` (at most
    /// [`MAX_HOOK_DATA`] bytes; any excess is dropped).
    pub fn with_data(service: u8, sequence: u8, data: &[u8]) -> IoHookBuffer {
        let length = data.len().min(MAX_HOOK_DATA);
        let mut bytes = [0u8; HOOK_BUFFER_SIZE];
        bytes[..length].copy_from_slice(&data[..length]);
        let mut buffer = IoHookBuffer::from_bytes(&bytes);
        let footer = HookFooter {
            checksum: buffer.compute_checksum(),
            sequence,
            service,
            length: length as u8,
        };
        buffer.set_footer(footer);
        buffer
    }

    /// Reinterprets 32 bytes of memory as a hook buffer.
    pub fn from_bytes(bytes: &[u8; HOOK_BUFFER_SIZE]) -> IoHookBuffer {
        let mut words = [0u16; HOOK_WORDS];
        LittleEndian::read_u16_into(bytes, &mut words);
        IoHookBuffer { words }
    }

    /// Returns the buffer as it appears in target memory.
    pub fn to_bytes(&self) -> [u8; HOOK_BUFFER_SIZE] {
        let mut bytes = [0u8; HOOK_BUFFER_SIZE];
        LittleEndian::write_u16_into(&self.words, &mut bytes);
        bytes
    }

    /// Stores one 16-bit word.  Returns true if it was the last word, so
    /// the buffer is now complete.  Indices past the end are ignored.
    pub fn store(&mut self, index: usize, value: u16) -> bool {
        if let Some(word) = self.words.get_mut(index) {
            *word = value;
        }
        index == IoHookBuffer::LAST_WORD
    }

    /// Returns the full payload area, regardless of the footer's length.
    pub fn data(&self) -> [u8; MAX_HOOK_DATA] {
        let mut data = [0u8; MAX_HOOK_DATA];
        data.copy_from_slice(&self.to_bytes()[..MAX_HOOK_DATA]);
        data
    }

    /// Returns the footer.
    pub fn footer(&self) -> HookFooter {
        HookFooter::from_word(self.word32(HOOK_WORDS / 2 - 1))
    }

    /// Replaces the footer.
    pub fn set_footer(&mut self, footer: HookFooter) {
        let word = footer.to_word();
        self.words[HOOK_WORDS - 2] = word as u16;
        self.words[HOOK_WORDS - 1] = (word >> 16) as u16;
    }

    /// Computes the checksum of the payload words: their 32-bit wrapping sum,
    /// folded into one byte by adding its four bytes together.
    pub fn compute_checksum(&self) -> u8 {
        let sum = (0..HOOK_WORDS / 2 - 1)
            .fold(0u32, |sum, index| sum.wrapping_add(self.word32(index)));
        sum.to_le_bytes().iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
    }

    fn word32(&self, index: usize) -> u32 {
        u32::from(self.words[2 * index])
            | u32::from(self.words[2 * index + 1]) << 16
    }
}

//===========================================================================//

/// What happened to a hook call that was accepted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HookOutcome {
    /// The handler ran and had nothing to say.
    Handled,
    /// The handler's response was written into the hook's patch region,
    /// which must now be pushed to the hardware.
    Responded,
}

/// Validates completed hook buffers and routes them to registered
/// services.
pub struct HookDispatcher {
    region: PatchRegion,
    expected_sequence: u8,
    services: HashMap<u8, Box<dyn Service>>,
}

impl HookDispatcher {
    /// Returns a dispatcher that writes responses into `region` of the
    /// session's patch.  The region should be [`HOOK_BUFFER_SIZE`] bytes.
    pub fn new(region: PatchRegion) -> HookDispatcher {
        HookDispatcher {
            region,
            expected_sequence: 0,
            services: HashMap::new(),
        }
    }

    /// Registers a handler for the given service ID, replacing any previous
    /// handler for it.
    pub fn register<S: Service + 'static>(
        &mut self,
        service_id: u8,
        service: S,
    ) {
        self.services.insert(service_id, Box::new(service));
    }

    /// Returns the patch region that responses are written into.
    pub fn region(&self) -> PatchRegion {
        self.region
    }

    /// Returns the sequence number that the next call should carry.
    pub fn expected_sequence(&self) -> u8 {
        self.expected_sequence
    }

    /// Validates and dispatches one completed buffer.
    ///
    /// The expected sequence number advances whatever the outcome; after a
    /// sequence mismatch it resynchronizes to follow the received one.
    pub fn on_buffer_complete(
        &mut self,
        buffer: &IoHookBuffer,
        patch: &mut HwPatch,
    ) -> Result<HookOutcome, HookError> {
        let footer = buffer.footer();
        let expected = self.expected_sequence;
        self.expected_sequence = expected.wrapping_add(1);
        let computed = buffer.compute_checksum();
        if computed != footer.checksum {
            return Err(HookError::Checksum {
                carried: footer.checksum,
                computed,
            });
        }
        if footer.sequence != expected {
            self.expected_sequence = footer.sequence.wrapping_add(1);
            return Err(HookError::Sequence {
                expected,
                received: footer.sequence,
            });
        }
        let length = usize::from(footer.length);
        if length > MAX_HOOK_DATA {
            return Err(HookError::Length { length: footer.length });
        }
        let service = self
            .services
            .get_mut(&footer.service)
            .ok_or(HookError::UnknownService { service: footer.service })?;
        let response = service.call(&buffer.data()[..length]);
        log::debug!(
            "hook call #{}: service {:#04x}, {} bytes in, {} bytes out",
            footer.sequence,
            footer.service,
            length,
            response.len()
        );
        if response.is_empty() {
            return Ok(HookOutcome::Handled);
        }
        if response.len() > MAX_HOOK_DATA {
            return Err(HookError::ResponseTooLong {
                service: footer.service,
                length: response.len(),
            });
        }
        let reply =
            IoHookBuffer::with_data(footer.service, footer.sequence, &response);
        let content = patch.region_content_mut(self.region);
        let len = content.len().min(HOOK_BUFFER_SIZE);
        content[..len].copy_from_slice(&reply.to_bytes()[..len]);
        Ok(HookOutcome::Responded)
    }
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::{
        EchoService, HOOK_BUFFER_SIZE, HookDispatcher, HookError, HookFooter,
        HookOutcome, IoHookBuffer, MAX_HOOK_DATA,
    };
    use crate::patch::HwPatch;
    use std::cell::RefCell;
    use std::rc::Rc;

    const HOOK_ADDR: u32 = 0x3f_ffe0;

    fn make_dispatcher() -> (HookDispatcher, HwPatch) {
        let mut patch = HwPatch::new();
        patch.allocate_region(HOOK_ADDR, HOOK_BUFFER_SIZE).unwrap();
        let region = patch.region_at(HOOK_ADDR).unwrap();
        (HookDispatcher::new(region), patch)
    }

    #[test]
    fn footer_layout() {
        let footer = HookFooter {
            checksum: 0xaa,
            sequence: 0x12,
            service: 0x34,
            length: 0x1c,
        };
        assert_eq!(footer.to_word(), 0xaa12_341c);
        assert_eq!(HookFooter::from_word(0xaa12_341c), footer);
    }

    #[test]
    fn buffer_layout() {
        let buffer = IoHookBuffer::with_data(0x02, 0x05, &[1, 2, 3]);
        let bytes = buffer.to_bytes();
        assert_eq!(&bytes[..4], &[1, 2, 3, 0]);
        // Footer is the last little-endian word: length, service, sequence,
        // checksum.
        assert_eq!(&bytes[28..31], &[3, 0x02, 0x05]);
        assert_eq!(bytes[31], 6);
        assert_eq!(IoHookBuffer::from_bytes(&bytes), buffer);
    }

    #[test]
    fn checksum_folds_wrapping_sum() {
        let mut bytes = [0u8; HOOK_BUFFER_SIZE];
        bytes[..8].copy_from_slice(&[0xff, 0xff, 0xff, 0xff, 0x02, 0, 0, 0]);
        // 0xffffffff + 2 wraps to 1.
        let buffer = IoHookBuffer::from_bytes(&bytes);
        assert_eq!(buffer.compute_checksum(), 1);
        bytes[4] = 0;
        bytes[8..12].copy_from_slice(&[0x80, 0x80, 0x01, 0x00]);
        let buffer = IoHookBuffer::from_bytes(&bytes);
        // 0xffffffff + 0x18080 = 0x1807f; 0x7f + 0x80 + 0x01 = 0x100 -> 0.
        assert_eq!(buffer.compute_checksum(), 0);
    }

    #[test]
    fn store_reports_completion() {
        let mut buffer = IoHookBuffer::new();
        for index in 0..IoHookBuffer::LAST_WORD {
            assert!(!buffer.store(index, index as u16));
        }
        assert!(buffer.store(IoHookBuffer::LAST_WORD, 0xabcd));
        assert!(!buffer.store(16, 0xffff));
        assert_eq!(buffer.to_bytes()[30..], [0xcd, 0xab]);
    }

    #[test]
    fn dispatches_valid_call() {
        let (mut dispatcher, mut patch) = make_dispatcher();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let log = calls.clone();
        dispatcher.register(0x42, move |request: &[u8]| {
            log.borrow_mut().push(request.to_vec());
            Vec::new()
        });
        let buffer = IoHookBuffer::with_data(0x42, 0, b"abcde");
        assert_eq!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Ok(HookOutcome::Handled)
        );
        assert_eq!(*calls.borrow(), vec![b"abcde".to_vec()]);
        assert_eq!(dispatcher.expected_sequence(), 1);
        assert!(patch.content().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn response_lands_in_region() {
        let (mut dispatcher, mut patch) = make_dispatcher();
        dispatcher.register(0x02, EchoService);
        let request = IoHookBuffer::with_data(0x02, 0, b"ping");
        assert_eq!(
            dispatcher.on_buffer_complete(&request, &mut patch),
            Ok(HookOutcome::Responded)
        );
        let region = dispatcher.region();
        let bytes: [u8; HOOK_BUFFER_SIZE] =
            patch.region_content(region).try_into().unwrap();
        let reply = IoHookBuffer::from_bytes(&bytes);
        assert_eq!(reply, request);
        assert_eq!(reply.footer().sequence, 0);
        assert_eq!(reply.footer().service, 0x02);
        assert_eq!(reply.footer().checksum, reply.compute_checksum());
    }

    #[test]
    fn bad_checksum_still_advances_sequence() {
        let (mut dispatcher, mut patch) = make_dispatcher();
        dispatcher.register(0x02, EchoService);
        let mut buffer = IoHookBuffer::with_data(0x02, 0, b"data");
        let mut footer = buffer.footer();
        footer.checksum ^= 0x01;
        buffer.set_footer(footer);
        assert!(matches!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Err(HookError::Checksum { .. })
        ));
        assert_eq!(dispatcher.expected_sequence(), 1);
        assert!(patch.content().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn sequence_mismatch_resynchronizes() {
        let (mut dispatcher, mut patch) = make_dispatcher();
        dispatcher.register(0x02, EchoService);
        let buffer = IoHookBuffer::with_data(0x02, 7, b"x");
        assert_eq!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Err(HookError::Sequence { expected: 0, received: 7 })
        );
        assert_eq!(dispatcher.expected_sequence(), 8);
        let buffer = IoHookBuffer::with_data(0x02, 8, b"y");
        assert_eq!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Ok(HookOutcome::Responded)
        );
    }

    #[test]
    fn sequence_wraps() {
        let (mut dispatcher, mut patch) = make_dispatcher();
        dispatcher.register(0x02, |_: &[u8]| Vec::new());
        for sequence in 0..=300u32 {
            let buffer = IoHookBuffer::with_data(0x02, sequence as u8, &[]);
            assert_eq!(
                dispatcher.on_buffer_complete(&buffer, &mut patch),
                Ok(HookOutcome::Handled)
            );
        }
        assert_eq!(dispatcher.expected_sequence(), 301u32 as u8);
    }

    #[test]
    fn rejects_bad_length_and_service() {
        let (mut dispatcher, mut patch) = make_dispatcher();
        dispatcher.register(0x02, |_: &[u8]| vec![0; MAX_HOOK_DATA + 1]);
        let mut buffer = IoHookBuffer::with_data(0x02, 0, &[]);
        let mut footer = buffer.footer();
        footer.length = MAX_HOOK_DATA as u8 + 1;
        buffer.set_footer(footer);
        assert_eq!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Err(HookError::Length { length: 29 })
        );
        let buffer = IoHookBuffer::with_data(0x09, 1, &[]);
        assert_eq!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Err(HookError::UnknownService { service: 0x09 })
        );
        let buffer = IoHookBuffer::with_data(0x02, 2, &[]);
        assert_eq!(
            dispatcher.on_buffer_complete(&buffer, &mut patch),
            Err(HookError::ResponseTooLong { service: 0x02, length: 29 })
        );
        assert_eq!(dispatcher.expected_sequence(), 3);
    }
}

//===========================================================================//
