//! Facilities for running a live capture session: streaming the trace,
//! persisting it raw, and servicing I/O hook calls as they arrive.

use crate::hook::HookError;
use crate::patch::PatchError;
use crate::trace::{Burst, DecodeError, Timestamp};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod session;

pub use session::CaptureSession;

//===========================================================================//

/// The default I/O hook address: the last 32 bytes of the target's 4MB of
/// main RAM.
pub const DEFAULT_HOOK_ADDR: u32 = 0x3f_ffe0;

//===========================================================================//

/// Settings for one capture session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CaptureConfig {
    /// The byte address whose write bursts are treated as hook calls.
    pub hook_addr: u32,
    /// Whether to service hook calls at all.
    pub enable_hooks: bool,
    /// Whether to reset the target after loading the patch.
    pub reset_target: bool,
}

impl Default for CaptureConfig {
    fn default() -> CaptureConfig {
        CaptureConfig {
            hook_addr: DEFAULT_HOOK_ADDR,
            enable_hooks: true,
            reset_target: false,
        }
    }
}

//===========================================================================//

/// A fatal error that ended (or prevented) a capture session.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The tracer overran its buffer; the capture is incomplete.
    #[error("trace buffer overflow after {clocks} clocks")]
    Overflow {
        /// The timestamp at which the overflow was reported.
        clocks: u64,
    },
    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    /// Writing the raw capture failed.
    #[error("raw capture write failed: {0}")]
    RawSink(#[source] io::Error),
    /// The patch could not be configured.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// The patch region at the hook address is too small to hold a hook
    /// buffer.
    #[error("hook region at {addr:#08x} holds only {len} bytes")]
    HookRegionTooSmall {
        /// The hook address.
        addr: u32,
        /// The size of the existing region.
        len: usize,
    },
}

//===========================================================================//

/// Counters describing a capture session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CaptureStats {
    /// Chunks delivered by the transport.
    pub chunks: u64,
    /// Stream bytes kept (and written to the raw sink, if any).
    pub bytes: u64,
    /// Correctly framed packets decoded.
    pub packets: u64,
    /// Bursts completed.
    pub bursts: u64,
    /// Bytes discarded to regain packet alignment.
    pub sync_errors: u64,
    /// Packets whose checksum did not match.
    pub checksum_errors: u64,
    /// Bursts discarded as malformed.
    pub malformed_bursts: u64,
    /// Completed hook buffers dispatched.
    pub hook_calls: u64,
    /// Hook calls rejected or failed.
    pub hook_errors: u64,
    /// The bus time at the end of the session.
    pub timestamp: Timestamp,
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{} bytes, {} packets, {} bursts in {}s; errors: {} sync, {} \
             checksum, {} malformed; {} hook calls ({} failed)",
            self.bytes,
            self.packets,
            self.bursts,
            self.timestamp,
            self.sync_errors,
            self.checksum_errors,
            self.malformed_bursts,
            self.hook_calls,
            self.hook_errors
        )
    }
}

//===========================================================================//

/// A flag for stopping a capture from another thread.
///
/// The session checks the flag once per chunk, so cancellation takes effect
/// after the chunk being processed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Returns a new, uncancelled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

//===========================================================================//

/// Receives events from a capture session as they are decoded.
///
/// Every method has a default no-op implementation.  Recoverable errors are
/// also logged and counted in [`CaptureStats`].
pub trait CaptureObserver {
    /// Called for every completed burst, in stream order.
    fn burst(&mut self, _burst: &Burst) {}

    /// Called for every decoding error, including the fatal overflow.
    fn decode_error(&mut self, _error: &DecodeError) {}

    /// Called for every rejected or failed hook call.
    fn hook_error(&mut self, _error: &HookError) {}
}

impl CaptureObserver for () {}

//===========================================================================//


//===========================================================================//
