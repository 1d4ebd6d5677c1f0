//! Bus trace capture and decoding for a memory-bus tracing cartridge, with
//! host-serviced I/O hooks and a CAM-based memory patch.

#![warn(missing_docs)]

pub mod capture;
pub mod hook;
pub mod patch;
pub mod trace;
pub mod transport;
