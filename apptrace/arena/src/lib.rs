#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)] // The arena hands out raw slices of its storage

//! # Application Trace Arena
//!
//! A fixed-size block arena shared by many writers on several cores and
//! drained by exactly one reader. Reservation, sealing and reclaiming all
//! happen under short `critical-section` locks; payload copies run without
//! any lock held.

// Must come first so the logging macros are visible to the other modules.
mod fmt;

pub mod arena;
pub mod block;
pub mod reader;

pub use arena::{Arena, Grant, OverflowPolicy};
pub use block::{align_up, HEADER_SIZE};
pub use reader::{BlockRef, DrainReady, Reader};

/// Arena statistics for debugging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaInfo {
    /// Size of the storage in bytes
    pub capacity: usize,
    /// Bytes reserved, sealed or in flight, headers included
    pub used_bytes: usize,
    /// Bytes available for new blocks
    pub free_bytes: usize,
    /// Lowest free byte count ever observed
    pub min_free_bytes: usize,
    /// Sealed blocks waiting for the reader
    pub ready_blocks: usize,
    /// Blocks handed to the reader but not reclaimed yet
    pub in_flight_blocks: usize,
    /// Reserved blocks not sealed yet
    pub outstanding_grants: usize,
    /// Blocks discarded by the overwrite policy
    pub dropped_blocks: u32,
    /// Sequence number the next reservation receives
    pub next_seq: u32,
}

impl ArenaInfo {
    /// Get utilization as a percentage (0-100)
    pub fn utilization(&self) -> u8 {
        if self.capacity == 0 {
            0
        } else {
            ((self.used_bytes * 100) / self.capacity) as u8
        }
    }

    /// Check if nothing is stored
    pub const fn is_empty(&self) -> bool {
        self.used_bytes == 0
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ArenaInfo {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "ArenaInfo{{ capacity: {}, used: {}, free: {}, min_free: {}, ready: {}, in_flight: {}, dropped: {} }}",
            self.capacity,
            self.used_bytes,
            self.free_bytes,
            self.min_free_bytes,
            self.ready_blocks,
            self.in_flight_blocks,
            self.dropped_blocks
        );
    }
}
