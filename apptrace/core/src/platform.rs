//! The platform seam.
//!
//! The trace channel never talks to the RTOS or the CPU directly. Whatever
//! runs it supplies a [`Platform`]: a monotonic clock derived from the cycle
//! counter, the current core, interrupt context detection and the two ways a
//! task may give up the CPU while it waits. Critical sections come from the
//! `critical-section` crate and are provided by the same port.

use core::fmt;

/// Externally supplied RTOS and CPU services
pub trait Platform: Sync {
    /// Monotonic time in microseconds
    fn now_us(&self) -> u64;

    /// Index of the core executing the caller
    fn core_id(&self) -> usize;

    /// Whether the caller runs in interrupt context
    fn in_isr(&self) -> bool;

    /// Suspend the calling task for roughly `us` microseconds
    fn delay_us(&self, us: u32);

    /// Let other tasks of the same priority run
    fn yield_now(&self);
}

/// Identity of the writer that produced a block.
///
/// `count` is the per-writer counter the host uses to spot lost blocks
/// from one particular producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stamp {
    /// Writer identifier (task, ISR or core)
    pub origin: u8,
    /// Number of blocks this writer produced before this one
    pub count: u32,
}

impl Stamp {
    /// Origin used by writes that do not go through a writer handle
    pub const ANONYMOUS_ORIGIN: u8 = 0xFF;

    /// Create a stamp for the given writer
    pub const fn new(origin: u8, count: u32) -> Self {
        Self { origin, count }
    }

    /// Stamp for writes without a writer handle
    pub const fn anonymous() -> Self {
        Self::new(Self::ANONYMOUS_ORIGIN, 0)
    }
}

/// Opaque data handed to panic handlers by the fatal exception path
#[derive(Clone, Copy)]
pub struct PanicInfo<'a> {
    /// Core that raised the exception
    pub core_id: usize,
    /// Architecture specific frame or message bytes
    pub data: &'a [u8],
}

impl<'a> PanicInfo<'a> {
    /// Wrap the raw panic blob
    pub const fn new(core_id: usize, data: &'a [u8]) -> Self {
        Self { core_id, data }
    }
}

impl fmt::Debug for PanicInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicInfo")
            .field("core_id", &self.core_id)
            .field("len", &self.data.len())
            .finish()
    }
}
