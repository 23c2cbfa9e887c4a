#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]

//! # Application Trace Core
//!
//! Types shared by every layer of the application trace channel: the error
//! taxonomy, timeouts and deadlines, trace destinations and the platform
//! seam through which the RTOS and the cycle counter are reached.

use core::fmt;

pub mod platform;
pub mod time;

pub use platform::*;
pub use time::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the trace channel
pub type TraceResult<T> = Result<T, TraceError>;

/// Error types for trace channel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    /// Null, empty or oversized input
    InvalidArgument,
    /// Named encoder or transport is not registered
    NotFound,
    /// A fixed-capacity table or the handle slot is exhausted
    OutOfMemory,
    /// The arena is full and the caller asked not to wait
    Busy,
    /// A blocking call exceeded its deadline
    Timeout,
    /// Optional operation not provided by the selected component
    NotSupported,
    /// Operation not allowed in the current session state
    InvalidState,
    /// The physical host link refused or failed a transfer
    Link,
}

impl TraceError {
    /// Whether the error is transient backpressure rather than a fault
    pub const fn is_backpressure(self) -> bool {
        matches!(self, TraceError::Busy | TraceError::Timeout)
    }

    /// Converts the non-blocking failure into the `nb` vocabulary.
    ///
    /// `Busy` becomes `WouldBlock`, everything else stays an error.
    pub fn into_nb(self) -> nb::Error<TraceError> {
        match self {
            TraceError::Busy => nb::Error::WouldBlock,
            other => nb::Error::Other(other),
        }
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::InvalidArgument => write!(f, "Invalid argument"),
            TraceError::NotFound => write!(f, "Encoder or transport not registered"),
            TraceError::OutOfMemory => write!(f, "Out of memory"),
            TraceError::Busy => write!(f, "Trace buffer is full"),
            TraceError::Timeout => write!(f, "Operation timed out"),
            TraceError::NotSupported => write!(f, "Operation not supported"),
            TraceError::InvalidState => write!(f, "Invalid trace session state"),
            TraceError::Link => write!(f, "Host link failure"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TraceError {}

#[cfg(feature = "defmt")]
impl defmt::Format for TraceError {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            TraceError::InvalidArgument => defmt::write!(fmt, "InvalidArgument"),
            TraceError::NotFound => defmt::write!(fmt, "NotFound"),
            TraceError::OutOfMemory => defmt::write!(fmt, "OutOfMemory"),
            TraceError::Busy => defmt::write!(fmt, "Busy"),
            TraceError::Timeout => defmt::write!(fmt, "Timeout"),
            TraceError::NotSupported => defmt::write!(fmt, "NotSupported"),
            TraceError::InvalidState => defmt::write!(fmt, "InvalidState"),
            TraceError::Link => defmt::write!(fmt, "Link"),
        }
    }
}

/// Physical destination of trace data.
///
/// Also reported as the link type of the active transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Destination {
    /// On-chip trace memory read out by a JTAG debugger
    Jtag,
    /// Serial port
    Uart,
}

impl Destination {
    /// Lower-case name, also used as the default transport name
    pub const fn name(self) -> &'static str {
        match self {
            Destination::Jtag => "jtag",
            Destination::Uart => "uart",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
