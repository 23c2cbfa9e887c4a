#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! # Application Trace
//!
//! A low-overhead channel streaming diagnostic data out of a running target
//! to a debug host. Tasks and interrupt handlers on any core write records
//! into a shared block arena; a drain moves sealed blocks to the host over
//! JTAG or UART.
//!
//! ## Architecture
//!
//! - [`session::TraceContext`] owns the single active encoder/transport pair
//!   and runs the cross-core init rendezvous
//! - [`encoder::Encoder`] implementations shape payloads into records
//! - [`transport::Transport`] implementations store records and push them
//!   to the host; [`transport::ArenaTransport`] is backed by an
//!   [`Arena`] and a [`drain::HostLink`]
//! - [`writer::TraceWriter`] stamps records with a writer id and counter
//! - [`logtrace`] captures `printf` calls as compact binary records
//!
//! ## Usage
//!
//! ```rust,ignore
//! use apptrace::{Destination, Registry, SessionConfig, Timeout, TraceContext};
//!
//! let registry = Registry::new()
//!     .with_transport(&JTAG)?
//!     .with_encoder(&RAW)?;
//! let ctx = TraceContext::new(registry, &PLATFORM);
//! ctx.create(&SessionConfig::default())?;
//! ctx.write(Destination::Jtag, b"hello", Timeout::Infinite)?;
//! ```

// Must come first so the logging macros are visible to the other modules.
mod fmt;

pub mod drain;
pub mod encoder;
pub mod logtrace;
pub mod registry;
pub mod session;
pub mod transport;
pub mod varint;
pub mod writer;

pub use apptrace_arena::{Arena, ArenaInfo, BlockRef, Grant, OverflowPolicy, Reader};
pub use apptrace_core::{
    Deadline, Destination, PanicInfo, Platform, Stamp, Timeout, TraceError, TraceResult,
    TMO_INFINITE,
};

pub use drain::{DrainReport, HostDrain, HostLink};
pub use encoder::{Encoder, RawEncoder, RecordEncoder, RecordEncoderConfig};
pub use logtrace::{vprintf_to, Arg, LogConfig, LogTrace};
pub use registry::Registry;
pub use session::{BarrierConfig, SessionConfig, SessionState, TraceContext, TraceHandle};
pub use transport::{ArenaTransport, ArenaTransportConfig, Transport};
pub use writer::{ErrorLimiter, TraceWriter, WriteStats};
