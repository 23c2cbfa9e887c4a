//! POSIX port of the application trace channel.
//!
//! Hosts the trace channel on a regular operating system so it can be
//! exercised without target hardware:
//!
//! - [`PosixPlatform`] maps the platform seam onto `std`: a monotonic clock,
//!   threads standing in for cores and a per-thread interrupt flag
//! - [`CaptureLink`], [`TcpLink`] and [`UdpLink`] are host links that keep
//!   frames in memory or ship them to a socket
//! - [`DrainTask`] pumps a session from a background thread, the way the
//!   drain task runs on a target
//!
//! Critical sections come from the `std` implementation of the
//! `critical-section` crate.
//!
//! ```no_run
//! use apptrace::{ArenaTransport, Destination, RawEncoder, Registry, SessionConfig, TraceContext};
//! use apptrace_posix::{DrainTask, PosixPlatform, TcpLink};
//! use std::time::Duration;
//!
//! static PLATFORM: PosixPlatform = PosixPlatform::new();
//!
//! let link = TcpLink::connect("127.0.0.1:6200", Destination::Jtag)?;
//! let transport: &'static _ = Box::leak(Box::new(ArenaTransport::<4096, _>::new(link, &PLATFORM)));
//! let raw: &'static _ = Box::leak(Box::new(RawEncoder::new()));
//! let registry = Registry::new().with_transport(transport)?.with_encoder(raw)?;
//! let ctx: &'static _ = Box::leak(Box::new(TraceContext::new(registry, &PLATFORM)));
//! ctx.create(&SessionConfig::default())?;
//!
//! let drain = DrainTask::for_context(ctx, Duration::from_millis(10))?;
//! // ... write records ...
//! drain.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod link;
pub mod platform;
pub mod task;

pub use link::{CaptureLink, CapturedFrame, LinkError, TcpLink, UdpLink};
pub use platform::{current_core, run_as_isr, spawn_pinned, PosixPlatform};
pub use task::{DrainStats, DrainTask};
