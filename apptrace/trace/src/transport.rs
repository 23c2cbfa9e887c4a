//! Transports move encoded records towards the host.

use core::any::Any;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use apptrace_arena::{Arena, ArenaInfo, OverflowPolicy};
use apptrace_core::{
    Deadline, Destination, PanicInfo, Platform, Stamp, Timeout, TraceError, TraceResult,
};
use critical_section::Mutex;

use crate::drain::{DrainReport, HostDrain, HostLink};

/// Transport vtable
pub trait Transport: Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Prepare the transport; `cfg` must be of the transport's config type
    fn init(&self, cfg: Option<&dyn Any>) -> TraceResult<()>;

    /// Physical destination served by this transport
    fn link_type(&self) -> Destination;

    /// Whether a host is attached and reading
    fn is_host_connected(&self) -> bool;

    /// Store one record made of consecutive `parts`
    fn write_vectored(&self, parts: &[&[u8]], stamp: Stamp, timeout: Timeout) -> TraceResult<()>;

    /// Store one record
    fn write(&self, data: &[u8], stamp: Stamp, timeout: Timeout) -> TraceResult<()> {
        self.write_vectored(&[data], stamp, timeout)
    }

    /// Push everything written so far to the host
    fn flush(&self, timeout: Timeout) -> TraceResult<()>;

    /// Flush without waiting for other drains, and only once at least
    /// `min_size` bytes are pending
    fn flush_nolock(&self, min_size: usize, timeout: Timeout) -> TraceResult<()>;

    /// Run one drain cycle
    fn pump(&self, timeout: Timeout) -> TraceResult<DrainReport>;

    /// Last-gasp hook called from the fatal exception path
    fn panic_handler(&self, _info: &PanicInfo<'_>) -> TraceResult<()> {
        Err(TraceError::NotSupported)
    }
}

/// Configuration of an [`ArenaTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaTransportConfig {
    /// What writers do when the arena is full
    pub overflow: OverflowPolicy,
    /// Never wait for space while no host is attached
    pub drop_when_disconnected: bool,
    /// Poll period of `flush` while another drain is running
    pub flush_poll_us: u32,
}

impl ArenaTransportConfig {
    /// Blocking overflow, drop while disconnected, 1 ms flush poll
    pub const fn new() -> Self {
        Self {
            overflow: OverflowPolicy::Block,
            drop_when_disconnected: true,
            flush_poll_us: 1_000,
        }
    }
}

impl Default for ArenaTransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport backed by an in-memory block arena drained over a host link
pub struct ArenaTransport<'a, const N: usize, L: HostLink> {
    arena: Arena<N>,
    link: L,
    platform: &'a dyn Platform,
    config: Mutex<Cell<ArenaTransportConfig>>,
    ready: AtomicBool,
}

impl<'a, const N: usize, L: HostLink> ArenaTransport<'a, N, L> {
    /// Create an uninitialized transport
    pub const fn new(link: L, platform: &'a dyn Platform) -> Self {
        Self {
            arena: Arena::new(OverflowPolicy::Block),
            link,
            platform,
            config: Mutex::new(Cell::new(ArenaTransportConfig::new())),
            ready: AtomicBool::new(false),
        }
    }

    /// The backing arena
    pub fn arena(&self) -> &Arena<N> {
        &self.arena
    }

    /// The host link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Arena statistics
    pub fn info(&self) -> ArenaInfo {
        self.arena.info()
    }

    /// Active configuration
    pub fn config(&self) -> ArenaTransportConfig {
        critical_section::with(|cs| self.config.borrow(cs).get())
    }

    fn check_ready(&self) -> TraceResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TraceError::InvalidState)
        }
    }

    fn drained(&self) -> bool {
        let info = self.arena.info();
        info.ready_blocks == 0 && info.in_flight_blocks == 0
    }
}

impl<const N: usize, L: HostLink> Transport for ArenaTransport<'_, N, L> {
    fn name(&self) -> &str {
        self.link.link_type().name()
    }

    fn init(&self, cfg: Option<&dyn Any>) -> TraceResult<()> {
        let config = match cfg {
            None => ArenaTransportConfig::default(),
            Some(cfg) => *cfg
                .downcast_ref::<ArenaTransportConfig>()
                .ok_or(TraceError::InvalidArgument)?,
        };
        critical_section::with(|cs| self.config.borrow(cs).set(config));
        self.arena.set_policy(config.overflow);
        self.ready.store(true, Ordering::Release);
        debug!(
            "{} transport ready, {} byte arena, max item {}",
            self.name(),
            N,
            Arena::<N>::max_item_size()
        );
        Ok(())
    }

    fn link_type(&self) -> Destination {
        self.link.link_type()
    }

    fn is_host_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn write_vectored(&self, parts: &[&[u8]], stamp: Stamp, timeout: Timeout) -> TraceResult<()> {
        self.check_ready()?;
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len == 0 {
            return Err(TraceError::InvalidArgument);
        }

        let timeout = if self.config().drop_when_disconnected && !self.link.is_connected() {
            Timeout::NoWait
        } else {
            timeout
        };

        let mut grant = self.arena.acquire(len, stamp, timeout, self.platform)?;
        let mut offset = 0;
        for part in parts {
            grant.write_at(offset, part)?;
            offset += part.len();
        }
        grant.seal();
        Ok(())
    }

    fn flush(&self, timeout: Timeout) -> TraceResult<()> {
        self.check_ready()?;
        let deadline = Deadline::start(self.platform, timeout);
        let poll_us = self.config().flush_poll_us;
        loop {
            match self.pump(deadline.remaining(self.platform)) {
                Ok(_) | Err(TraceError::Busy) => {}
                Err(err) => return Err(err),
            }
            if self.drained() {
                return Ok(());
            }
            deadline.check(self.platform)?;
            self.platform.delay_us(poll_us);
        }
    }

    fn flush_nolock(&self, min_size: usize, timeout: Timeout) -> TraceResult<()> {
        self.check_ready()?;
        if self.arena.info().used_bytes < min_size {
            return Ok(());
        }
        self.pump(timeout).map(|_| ())
    }

    fn pump(&self, timeout: Timeout) -> TraceResult<DrainReport> {
        self.check_ready()?;
        let mut drain = HostDrain::attach(&self.arena, &self.link).ok_or(TraceError::Busy)?;
        drain.pump(timeout, self.platform)
    }

    fn panic_handler(&self, info: &PanicInfo<'_>) -> TraceResult<()> {
        if !self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.pump(Timeout::NoWait) {
            Ok(report) => {
                debug!("core {} panic, pushed {} blocks", info.core_id, report.blocks);
                Ok(())
            }
            // Another core owns the drain.
            Err(TraceError::Busy) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct NullClock;

    impl Platform for NullClock {
        fn now_us(&self) -> u64 {
            0
        }
        fn core_id(&self) -> usize {
            0
        }
        fn in_isr(&self) -> bool {
            false
        }
        fn delay_us(&self, _us: u32) {}
        fn yield_now(&self) {}
    }

    struct CountingLink {
        connected: AtomicBool,
        frames: AtomicUsize,
    }

    impl CountingLink {
        fn new(connected: bool) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                frames: AtomicUsize::new(0),
            }
        }
    }

    impl HostLink for CountingLink {
        fn link_type(&self) -> Destination {
            Destination::Uart
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
        fn send(&self, _frame: &[&[u8]]) -> TraceResult<()> {
            self.frames.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn named_after_link_and_needs_init() {
        let transport = ArenaTransport::<128, _>::new(CountingLink::new(true), &NullClock);
        assert_eq!(transport.name(), "uart");
        assert_eq!(
            transport.write(b"x", Stamp::anonymous(), Timeout::NoWait),
            Err(TraceError::InvalidState)
        );
        assert_eq!(transport.init(Some(&42u32)), Err(TraceError::InvalidArgument));
        transport.init(None).unwrap();
        transport.write(b"x", Stamp::anonymous(), Timeout::NoWait).unwrap();
    }

    #[test]
    fn vectored_write_is_one_block() {
        let transport = ArenaTransport::<128, _>::new(CountingLink::new(true), &NullClock);
        transport.init(None).unwrap();
        transport
            .write_vectored(&[b"ab", b"", b"cde"], Stamp::new(3, 1), Timeout::NoWait)
            .unwrap();

        let mut reader = transport.arena().reader().unwrap();
        let block = reader.next_block().unwrap();
        assert!(block == *b"abcde".as_slice());
        assert_eq!((block.origin, block.wr_cnt), (3, 1));
        assert!(reader.next_block().is_none());
    }

    #[test]
    fn flush_pushes_everything() {
        let transport = ArenaTransport::<256, _>::new(CountingLink::new(true), &NullClock);
        transport.init(None).unwrap();
        for _ in 0..5 {
            transport.write(b"data", Stamp::anonymous(), Timeout::NoWait).unwrap();
        }
        transport.flush(Timeout::NoWait).unwrap();
        assert_eq!(transport.link().frames.load(Ordering::Relaxed), 5);
        assert!(transport.arena().is_empty());
    }

    #[test]
    fn disconnected_host_never_waits() {
        let transport = ArenaTransport::<64, _>::new(CountingLink::new(false), &NullClock);
        transport.init(None).unwrap();
        transport.write(&[0; 40], Stamp::anonymous(), Timeout::Infinite).unwrap();
        assert_eq!(
            transport.write(&[0; 40], Stamp::anonymous(), Timeout::Infinite),
            Err(TraceError::Busy)
        );
    }

    #[test]
    fn flush_nolock_respects_threshold() {
        let transport = ArenaTransport::<256, _>::new(CountingLink::new(true), &NullClock);
        transport.init(None).unwrap();
        transport.write(b"abcd", Stamp::anonymous(), Timeout::NoWait).unwrap();
        transport.flush_nolock(64, Timeout::NoWait).unwrap();
        assert_eq!(transport.link().frames.load(Ordering::Relaxed), 0);
        transport.flush_nolock(1, Timeout::NoWait).unwrap();
        assert_eq!(transport.link().frames.load(Ordering::Relaxed), 1);
    }
}
