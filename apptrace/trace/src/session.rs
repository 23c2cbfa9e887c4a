//! Trace session manager.
//!
//! A [`TraceContext`] owns the single active {encoder, transport} pair. It
//! is created once, by whichever core gets there first, and stays ready
//! for the rest of the process lifetime:
//!
//! ```text
//! Uninitialized --create--> Initializing --init ok--> Ready
//!                                        \--init err-> Failed
//! ```
//!
//! Cores that lose the race spin on the state with a short delay until the
//! winner is done. This runs before the scheduler is up, so no blocking
//! primitive is available for the rendezvous.

use core::any::Any;
use core::sync::atomic::{AtomicU8, Ordering};

use apptrace_core::{Destination, PanicInfo, Platform, Stamp, Timeout, TraceError, TraceResult};
use conquer_once::spin::OnceCell;

use crate::drain::DrainReport;
use crate::encoder::{Encoder, RawEncoder};
use crate::registry::Registry;
use crate::transport::Transport;

/// Lifecycle of a trace session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SessionState {
    /// Nobody has started creating the session
    Uninitialized = 0,
    /// One core is running encoder and transport init
    Initializing = 1,
    /// The handle is published
    Ready = 2,
    /// Init failed; the session can never become ready
    Failed = 3,
}

impl SessionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Ready,
            _ => Self::Failed,
        }
    }
}

/// Names and opaque configs of the components to bind
#[derive(Clone, Copy)]
pub struct SessionConfig<'a> {
    pub encoder_name: &'a str,
    pub encoder_cfg: Option<&'a (dyn Any + Sync)>,
    pub transport_name: &'a str,
    pub transport_cfg: Option<&'a (dyn Any + Sync)>,
}

impl<'a> SessionConfig<'a> {
    /// Bind `encoder_name` to `transport_name` with default configs
    pub const fn new(encoder_name: &'a str, transport_name: &'a str) -> Self {
        Self {
            encoder_name,
            encoder_cfg: None,
            transport_name,
            transport_cfg: None,
        }
    }

    pub fn with_encoder_cfg(mut self, cfg: &'a (dyn Any + Sync)) -> Self {
        self.encoder_cfg = Some(cfg);
        self
    }

    pub fn with_transport_cfg(mut self, cfg: &'a (dyn Any + Sync)) -> Self {
        self.transport_cfg = Some(cfg);
        self
    }
}

impl Default for SessionConfig<'_> {
    /// Raw encoder over the JTAG transport
    fn default() -> Self {
        Self::new(RawEncoder::NAME, Destination::Jtag.name())
    }
}

impl core::fmt::Debug for SessionConfig<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("encoder", &self.encoder_name)
            .field("transport", &self.transport_name)
            .finish()
    }
}

/// Pre-scheduler rendezvous parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierConfig {
    /// Delay between two polls of the session state
    pub poll_interval_us: u32,
    /// Log a warning every this many polls, 0 to never log
    pub log_every: u32,
    /// Give up with `Timeout` after this many polls, 0 to wait forever
    pub max_polls: u32,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 100,
            log_every: 10_000,
            max_polls: 100_000,
        }
    }
}

/// The active {encoder, transport} pair
#[derive(Clone, Copy)]
pub struct TraceHandle<'a> {
    encoder: &'a dyn Encoder<'a>,
    transport: &'a dyn Transport,
}

impl<'a> TraceHandle<'a> {
    pub fn encoder(&self) -> &'a dyn Encoder<'a> {
        self.encoder
    }

    pub fn transport(&self) -> &'a dyn Transport {
        self.transport
    }

    /// Destination the transport writes to
    pub fn link_type(&self) -> Destination {
        self.transport.link_type()
    }
}

impl core::fmt::Debug for TraceHandle<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TraceHandle")
            .field("encoder", &self.encoder.name())
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Process-wide trace context
pub struct TraceContext<'a> {
    registry: Registry<'a>,
    platform: &'a dyn Platform,
    state: AtomicU8,
    handle: OnceCell<TraceHandle<'a>>,
}

impl<'a> TraceContext<'a> {
    /// Context over the components in `registry`; nothing is initialized
    pub fn new(registry: Registry<'a>, platform: &'a dyn Platform) -> Self {
        Self {
            registry,
            platform,
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            handle: OnceCell::uninit(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The components available to [`TraceContext::create`]
    pub fn registry(&self) -> &Registry<'a> {
        &self.registry
    }

    /// The platform services this context runs on
    pub fn platform(&self) -> &'a dyn Platform {
        self.platform
    }

    /// Create the session.
    ///
    /// Only the first call does anything; later calls fail with
    /// `InvalidState` and leave the active handle alone. The transport is
    /// initialized before the encoder that depends on it. Any init error is
    /// fatal: the session moves to `Failed` and the error is returned.
    pub fn create(&self, cfg: &SessionConfig<'_>) -> TraceResult<TraceHandle<'a>> {
        let claimed = self.state.compare_exchange(
            SessionState::Uninitialized as u8,
            SessionState::Initializing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if claimed.is_err() {
            debug!("trace session already created");
            return Err(TraceError::InvalidState);
        }

        match self.bind(cfg) {
            Ok(handle) => {
                self.handle
                    .try_init_once(|| handle)
                    .map_err(|_| TraceError::InvalidState)?;
                self.state.store(SessionState::Ready as u8, Ordering::Release);
                info!(
                    "trace session ready on core {}: {} over {}",
                    self.platform.core_id(),
                    cfg.encoder_name,
                    cfg.transport_name
                );
                Ok(handle)
            }
            Err(err) => {
                self.state.store(SessionState::Failed as u8, Ordering::Release);
                error!(
                    "trace session init failed ({} over {}): {}",
                    cfg.encoder_name,
                    cfg.transport_name,
                    err
                );
                Err(err)
            }
        }
    }

    fn bind(&self, cfg: &SessionConfig<'_>) -> TraceResult<TraceHandle<'a>> {
        let transport = self
            .registry
            .find_transport(cfg.transport_name)
            .ok_or(TraceError::NotFound)?;
        let encoder = self
            .registry
            .find_encoder(cfg.encoder_name)
            .ok_or(TraceError::NotFound)?;

        transport.init(cfg.transport_cfg.map(|c| c as &dyn Any))?;
        encoder.init(transport, cfg.encoder_cfg.map(|c| c as &dyn Any))?;
        Ok(TraceHandle { encoder, transport })
    }

    /// Per-core early init.
    ///
    /// The first core creates the session, every other core waits at the
    /// pre-scheduler barrier until it is ready.
    pub fn early_init(
        &self,
        cfg: &SessionConfig<'_>,
        barrier: &BarrierConfig,
    ) -> TraceResult<TraceHandle<'a>> {
        match self.create(cfg) {
            Err(TraceError::InvalidState) => self.wait_ready(barrier),
            other => other,
        }
    }

    /// Spin until another core finished creating the session.
    ///
    /// Fails with `InvalidState` if that core's init failed and with
    /// `Timeout` once `max_polls` is exhausted.
    pub fn wait_ready(&self, barrier: &BarrierConfig) -> TraceResult<TraceHandle<'a>> {
        let mut polls = 0u32;
        loop {
            match self.state() {
                SessionState::Ready => return self.active_handle().ok_or(TraceError::InvalidState),
                SessionState::Failed => return Err(TraceError::InvalidState),
                SessionState::Uninitialized | SessionState::Initializing => {}
            }

            polls = polls.saturating_add(1);
            if barrier.max_polls != 0 && polls >= barrier.max_polls {
                error!(
                    "core {} gave up waiting for trace init after {} polls",
                    self.platform.core_id(),
                    polls
                );
                return Err(TraceError::Timeout);
            }
            if barrier.log_every != 0 && polls % barrier.log_every == 0 {
                warn!(
                    "core {} still waiting for trace init ({} polls)",
                    self.platform.core_id(),
                    polls
                );
            }
            self.platform.delay_us(barrier.poll_interval_us);
        }
    }

    /// The published handle; never blocks
    pub fn active_handle(&self) -> Option<TraceHandle<'a>> {
        self.handle.try_get().ok().copied()
    }

    fn handle_for(&self, dest: Destination) -> TraceResult<TraceHandle<'a>> {
        let handle = self.active_handle().ok_or(TraceError::InvalidState)?;
        if handle.link_type() != dest {
            return Err(TraceError::InvalidArgument);
        }
        Ok(handle)
    }

    /// Write one record from task context
    pub fn write(&self, dest: Destination, data: &[u8], timeout: Timeout) -> TraceResult<()> {
        self.write_stamped(dest, data, Stamp::anonymous(), timeout)
    }

    /// Write one record on behalf of an identified writer
    pub fn write_stamped(
        &self,
        dest: Destination,
        data: &[u8],
        stamp: Stamp,
        timeout: Timeout,
    ) -> TraceResult<()> {
        if data.is_empty() {
            return Err(TraceError::InvalidArgument);
        }
        self.handle_for(dest)?.encoder.write(data, stamp, timeout)
    }

    /// Write one record from interrupt context; never waits
    pub fn write_from_isr(&self, dest: Destination, data: &[u8]) -> TraceResult<()> {
        self.write(dest, data, Timeout::NoWait)
    }

    /// Push everything written so far to the host
    pub fn flush(&self, dest: Destination, timeout: Timeout) -> TraceResult<()> {
        self.handle_for(dest)?.transport.flush(timeout)
    }

    /// Flush once at least `min_size` bytes are pending, without waiting
    /// for a drain running elsewhere
    pub fn flush_nolock(
        &self,
        dest: Destination,
        min_size: usize,
        timeout: Timeout,
    ) -> TraceResult<()> {
        self.handle_for(dest)?.transport.flush_nolock(min_size, timeout)
    }

    /// Run one drain cycle of the active transport
    pub fn pump(&self, timeout: Timeout) -> TraceResult<DrainReport> {
        self.active_handle()
            .ok_or(TraceError::InvalidState)?
            .transport
            .pump(timeout)
    }

    /// Whether a host is attached; `false` before the session is ready
    pub fn is_host_connected(&self) -> bool {
        self.active_handle()
            .map(|h| h.transport.is_host_connected())
            .unwrap_or(false)
    }

    /// Destination of the active transport
    pub fn link_type(&self) -> Option<Destination> {
        self.active_handle().map(|h| h.link_type())
    }

    /// Fatal exception hook.
    ///
    /// Safe to call in any state: without a published handle it does
    /// nothing. Encoder then transport get their chance; components without
    /// a panic handler are skipped.
    pub fn panic_handler(&self, info: &PanicInfo<'_>) -> TraceResult<()> {
        let Some(handle) = self.active_handle() else {
            return Ok(());
        };
        let encoder = handle.encoder.panic_handler(info);
        let transport = handle.transport.panic_handler(info);
        for result in [encoder, transport] {
            match result {
                Ok(()) | Err(TraceError::NotSupported) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
