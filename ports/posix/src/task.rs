//! Background drain task.
//!
//! Pumps a trace session from a dedicated thread at a fixed period. The
//! period is kept drift free: the thread sleeps until the next absolute
//! deadline instead of for a relative duration.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use apptrace::{DrainReport, Timeout, TraceContext, TraceError, TraceResult, Transport};

/// Totals of a drain task over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Pump cycles run
    pub cycles: u64,
    /// Frames the host accepted
    pub blocks: u64,
    /// Payload bytes the host accepted
    pub bytes: u64,
    /// Cycles skipped because another drain held the arena
    pub busy: u64,
    /// Cycles that failed for any other reason
    pub errors: u64,
}

impl DrainStats {
    fn record(&mut self, result: TraceResult<DrainReport>) {
        self.cycles += 1;
        match result {
            Ok(report) => {
                self.blocks += report.blocks as u64;
                self.bytes += report.bytes as u64;
            }
            Err(TraceError::Busy) => self.busy += 1,
            Err(err) => {
                self.errors += 1;
                if self.errors == 1 {
                    log::warn!("drain cycle failed: {}", err);
                }
            }
        }
    }
}

/// Handle of a running drain thread; dropping it stops the thread
pub struct DrainTask {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<DrainStats>>,
}

impl DrainTask {
    /// Run `pump` every `period` until stopped.
    ///
    /// One last cycle runs after the stop request so records written just
    /// before it still reach the host.
    pub fn spawn<F>(period: Duration, mut pump: F) -> io::Result<Self>
    where
        F: FnMut() -> TraceResult<DrainReport> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("apptrace-drain".into())
            .spawn(move || {
                let mut stats = DrainStats::default();
                let mut next = Instant::now();
                while flag.load(Ordering::Acquire) {
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    stats.record(pump());
                }
                stats.record(pump());
                log::debug!(
                    "drain task done: {} blocks, {} bytes in {} cycles",
                    stats.blocks,
                    stats.bytes,
                    stats.cycles
                );
                stats
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Pump the active transport of `ctx`
    pub fn for_context(ctx: &'static TraceContext<'static>, period: Duration) -> io::Result<Self> {
        Self::spawn(period, move || ctx.pump(Timeout::NoWait))
    }

    /// Pump one transport directly
    pub fn for_transport<T>(transport: Arc<T>, period: Duration) -> io::Result<Self>
    where
        T: Transport + Send + 'static,
    {
        Self::spawn(period, move || transport.pump(Timeout::NoWait))
    }

    /// Whether the thread is still pumping
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for its final cycle
    pub fn stop(mut self) -> DrainStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> DrainStats {
        self.running.store(false, Ordering::Release);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("drain task panicked");
                DrainStats::default()
            }
            None => DrainStats::default(),
        }
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}
