//! Per-task writer handles.

use apptrace_core::{Destination, Stamp, Timeout, TraceError, TraceResult};

use crate::session::TraceContext;

/// Errors logged in a row before a writer goes quiet
pub const DEFAULT_ERROR_LOG_LIMIT: u32 = 5;

/// Outcome counters of a writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Records accepted
    pub ok: u32,
    /// Records refused because the arena was full or the wait timed out
    pub would_block: u32,
    /// Records refused for any other reason
    pub errors: u32,
}

impl WriteStats {
    /// Total number of write attempts, modulo 2^32 like every counter here
    pub fn attempts(&self) -> u32 {
        self.ok.wrapping_add(self.would_block).wrapping_add(self.errors)
    }

    /// Count the outcome of one write
    pub fn count(&mut self, result: &TraceResult<()>) {
        let counter = match result {
            Ok(()) => &mut self.ok,
            Err(err) if err.is_backpressure() => &mut self.would_block,
            Err(_) => &mut self.errors,
        };
        *counter = counter.wrapping_add(1);
    }
}

/// Rate limiter for write failure diagnostics.
///
/// Logs the first `limit` failures of a streak, stays silent for the rest
/// and reports the number of suppressed messages on the next success.
#[derive(Debug, Clone, Copy)]
pub struct ErrorLimiter {
    limit: u32,
    streak: u32,
}

impl ErrorLimiter {
    pub const fn new(limit: u32) -> Self {
        Self { limit, streak: 0 }
    }

    /// Record a failure; returns whether it was logged
    pub fn on_error(&mut self, origin: u8, err: TraceError) -> bool {
        self.streak = self.streak.saturating_add(1);
        if self.streak <= self.limit {
            warn!("writer {} failed: {} ({} in a row)", origin, err, self.streak);
            true
        } else {
            false
        }
    }

    /// Record a success; returns how many failures went unlogged
    pub fn on_success(&mut self, origin: u8) -> u32 {
        let suppressed = self.suppressed();
        if suppressed > 0 {
            info!("writer {} recovered, {} failures not logged", origin, suppressed);
        }
        self.streak = 0;
        suppressed
    }

    /// Failures of the current streak that were not logged
    pub fn suppressed(&self) -> u32 {
        self.streak.saturating_sub(self.limit)
    }
}

impl Default for ErrorLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_LIMIT)
    }
}

/// Write handle owned by one task or interrupt handler.
///
/// Stamps every record with the writer's origin and a counter that grows
/// by one per accepted record, so the host can tell which producer lost
/// data.
pub struct TraceWriter<'c, 'a> {
    ctx: &'c TraceContext<'a>,
    dest: Destination,
    origin: u8,
    wr_cnt: u32,
    stats: WriteStats,
    limiter: ErrorLimiter,
}

impl<'c, 'a> TraceWriter<'c, 'a> {
    pub fn new(ctx: &'c TraceContext<'a>, dest: Destination, origin: u8) -> Self {
        Self {
            ctx,
            dest,
            origin,
            wr_cnt: 0,
            stats: WriteStats::default(),
            limiter: ErrorLimiter::default(),
        }
    }

    /// Replace the failure log limiter
    pub fn with_limiter(mut self, limiter: ErrorLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn origin(&self) -> u8 {
        self.origin
    }

    /// Counter the next accepted record carries
    pub fn wr_cnt(&self) -> u32 {
        self.wr_cnt
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Write one record, waiting up to `timeout` for space
    pub fn write(&mut self, data: &[u8], timeout: Timeout) -> TraceResult<()> {
        let stamp = Stamp::new(self.origin, self.wr_cnt);
        let result = self.ctx.write_stamped(self.dest, data, stamp, timeout);
        self.record(result)
    }

    /// Write one record from interrupt context
    pub fn write_from_isr(&mut self, data: &[u8]) -> TraceResult<()> {
        self.write(data, Timeout::NoWait)
    }

    /// Non-blocking write in `nb` form
    pub fn try_write(&mut self, data: &[u8]) -> nb::Result<(), TraceError> {
        self.write(data, Timeout::NoWait).map_err(TraceError::into_nb)
    }

    /// Push everything written so far to the host
    pub fn flush(&self, timeout: Timeout) -> TraceResult<()> {
        self.ctx.flush(self.dest, timeout)
    }

    fn record(&mut self, result: TraceResult<()>) -> TraceResult<()> {
        self.stats.count(&result);
        match result {
            Ok(()) => {
                self.wr_cnt = self.wr_cnt.wrapping_add(1);
                self.limiter.on_success(self.origin);
            }
            Err(err) => {
                self.limiter.on_error(self.origin, err);
            }
        }
        result
    }
}
