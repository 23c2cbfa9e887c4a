//! Timeouts and deadlines for blocking trace operations

use core::fmt;
use crate::{Platform, TraceError, TraceResult};

/// Raw timeout value meaning "wait forever"
pub const TMO_INFINITE: u32 = u32::MAX;

/// How long a trace call may wait for space or for the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Try once and fail immediately
    NoWait,
    /// Wait up to the given number of microseconds
    Micros(u32),
    /// Wait until the operation can complete
    Infinite,
}

impl Timeout {
    /// Interpret a raw microsecond value.
    ///
    /// `0` means non-blocking and [`TMO_INFINITE`] means no deadline.
    pub const fn from_us(us: u32) -> Self {
        match us {
            0 => Self::NoWait,
            TMO_INFINITE => Self::Infinite,
            us => Self::Micros(us),
        }
    }

    /// Raw microsecond value, the inverse of [`Timeout::from_us`]
    pub const fn as_us(self) -> u32 {
        match self {
            Self::NoWait => 0,
            Self::Micros(us) => us,
            Self::Infinite => TMO_INFINITE,
        }
    }

    /// Check if the caller is allowed to wait at all
    pub const fn is_blocking(self) -> bool {
        !matches!(self, Self::NoWait)
    }

    /// Check if the timeout never expires
    pub const fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::NoWait
    }
}

impl From<u32> for Timeout {
    fn from(us: u32) -> Self {
        Self::from_us(us)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWait => write!(f, "nowait"),
            Self::Micros(us) => write!(f, "{}us", us),
            Self::Infinite => write!(f, "infinite"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Timeout {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Self::NoWait => defmt::write!(fmt, "nowait"),
            Self::Micros(us) => defmt::write!(fmt, "{}us", us),
            Self::Infinite => defmt::write!(fmt, "infinite"),
        }
    }
}

/// A started timeout.
///
/// Captures the platform clock when created; [`Deadline::check`] reports
/// [`TraceError::Timeout`] once the budget is spent.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start_us: u64,
    timeout: Timeout,
}

impl Deadline {
    /// Start counting `timeout` from now
    pub fn start(platform: &dyn Platform, timeout: Timeout) -> Self {
        Self {
            start_us: platform.now_us(),
            timeout,
        }
    }

    /// Timeout this deadline was started with
    pub const fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Microseconds elapsed since the deadline was started
    pub fn elapsed_us(&self, platform: &dyn Platform) -> u64 {
        platform.now_us().saturating_sub(self.start_us)
    }

    /// Check whether the caller may keep waiting.
    ///
    /// `NoWait` is always expired: the first attempt was the only one.
    pub fn check(&self, platform: &dyn Platform) -> TraceResult<()> {
        match self.timeout {
            Timeout::Infinite => Ok(()),
            Timeout::NoWait => Err(TraceError::Timeout),
            Timeout::Micros(us) => {
                if self.elapsed_us(platform) >= u64::from(us) {
                    Err(TraceError::Timeout)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Remaining budget, `None` for an infinite deadline
    pub fn remaining_us(&self, platform: &dyn Platform) -> Option<u64> {
        match self.timeout {
            Timeout::Infinite => None,
            Timeout::NoWait => Some(0),
            Timeout::Micros(us) => Some(u64::from(us).saturating_sub(self.elapsed_us(platform))),
        }
    }

    /// Remaining budget expressed as a fresh [`Timeout`] for nested calls
    pub fn remaining(&self, platform: &dyn Platform) -> Timeout {
        match self.remaining_us(platform) {
            None => Timeout::Infinite,
            Some(0) => Timeout::NoWait,
            Some(us) => Timeout::Micros(us.min(u64::from(TMO_INFINITE - 1)) as u32),
        }
    }
}
