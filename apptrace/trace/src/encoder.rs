//! Encoders turn trace payloads into records and hand them to a transport.

use core::any::Any;
use core::cell::Cell;

use apptrace_core::{Deadline, PanicInfo, Platform, Stamp, Timeout, TraceError, TraceResult};
use critical_section::Mutex;

use crate::transport::Transport;
use crate::varint::{encode_u32, MAX_VARINT_LEN};

/// Encoder vtable.
///
/// An encoder keeps a reference to the transport it writes through but
/// never owns it.
pub trait Encoder<'a>: Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Bind to `transport`; `cfg` must be of the encoder's config type
    fn init(&self, transport: &'a dyn Transport, cfg: Option<&dyn Any>) -> TraceResult<()>;

    /// Encode one payload into one record
    fn write(&self, data: &[u8], stamp: Stamp, timeout: Timeout) -> TraceResult<()>;

    /// Last-gasp hook called from the fatal exception path
    fn panic_handler(&self, _info: &PanicInfo<'_>) -> TraceResult<()> {
        Err(TraceError::NotSupported)
    }
}

/// Back-reference from an encoder to its transport
pub struct TransportSlot<'a> {
    inner: Mutex<Cell<Option<&'a dyn Transport>>>,
}

impl<'a> TransportSlot<'a> {
    /// Empty slot
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(None)),
        }
    }

    /// Bind the transport
    pub fn set(&self, transport: &'a dyn Transport) {
        critical_section::with(|cs| self.inner.borrow(cs).set(Some(transport)));
    }

    /// Bound transport, `InvalidState` before `init`
    pub fn get(&self) -> TraceResult<&'a dyn Transport> {
        critical_section::with(|cs| self.inner.borrow(cs).get()).ok_or(TraceError::InvalidState)
    }
}

impl Default for TransportSlot<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pass-through encoder: one payload, one block
pub struct RawEncoder<'a> {
    transport: TransportSlot<'a>,
}

impl<'a> RawEncoder<'a> {
    /// Registry name of the raw encoder
    pub const NAME: &'static str = "raw";

    pub const fn new() -> Self {
        Self {
            transport: TransportSlot::new(),
        }
    }
}

impl Default for RawEncoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Encoder<'a> for RawEncoder<'a> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&self, transport: &'a dyn Transport, cfg: Option<&dyn Any>) -> TraceResult<()> {
        if cfg.is_some() {
            return Err(TraceError::InvalidArgument);
        }
        self.transport.set(transport);
        Ok(())
    }

    fn write(&self, data: &[u8], stamp: Stamp, timeout: Timeout) -> TraceResult<()> {
        self.transport.get()?.write(data, stamp, timeout)
    }
}

/// Configuration of a [`RecordEncoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordEncoderConfig {
    /// Prefix each record with the time since the previous one
    pub timestamps: bool,
}

impl Default for RecordEncoderConfig {
    fn default() -> Self {
        Self { timestamps: true }
    }
}

/// Encoder that prefixes every payload with a varint timestamp delta in
/// microseconds
pub struct RecordEncoder<'a> {
    transport: TransportSlot<'a>,
    platform: &'a dyn Platform,
    timestamps: Mutex<Cell<bool>>,
    last_us: Mutex<Cell<u64>>,
}

impl<'a> RecordEncoder<'a> {
    /// Registry name of the record encoder
    pub const NAME: &'static str = "record";

    pub const fn new(platform: &'a dyn Platform) -> Self {
        Self {
            transport: TransportSlot::new(),
            platform,
            timestamps: Mutex::new(Cell::new(true)),
            last_us: Mutex::new(Cell::new(0)),
        }
    }

    /// Store one timestamped record without waiting.
    ///
    /// The delta is taken and the record reserved under one critical
    /// section, so deltas follow sequence order across writers. The
    /// baseline only moves once the record is stored; a dropped record
    /// leaves its time to the next one.
    fn try_store(&self, transport: &dyn Transport, data: &[u8], stamp: Stamp) -> TraceResult<()> {
        critical_section::with(|cs| {
            let last = self.last_us.borrow(cs);
            let now = self.platform.now_us();
            let delta = now.saturating_sub(last.get()).min(u64::from(u32::MAX)) as u32;
            let mut prefix = [0u8; MAX_VARINT_LEN];
            let n = encode_u32(delta, &mut prefix);
            transport.write_vectored(&[&prefix[..n], data], stamp, Timeout::NoWait)?;
            last.set(now);
            Ok(())
        })
    }
}

impl<'a> Encoder<'a> for RecordEncoder<'a> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&self, transport: &'a dyn Transport, cfg: Option<&dyn Any>) -> TraceResult<()> {
        let config = match cfg {
            None => RecordEncoderConfig::default(),
            Some(cfg) => *cfg
                .downcast_ref::<RecordEncoderConfig>()
                .ok_or(TraceError::InvalidArgument)?,
        };
        critical_section::with(|cs| {
            self.timestamps.borrow(cs).set(config.timestamps);
            self.last_us.borrow(cs).set(self.platform.now_us());
        });
        self.transport.set(transport);
        Ok(())
    }

    fn write(&self, data: &[u8], stamp: Stamp, timeout: Timeout) -> TraceResult<()> {
        let transport = self.transport.get()?;
        if !critical_section::with(|cs| self.timestamps.borrow(cs).get()) {
            return transport.write(data, stamp, timeout);
        }

        let timeout = if self.platform.in_isr() {
            Timeout::NoWait
        } else {
            timeout
        };
        let deadline = Deadline::start(self.platform, timeout);
        loop {
            match self.try_store(transport, data, stamp) {
                Err(TraceError::Busy) if timeout.is_blocking() => {
                    deadline.check(self.platform)?;
                    self.platform.yield_now();
                }
                other => return other,
            }
        }
    }
}
