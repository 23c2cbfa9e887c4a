//! Binary `printf` capture.
//!
//! Instead of formatting text on the target, a log call stores the address
//! of its format string and the raw argument values; the host renders the
//! text later. Record layout, integers as varints; 64-bit values and
//! addresses as two varints, low word first:
//!
//! ```text
//! tag | fmt address | [fmt len | fmt bytes] | nargs | args...
//! ```
//!
//! The format string travels inline when [`LogConfig::inline_format`] is
//! set, flagged by [`TAG_INLINE_FMT`] in the tag. An overflow record
//! (`TAG_OVERFLOW | dropped`) reports records lost under backpressure.

use heapless::Vec;

use apptrace_core::{Destination, Stamp, Timeout, TraceError, TraceResult};

use crate::session::TraceContext;
use crate::varint::push_u32;

/// Largest encoded log record
pub const MAX_RECORD_SIZE: usize = 256;

/// Most arguments a single call may carry
pub const MAX_ARGS: usize = 16;

/// Tag of a `printf` record
pub const TAG_PRINTF: u8 = 0x01;
/// Tag of an overflow record
pub const TAG_OVERFLOW: u8 = 0x02;
/// Tag flag: the format string follows the address
pub const TAG_INLINE_FMT: u8 = 0x80;

/// Buffer a record is assembled in
pub type RecordBuf = Vec<u8, MAX_RECORD_SIZE>;

/// One captured `printf` argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Char(char),
    Str(&'a str),
    Ptr(usize),
}

macro_rules! impl_arg_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg<'_> {
                fn from(value: $ty) -> Self {
                    Arg::$variant(<$conv>::from(value))
                }
            }
        )*
    };
}

impl_arg_from! {
    i8 => I32 as i32,
    i16 => I32 as i32,
    i32 => I32 as i32,
    u8 => U32 as u32,
    u16 => U32 as u32,
    u32 => U32 as u32,
    bool => U32 as u32,
    i64 => I64 as i64,
    u64 => U64 as u64,
    f32 => F64 as f64,
    f64 => F64 as f64,
    char => Char as char,
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Str(value)
    }
}

impl<T> From<*const T> for Arg<'_> {
    fn from(value: *const T) -> Self {
        Arg::Ptr(value as usize)
    }
}

impl<T> From<*mut T> for Arg<'_> {
    fn from(value: *mut T) -> Self {
        Arg::Ptr(value as usize)
    }
}

/// Encoding options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// Embed the format string instead of relying on the host's symbols
    pub inline_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            inline_format: true,
        }
    }
}

/// Number of arguments a C-style format string consumes.
///
/// `%%` takes none, a `*` width or precision takes one extra.
pub fn count_conversions(fmt: &str) -> usize {
    let bytes = fmt.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            i += 1;
            continue;
        }
        count += 1;
        while let Some(&c) = bytes.get(i) {
            i += 1;
            match c {
                b'*' => count += 1,
                b'-' | b'+' | b' ' | b'#' | b'.' | b'0'..=b'9' => {}
                b'h' | b'l' | b'L' | b'q' | b'j' | b'z' | b't' => {}
                _ => break,
            }
        }
    }
    count
}

fn push(buf: &mut RecordBuf, bytes: &[u8]) -> TraceResult<()> {
    buf.extend_from_slice(bytes)
        .map_err(|_| TraceError::InvalidArgument)
}

fn push_varint(buf: &mut RecordBuf, value: u32) -> TraceResult<()> {
    push_u32(buf, value).map_err(|_| TraceError::InvalidArgument)
}

fn push_arg(buf: &mut RecordBuf, arg: &Arg<'_>) -> TraceResult<()> {
    match *arg {
        Arg::I32(v) => push_varint(buf, v as u32),
        Arg::U32(v) => push_varint(buf, v),
        Arg::I64(v) => push_u64(buf, v as u64),
        Arg::U64(v) => push_u64(buf, v),
        Arg::F64(v) => push(buf, &v.to_bits().to_le_bytes()),
        Arg::Char(c) => push_varint(buf, c as u32),
        Arg::Str(s) => {
            push_varint(buf, s.len() as u32)?;
            push(buf, s.as_bytes())
        }
        Arg::Ptr(p) => push_addr(buf, p),
    }
}

fn push_u64(buf: &mut RecordBuf, v: u64) -> TraceResult<()> {
    push_varint(buf, v as u32)?;
    push_varint(buf, (v >> 32) as u32)
}

fn push_addr(buf: &mut RecordBuf, addr: usize) -> TraceResult<()> {
    push_u64(buf, addr as u64)
}

/// Encode a `printf` record.
///
/// Fails with `InvalidArgument` when `args` does not match the format
/// string, when there are more than [`MAX_ARGS`] arguments or when the
/// record does not fit in [`MAX_RECORD_SIZE`] bytes.
pub fn encode_printf(
    buf: &mut RecordBuf,
    fmt: &str,
    args: &[Arg<'_>],
    config: &LogConfig,
) -> TraceResult<()> {
    if args.len() > MAX_ARGS || count_conversions(fmt) != args.len() {
        return Err(TraceError::InvalidArgument);
    }

    buf.clear();
    let tag = if config.inline_format {
        TAG_PRINTF | TAG_INLINE_FMT
    } else {
        TAG_PRINTF
    };
    push(buf, &[tag])?;
    push_addr(buf, fmt.as_ptr() as usize)?;
    if config.inline_format {
        push_varint(buf, fmt.len() as u32)?;
        push(buf, fmt.as_bytes())?;
    }
    push_varint(buf, args.len() as u32)?;
    for arg in args {
        push_arg(buf, arg)?;
    }
    Ok(())
}

/// Encode an overflow record reporting `dropped` lost records
pub fn encode_overflow(buf: &mut RecordBuf, dropped: u32) -> TraceResult<()> {
    buf.clear();
    push(buf, &[TAG_OVERFLOW])?;
    push_varint(buf, dropped)
}

/// Capture a `printf` call into the trace channel.
///
/// Returns the size of the record written.
pub fn vprintf_to(
    ctx: &TraceContext<'_>,
    dest: Destination,
    timeout: Timeout,
    fmt: &str,
    args: &[Arg<'_>],
) -> TraceResult<usize> {
    let mut buf = RecordBuf::new();
    encode_printf(&mut buf, fmt, args, &LogConfig::default())?;
    ctx.write(dest, &buf, timeout)?;
    Ok(buf.len())
}

/// Log channel that keeps track of records lost under backpressure.
///
/// The next record after a loss is preceded by an overflow record carrying
/// the number of records dropped.
pub struct LogTrace<'c, 'a> {
    ctx: &'c TraceContext<'a>,
    dest: Destination,
    origin: u8,
    wr_cnt: u32,
    config: LogConfig,
    dropped: u32,
}

impl<'c, 'a> LogTrace<'c, 'a> {
    pub fn new(ctx: &'c TraceContext<'a>, dest: Destination) -> Self {
        Self {
            ctx,
            dest,
            origin: Stamp::ANONYMOUS_ORIGIN,
            wr_cnt: 0,
            config: LogConfig::default(),
            dropped: 0,
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Tag records with a writer origin
    pub fn with_origin(mut self, origin: u8) -> Self {
        self.origin = origin;
        self
    }

    /// Records lost since the last overflow report
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Capture one `printf` call, returning the record size
    pub fn printf(&mut self, timeout: Timeout, fmt: &str, args: &[Arg<'_>]) -> TraceResult<usize> {
        let mut buf = RecordBuf::new();
        if self.dropped > 0 {
            encode_overflow(&mut buf, self.dropped)?;
            if let Err(err) = self.emit(&buf, timeout) {
                return Err(self.lost(err));
            }
            self.dropped = 0;
        }

        encode_printf(&mut buf, fmt, args, &self.config)?;
        match self.emit(&buf, timeout) {
            Ok(()) => Ok(buf.len()),
            Err(err) => Err(self.lost(err)),
        }
    }

    fn emit(&mut self, record: &[u8], timeout: Timeout) -> TraceResult<()> {
        self.ctx
            .write_stamped(self.dest, record, Stamp::new(self.origin, self.wr_cnt), timeout)?;
        self.wr_cnt = self.wr_cnt.wrapping_add(1);
        Ok(())
    }

    fn lost(&mut self, err: TraceError) -> TraceError {
        if err.is_backpressure() {
            self.dropped = self.dropped.saturating_add(1);
        }
        err
    }
}

/// Capture a `printf`-style call.
///
/// ```ignore
/// trace_printf!(&ctx, Destination::Jtag, Timeout::NoWait, "x=%d s=%s", 42, "hi")?;
/// ```
#[macro_export]
macro_rules! trace_printf {
    ($ctx:expr, $dest:expr, $timeout:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::logtrace::vprintf_to(
            $ctx,
            $dest,
            $timeout,
            $fmt,
            &[$($crate::logtrace::Arg::from($arg)),*],
        )
    };
}
