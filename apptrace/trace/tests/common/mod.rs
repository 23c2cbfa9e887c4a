//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use apptrace::{
    Destination, DrainReport, HostLink, Platform, Stamp, Timeout, Transport, TraceError,
    TraceResult,
};

pub struct TestPlatform {
    start: Instant,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Platform for TestPlatform {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
    fn core_id(&self) -> usize {
        0
    }
    fn in_isr(&self) -> bool {
        false
    }
    fn delay_us(&self, us: u32) {
        thread::sleep(Duration::from_micros(u64::from(us)));
    }
    fn yield_now(&self) {
        thread::yield_now();
    }
}

/// A frame as received by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub origin: u8,
    pub wr_cnt: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn parse(raw: &[u8]) -> Frame {
        let len = u16::from_le_bytes([raw[9], raw[10]]) as usize;
        assert_eq!(raw.len(), 11 + len, "frame length mismatch");
        Frame {
            seq: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            origin: raw[4],
            wr_cnt: u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]),
            payload: raw[11..].to_vec(),
        }
    }
}

/// Host link recording every frame in memory
pub struct MemLink {
    dest: Destination,
    connected: AtomicBool,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MemLink {
    pub fn new(dest: Destination) -> Self {
        Self {
            dest,
            connected: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|raw| Frame::parse(raw))
            .collect()
    }
}

impl HostLink for MemLink {
    fn link_type(&self) -> Destination {
        self.dest
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn send(&self, frame: &[&[u8]]) -> TraceResult<()> {
        self.frames.lock().unwrap().push(frame.concat());
        Ok(())
    }
}

/// Transport wrapper counting `init` calls
pub struct InitCounter<T> {
    pub inner: T,
    pub inits: AtomicUsize,
    pub fail_with: Option<TraceError>,
}

impl<T> InitCounter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            inits: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    pub fn failing(inner: T, err: TraceError) -> Self {
        Self {
            inner,
            inits: AtomicUsize::new(0),
            fail_with: Some(err),
        }
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
}

impl<T: Transport> Transport for InitCounter<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn init(&self, cfg: Option<&dyn Any>) -> TraceResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        // Give racing cores time to pile up at the barrier.
        thread::sleep(Duration::from_millis(5));
        match self.fail_with {
            Some(err) => Err(err),
            None => self.inner.init(cfg),
        }
    }
    fn link_type(&self) -> Destination {
        self.inner.link_type()
    }
    fn is_host_connected(&self) -> bool {
        self.inner.is_host_connected()
    }
    fn write_vectored(&self, parts: &[&[u8]], stamp: Stamp, timeout: Timeout) -> TraceResult<()> {
        self.inner.write_vectored(parts, stamp, timeout)
    }
    fn flush(&self, timeout: Timeout) -> TraceResult<()> {
        self.inner.flush(timeout)
    }
    fn flush_nolock(&self, min_size: usize, timeout: Timeout) -> TraceResult<()> {
        self.inner.flush_nolock(min_size, timeout)
    }
    fn pump(&self, timeout: Timeout) -> TraceResult<DrainReport> {
        self.inner.pump(timeout)
    }
    fn panic_handler(&self, info: &apptrace::PanicInfo<'_>) -> TraceResult<()> {
        self.inner.panic_handler(info)
    }
}
