//! Host links for hosted builds.
//!
//! [`CaptureLink`] keeps every frame in memory, which is what tests and
//! local tooling want. [`TcpLink`] and [`UdpLink`] forward frames to a host
//! listener; a socket error marks the link disconnected so writers stop
//! waiting on a host that went away.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use apptrace::drain::FRAME_HEADER_SIZE;
use apptrace::{Destination, HostLink, TraceError, TraceResult};
use thiserror::Error;

/// Failures of a socket host link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("host link is disconnected")]
    Disconnected,
    #[error("link state poisoned by a panicking sender")]
    Poisoned,
}

impl From<LinkError> for TraceError {
    fn from(_: LinkError) -> Self {
        TraceError::Link
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, LinkError> {
    mutex.lock().map_err(|_| LinkError::Poisoned)
}

/// A frame as the host receives it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub seq: u32,
    pub origin: u8,
    pub wr_cnt: u32,
    pub payload: Vec<u8>,
}

impl CapturedFrame {
    /// Decode one complete frame; `None` if `raw` is truncated or too long
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let hdr = raw.get(..FRAME_HEADER_SIZE)?;
        let len = usize::from(u16::from_le_bytes([hdr[9], hdr[10]]));
        if raw.len() != FRAME_HEADER_SIZE + len {
            return None;
        }
        Some(Self {
            seq: u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]),
            origin: hdr[4],
            wr_cnt: u32::from_le_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]),
            payload: raw[FRAME_HEADER_SIZE..].to_vec(),
        })
    }

    /// Split a byte stream into frames, stopping at the first incomplete one
    pub fn split_stream(mut stream: &[u8]) -> Vec<Self> {
        let mut frames = Vec::new();
        while stream.len() >= FRAME_HEADER_SIZE {
            let len = usize::from(u16::from_le_bytes([stream[9], stream[10]]));
            let Some(raw) = stream.get(..FRAME_HEADER_SIZE + len) else {
                break;
            };
            frames.extend(Self::parse(raw));
            stream = &stream[raw.len()..];
        }
        frames
    }
}

/// In-memory host link
pub struct CaptureLink {
    dest: Destination,
    connected: AtomicBool,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl CaptureLink {
    /// Connected link serving `dest`
    pub fn new(dest: Destination) -> Self {
        Self {
            dest,
            connected: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the host attaching or detaching
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Number of frames received so far
    pub fn frame_count(&self) -> usize {
        lock(&self.frames).map(|f| f.len()).unwrap_or(0)
    }

    /// Decoded copy of every frame received so far
    pub fn frames(&self) -> Vec<CapturedFrame> {
        lock(&self.frames)
            .map(|f| f.iter().filter_map(|raw| CapturedFrame::parse(raw)).collect())
            .unwrap_or_default()
    }

    /// Remove and return every frame received so far
    pub fn take_frames(&self) -> Vec<CapturedFrame> {
        lock(&self.frames)
            .map(|mut f| {
                f.drain(..)
                    .filter_map(|raw| CapturedFrame::parse(&raw))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl HostLink for CaptureLink {
    fn link_type(&self) -> Destination {
        self.dest
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, frame: &[&[u8]]) -> TraceResult<()> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected.into());
        }
        lock(&self.frames)?.push(frame.concat());
        Ok(())
    }
}

/// Host link streaming frames over a TCP connection
pub struct TcpLink {
    dest: Destination,
    connected: AtomicBool,
    stream: Mutex<TcpStream>,
}

impl TcpLink {
    /// Connect to a host listener
    pub fn connect<A: ToSocketAddrs>(addr: A, dest: Destination) -> Result<Self, LinkError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        log::info!("{} link connected to {}", dest, stream.peer_addr()?);
        Ok(Self {
            dest,
            connected: AtomicBool::new(true),
            stream: Mutex::new(stream),
        })
    }

    fn send_frame(&self, frame: &[&[u8]]) -> Result<(), LinkError> {
        let mut stream = lock(&self.stream)?;
        for part in frame {
            stream.write_all(part)?;
        }
        Ok(())
    }
}

impl HostLink for TcpLink {
    fn link_type(&self) -> Destination {
        self.dest
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, frame: &[&[u8]]) -> TraceResult<()> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected.into());
        }
        self.send_frame(frame).map_err(|err| {
            log::warn!("{} link lost: {}", self.dest, err);
            self.connected.store(false, Ordering::Release);
            TraceError::from(err)
        })
    }
}

/// Host link sending one datagram per frame
pub struct UdpLink {
    dest: Destination,
    connected: AtomicBool,
    socket: UdpSocket,
}

impl UdpLink {
    /// Bind an ephemeral local socket and aim it at a host listener
    pub fn connect<A: ToSocketAddrs>(addr: A, dest: Destination) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        log::info!("{} link sending to {}", dest, socket.peer_addr()?);
        Ok(Self {
            dest,
            connected: AtomicBool::new(true),
            socket,
        })
    }
}

impl HostLink for UdpLink {
    fn link_type(&self) -> Destination {
        self.dest
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, frame: &[&[u8]]) -> TraceResult<()> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected.into());
        }
        let datagram = frame.concat();
        match self.socket.send(&datagram) {
            Ok(n) if n == datagram.len() => Ok(()),
            Ok(n) => {
                log::warn!("{} link truncated a frame: {} of {} bytes", self.dest, n, datagram.len());
                Err(TraceError::Link)
            }
            Err(err) => {
                log::warn!("{} link lost: {}", self.dest, err);
                self.connected.store(false, Ordering::Release);
                Err(LinkError::from(err).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut raw = seq.to_le_bytes().to_vec();
        raw.push(9);
        raw.extend_from_slice(&4u32.to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn parse_checks_length() {
        let raw = raw_frame(3, b"abc");
        let frame = CapturedFrame::parse(&raw).unwrap();
        assert_eq!((frame.seq, frame.origin, frame.wr_cnt), (3, 9, 4));
        assert_eq!(frame.payload, b"abc");
        assert!(CapturedFrame::parse(&raw[..raw.len() - 1]).is_none());
        assert!(CapturedFrame::parse(&raw[..5]).is_none());
    }

    #[test]
    fn stream_split_keeps_complete_frames() {
        let mut stream = raw_frame(0, b"one");
        stream.extend(raw_frame(1, b""));
        stream.extend(&raw_frame(2, b"three")[..8]);
        let frames = CapturedFrame::split_stream(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].seq, 1);
        assert!(frames[1].payload.is_empty());
    }

    #[test]
    fn capture_refuses_when_detached() {
        let link = CaptureLink::new(Destination::Uart);
        link.send(&[&b"ab"[..], &b"cd"[..]]).unwrap();
        link.set_connected(false);
        assert_eq!(link.send(&[&b"x"[..]]), Err(TraceError::Link));
        assert_eq!(link.frame_count(), 1);
    }

    #[test]
    fn link_errors_convert() {
        let err = LinkError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.to_string().starts_with("socket error"));
        assert_eq!(TraceError::from(err), TraceError::Link);
    }
}
