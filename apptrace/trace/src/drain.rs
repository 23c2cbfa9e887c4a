//! Host drain: moves sealed blocks from the arena to the debug host.
//!
//! Each block travels as one frame:
//!
//! ```text
//! +---------+----------+-----------+---------+-----------------+
//! | seq u32 | origin u8| wr_cnt u32| len u16 | payload (len)   |
//! +---------+----------+-----------+---------+-----------------+
//! ```
//!
//! Integers are little-endian. A block is acknowledged, and its space
//! reclaimed, only after the link accepted the whole frame.

use apptrace_arena::{Arena, BlockRef, DrainReady, Reader};
use apptrace_core::{Deadline, Destination, Platform, Timeout, TraceError, TraceResult};

/// Size of the frame header preceding every payload
pub const FRAME_HEADER_SIZE: usize = 11;

/// The physical path to the host (JTAG mailbox, UART, socket...)
pub trait HostLink: Sync {
    /// Destination this link serves
    fn link_type(&self) -> Destination;

    /// Whether a host is attached and reading
    fn is_connected(&self) -> bool;

    /// Send one frame; `frame` lists its consecutive pieces
    fn send(&self, frame: &[&[u8]]) -> TraceResult<()>;
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Frames accepted by the link
    pub blocks: usize,
    /// Payload bytes accepted by the link
    pub bytes: usize,
    /// Sequence number of the newest acknowledged block
    pub last_seq: Option<u32>,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.blocks += other.blocks;
        self.bytes += other.bytes;
        if other.last_seq.is_some() {
            self.last_seq = other.last_seq;
        }
    }
}

/// Encode the frame header of `block`
pub fn frame_header(block: &BlockRef<'_>) -> [u8; FRAME_HEADER_SIZE] {
    let mut hdr = [0u8; FRAME_HEADER_SIZE];
    hdr[0..4].copy_from_slice(&block.seq.to_le_bytes());
    hdr[4] = block.origin;
    hdr[5..9].copy_from_slice(&block.wr_cnt.to_le_bytes());
    hdr[9..11].copy_from_slice(&(block.len() as u16).to_le_bytes());
    hdr
}

/// Drain side of one arena bound to one host link
pub struct HostDrain<'a, const N: usize, L: HostLink + ?Sized> {
    reader: Reader<'a, N>,
    link: &'a L,
}

impl<'a, const N: usize, L: HostLink + ?Sized> HostDrain<'a, N, L> {
    /// Wrap an already claimed reader
    pub fn new(reader: Reader<'a, N>, link: &'a L) -> Self {
        Self { reader, link }
    }

    /// Claim the reader of `arena`; `None` while another drain is active
    pub fn attach(arena: &'a Arena<N>, link: &'a L) -> Option<Self> {
        arena.reader().map(|reader| Self::new(reader, link))
    }

    /// Sealed blocks not yet handed to the host, oldest first
    pub fn drain_ready(&mut self) -> DrainReady<'_, N> {
        self.reader.drain_ready()
    }

    /// Whether the host end of the link is listening
    pub fn is_host_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Release every drained block up to and including `upto_seq`
    pub fn acknowledge(&mut self, upto_seq: u32) -> usize {
        self.reader.reclaim_drained(upto_seq)
    }

    /// Send ready blocks to the host.
    ///
    /// `NoWait` makes a single pass over what is ready now. A blocking
    /// timeout keeps draining newly sealed blocks until none are left or
    /// the deadline passes. When the link fails, everything not yet
    /// acknowledged is kept and resent on the next cycle.
    pub fn pump(&mut self, timeout: Timeout, platform: &dyn Platform) -> TraceResult<DrainReport> {
        let mut report = DrainReport::default();
        if !self.link.is_connected() {
            return Ok(report);
        }

        let deadline = Deadline::start(platform, timeout);
        loop {
            let pass = self.pass(timeout, &deadline, platform);
            let (sent, failure) = match pass {
                Ok(sent) => (sent, None),
                Err((sent, err)) => (sent, Some(err)),
            };
            if let Some(seq) = sent.last_seq {
                self.acknowledge(seq);
            }
            report.merge(sent);

            if let Some(err) = failure {
                self.reader.rewind();
                warn!("host link failed after {} blocks: {}", report.blocks, err);
                return Err(err);
            }
            if sent.blocks == 0 || !timeout.is_blocking() || deadline.check(platform).is_err() {
                break;
            }
        }
        Ok(report)
    }

    fn pass(
        &mut self,
        timeout: Timeout,
        deadline: &Deadline,
        platform: &dyn Platform,
    ) -> Result<DrainReport, (DrainReport, TraceError)> {
        let link = self.link;
        let mut sent = DrainReport::default();
        for block in self.reader.drain_ready() {
            let hdr = frame_header(&block);
            let (head, tail) = block.parts();
            if let Err(err) = link.send(&[&hdr, head, tail]) {
                return Err((sent, err));
            }
            sent.blocks += 1;
            sent.bytes += block.len();
            sent.last_seq = Some(block.seq);
            if timeout.is_blocking() && deadline.check(platform).is_err() {
                break;
            }
        }
        Ok(sent)
    }

    /// Give the reader back, e.g. to hand it to another drain
    pub fn into_reader(self) -> Reader<'a, N> {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptrace_arena::OverflowPolicy;
    use apptrace_core::Stamp;
    use core::cell::{Cell, RefCell};
    use critical_section::Mutex;

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

    /// Accepts `budget` frames, then fails
    struct FlakyLink {
        budget: Mutex<Cell<usize>>,
        frames: Mutex<RefCell<Vec<Vec<u8>>>>,
    }

    impl FlakyLink {
        fn new(budget: usize) -> Self {
            Self {
                budget: Mutex::new(Cell::new(budget)),
                frames: Mutex::new(RefCell::new(Vec::new())),
            }
        }

        fn refill(&self, budget: usize) {
            critical_section::with(|cs| self.budget.borrow(cs).set(budget));
        }

        fn seqs(&self) -> Vec<u32> {
            critical_section::with(|cs| {
                self.frames
                    .borrow_ref(cs)
                    .iter()
                    .map(|f| u32::from_le_bytes([f[0], f[1], f[2], f[3]]))
                    .collect()
            })
        }
    }

    impl HostLink for FlakyLink {
        fn link_type(&self) -> Destination {
            Destination::Jtag
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn send(&self, frame: &[&[u8]]) -> TraceResult<()> {
            critical_section::with(|cs| {
                let budget = self.budget.borrow(cs);
                if budget.get() == 0 {
                    return Err(TraceError::Link);
                }
                budget.set(budget.get() - 1);
                self.frames.borrow_ref_mut(cs).push(frame.concat());
                Ok(())
            })
        }
    }

    #[test]
    fn frame_layout() {
        let arena = Arena::<128>::new(OverflowPolicy::Block);
        arena.try_acquire(3, Stamp::new(9, 0x0102_0304)).unwrap().fill(b"xyz").unwrap();
        let mut reader = arena.reader().unwrap();
        let block = reader.next_block().unwrap();
        assert_eq!(frame_header(&block), [0, 0, 0, 0, 9, 4, 3, 2, 1, 3, 0]);
    }

    #[test]
    fn link_failure_rewinds_unacknowledged_blocks() {
        let arena = Arena::<256>::new(OverflowPolicy::Block);
        for i in 0..4u32 {
            arena.try_acquire(4, Stamp::new(0, i)).unwrap().fill(&i.to_le_bytes()).unwrap();
        }

        let link = FlakyLink::new(2);
        let mut drain = HostDrain::attach(&arena, &link).unwrap();
        assert_eq!(drain.pump(Timeout::NoWait, &NullClock), Err(TraceError::Link));
        assert_eq!(link.seqs(), vec![0, 1]);
        assert_eq!(arena.info().in_flight_blocks, 0);
        assert_eq!(arena.info().ready_blocks, 2);

        link.refill(10);
        let report = drain.pump(Timeout::NoWait, &NullClock).unwrap();
        assert_eq!(report.blocks, 2);
        assert_eq!(report.last_seq, Some(3));
        assert_eq!(link.seqs(), vec![0, 1, 2, 3]);
        assert!(arena.is_empty());
    }
}
