//! The shared block arena.
//!
//! Writers reserve space under a short critical section, fill it without
//! holding any lock and seal it afterwards. A single reader walks sealed
//! blocks in reservation order and hands the space back once the host has
//! taken the data.
//!
//! Positions are virtual byte offsets that only ever grow; the physical
//! offset is `pos % N`. Four cursors partition the storage:
//!
//! ```text
//! free <= read <= write <= acquire <= free + N
//!
//! [free, read)      handed to the reader, not yet reclaimed
//! [read, write)     sealed, waiting for the reader
//! [write, acquire)  reserved, at least the first block not yet sealed
//! ```

use core::cell::{RefCell, UnsafeCell};
use core::sync::atomic::AtomicBool;

use apptrace_core::{Deadline, Platform, Stamp, Timeout, TraceError, TraceResult};
use critical_section::Mutex;

use crate::block::{align_up, flags, seq_after, Header, ALIGN, HEADER_SIZE};
use crate::ArenaInfo;

/// What a writer does when the arena has no room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowPolicy {
    /// Wait for the reader, up to the caller's timeout
    #[default]
    Block,
    /// Discard the oldest sealed blocks the reader has not picked up yet
    Overwrite,
}

/// Storage placement of a reserved block, computed under the lock
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub seq: u32,
    pub head: (usize, usize),
    pub tail: Option<(usize, usize)>,
    pub headers: (usize, Option<usize>),
}

/// A sealed block as seen by the reader
#[derive(Debug, Clone, Copy)]
pub(crate) struct Span {
    pub seq: u32,
    pub origin: u8,
    pub wr_cnt: u32,
    pub head: (usize, usize),
    pub tail: Option<(usize, usize)>,
}

pub(crate) struct State {
    pub acquire: u64,
    pub write: u64,
    pub read: u64,
    pub free: u64,
    pub next_seq: u32,
    pub outstanding: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub dropped: u32,
    pub dropped_pending: u32,
    pub min_free: usize,
    pub policy: OverflowPolicy,
}

impl State {
    const fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            acquire: 0,
            write: 0,
            read: 0,
            free: 0,
            next_seq: 0,
            outstanding: 0,
            ready: 0,
            in_flight: 0,
            dropped: 0,
            dropped_pending: 0,
            min_free: capacity,
            policy,
        }
    }
}

/// Fixed-size multi-writer block arena
pub struct Arena<const N: usize> {
    storage: UnsafeCell<[u8; N]>,
    pub(crate) state: Mutex<RefCell<State>>,
    pub(crate) reader_taken: AtomicBool,
}

// SAFETY: the storage is only reached through disjoint byte ranges handed
// out under `state`; bookkeeping itself lives behind the critical section.
unsafe impl<const N: usize> Sync for Arena<N> {}

impl<const N: usize> Arena<N> {
    const VALID: () = assert!(
        N % ALIGN == 0 && N >= 4 * HEADER_SIZE,
        "arena size must be 4-byte aligned and hold at least four headers"
    );

    /// Total storage in bytes
    pub const CAPACITY: usize = N;

    /// Create an empty arena
    pub const fn new(policy: OverflowPolicy) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        Self {
            storage: UnsafeCell::new([0; N]),
            state: Mutex::new(RefCell::new(State::new(N, policy))),
            reader_taken: AtomicBool::new(false),
        }
    }

    /// Largest payload a single block can carry
    pub const fn max_item_size() -> usize {
        let max = N - 2 * HEADER_SIZE;
        if max > u16::MAX as usize {
            u16::MAX as usize
        } else {
            max
        }
    }

    /// Current overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        critical_section::with(|cs| self.state.borrow_ref(cs).policy)
    }

    /// Switch the overflow policy; affects subsequent reservations only
    pub fn set_policy(&self, policy: OverflowPolicy) {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).policy = policy);
    }

    /// Snapshot of the arena bookkeeping
    pub fn info(&self) -> ArenaInfo {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            let used = (st.acquire - st.free) as usize;
            ArenaInfo {
                capacity: N,
                used_bytes: used,
                free_bytes: N - used,
                min_free_bytes: st.min_free,
                ready_blocks: st.ready,
                in_flight_blocks: st.in_flight,
                outstanding_grants: st.outstanding,
                dropped_blocks: st.dropped,
                next_seq: st.next_seq,
            }
        })
    }

    /// Bytes not held by any block
    pub fn free_size(&self) -> usize {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            N - (st.acquire - st.free) as usize
        })
    }

    /// Check if no block is reserved, sealed or in flight
    pub fn is_empty(&self) -> bool {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            st.acquire == st.free
        })
    }

    /// Blocks discarded by the overwrite policy since the last call
    pub fn take_dropped(&self) -> u32 {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            core::mem::take(&mut st.dropped_pending)
        })
    }

    /// Reserve `len` payload bytes without waiting.
    ///
    /// Fails with `Busy` when the arena cannot hold the block right now and
    /// with `InvalidArgument` for empty or oversized requests.
    pub fn try_acquire(&self, len: usize, stamp: Stamp) -> TraceResult<Grant<'_, N>> {
        if len == 0 || len > Self::max_item_size() {
            return Err(TraceError::InvalidArgument);
        }

        let (placement, discarded) = critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut discarded = 0u32;
            loop {
                if let Some(placement) = self.reserve(&mut st, len, stamp) {
                    return Ok((placement, discarded));
                }
                if st.policy == OverflowPolicy::Overwrite && self.discard_oldest(&mut st) {
                    discarded += 1;
                    continue;
                }
                return Err(TraceError::Busy);
            }
        })?;

        if discarded > 0 {
            debug!("arena full, overwrote {} blocks", discarded);
        }
        Ok(self.grant(placement))
    }

    /// Reserve `len` payload bytes, waiting up to `timeout` for space.
    ///
    /// Interrupt context never waits. On expiry nothing stays reserved.
    pub fn acquire(
        &self,
        len: usize,
        stamp: Stamp,
        timeout: Timeout,
        platform: &dyn Platform,
    ) -> TraceResult<Grant<'_, N>> {
        let timeout = if platform.in_isr() {
            Timeout::NoWait
        } else {
            timeout
        };
        let deadline = Deadline::start(platform, timeout);
        loop {
            match self.try_acquire(len, stamp) {
                Err(TraceError::Busy) if timeout.is_blocking() => {
                    deadline.check(platform)?;
                    platform.yield_now();
                }
                other => return other,
            }
        }
    }

    const fn phys(pos: u64) -> usize {
        (pos % N as u64) as usize
    }

    const fn lap_end(pos: u64) -> u64 {
        pos + (N - Self::phys(pos)) as u64
    }

    /// Move `pos` to the next lap when no header fits before the end
    const fn skip_tail(pos: u64) -> u64 {
        if N - Self::phys(pos) < HEADER_SIZE {
            Self::lap_end(pos)
        } else {
            pos
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, off: usize, len: usize) -> &mut [u8] {
        debug_assert!(off + len <= N);
        core::slice::from_raw_parts_mut((self.storage.get() as *mut u8).add(off), len)
    }

    pub(crate) unsafe fn bytes(&self, off: usize, len: usize) -> &[u8] {
        debug_assert!(off + len <= N);
        core::slice::from_raw_parts((self.storage.get() as *const u8).add(off), len)
    }

    // Headers are only touched while `state` is locked and never overlap a
    // payload handed out to a writer or the reader.
    fn header_at(&self, off: usize) -> Header {
        Header::decode(unsafe { self.bytes(off, HEADER_SIZE) })
    }

    fn put_header(&self, off: usize, hdr: &Header) {
        hdr.encode(unsafe { self.bytes_mut(off, HEADER_SIZE) });
    }

    fn mark_written(&self, off: usize) {
        let raw = unsafe { self.bytes_mut(off, HEADER_SIZE) };
        raw[6] |= flags::WRITTEN;
    }

    /// Virtual position just past the block starting at `pos`
    fn block_end(&self, pos: u64, hdr: &Header) -> u64 {
        let end = if hdr.is(flags::SPLIT) {
            Self::lap_end(pos) + self.header_at(0).footprint() as u64
        } else {
            pos + hdr.footprint() as u64
        };
        Self::skip_tail(end)
    }

    fn reserve(&self, st: &mut State, len: usize, stamp: Stamp) -> Option<Placement> {
        let avail = N - (st.acquire - st.free) as usize;
        let off = Self::phys(st.acquire);
        let room = N - off;
        let seq = st.next_seq;
        let header = |len: usize, flags: u8| Header {
            seq,
            len: len as u16,
            flags,
            origin: stamp.origin,
            wr_cnt: stamp.count,
        };

        let placement = if HEADER_SIZE + len <= room {
            let end = Self::skip_tail(st.acquire + (HEADER_SIZE + align_up(len)) as u64);
            if (end - st.acquire) as usize > avail {
                return None;
            }
            self.put_header(off, &header(len, 0));
            st.acquire = end;
            Placement {
                seq,
                head: (off + HEADER_SIZE, len),
                tail: None,
                headers: (off, None),
            }
        } else {
            let head = room - HEADER_SIZE;
            let rest = len - head;
            let end =
                Self::skip_tail(st.acquire + (room + HEADER_SIZE + align_up(rest)) as u64);
            if (end - st.acquire) as usize > avail {
                return None;
            }
            st.acquire = end;
            if head == 0 {
                self.put_header(off, &Header::dummy(seq));
                self.put_header(0, &header(len, 0));
                Placement {
                    seq,
                    head: (HEADER_SIZE, len),
                    tail: None,
                    headers: (0, None),
                }
            } else {
                self.put_header(off, &header(head, flags::SPLIT));
                self.put_header(0, &header(rest, 0));
                Placement {
                    seq,
                    head: (off + HEADER_SIZE, head),
                    tail: Some((HEADER_SIZE, rest)),
                    headers: (off, Some(0)),
                }
            }
        };

        st.next_seq = seq.wrapping_add(1);
        st.outstanding += 1;
        let free_now = N - (st.acquire - st.free) as usize;
        if free_now < st.min_free {
            st.min_free = free_now;
        }
        Some(placement)
    }

    fn grant(&self, placement: Placement) -> Grant<'_, N> {
        // SAFETY: the ranges were carved out of free space under the lock and
        // stay owned by this grant until it is sealed.
        let head = unsafe { self.bytes_mut(placement.head.0, placement.head.1) };
        let tail = match placement.tail {
            Some((off, len)) => unsafe { self.bytes_mut(off, len) },
            None => &mut [],
        };
        Grant {
            arena: self,
            seq: placement.seq,
            head,
            tail,
            headers: placement.headers,
            sealed: false,
        }
    }

    fn seal(&self, headers: (usize, Option<usize>)) {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            self.mark_written(headers.0);
            if let Some(off) = headers.1 {
                self.mark_written(off);
            }
            st.outstanding -= 1;
            self.advance_frontier(&mut st);
        });
    }

    /// Publish every leading run of sealed blocks to the reader
    fn advance_frontier(&self, st: &mut State) {
        while st.write < st.acquire {
            let off = Self::phys(st.write);
            let hdr = self.header_at(off);
            if hdr.is(flags::DUMMY) {
                st.write = Self::lap_end(st.write);
                continue;
            }
            if !hdr.is(flags::WRITTEN) {
                break;
            }
            st.write = self.block_end(st.write, &hdr);
            st.ready += 1;
        }
    }

    /// Take the next sealed block off the ready list
    pub(crate) fn next_span(&self, st: &mut State) -> Option<Span> {
        while st.read < st.write {
            let off = Self::phys(st.read);
            let hdr = self.header_at(off);
            if hdr.is(flags::DUMMY) {
                st.read = Self::lap_end(st.read);
                continue;
            }
            let tail = if hdr.is(flags::SPLIT) {
                let cont = self.header_at(0);
                Some((HEADER_SIZE, cont.len as usize))
            } else {
                None
            };
            st.read = self.block_end(st.read, &hdr);
            st.ready -= 1;
            st.in_flight += 1;
            return Some(Span {
                seq: hdr.seq,
                origin: hdr.origin,
                wr_cnt: hdr.wr_cnt,
                head: (off + HEADER_SIZE, hdr.len as usize),
                tail,
            });
        }
        None
    }

    /// Return space of blocks handed to the reader, oldest first.
    ///
    /// Stops at the first block whose sequence number is after `upto`.
    pub(crate) fn reclaim(&self, st: &mut State, upto: Option<u32>) -> usize {
        let mut count = 0;
        while st.free < st.read {
            let off = Self::phys(st.free);
            let hdr = self.header_at(off);
            if hdr.is(flags::DUMMY) {
                st.free = Self::lap_end(st.free);
                continue;
            }
            if let Some(upto) = upto {
                if seq_after(hdr.seq, upto) {
                    break;
                }
            }
            st.free = self.block_end(st.free, &hdr);
            count += 1;
        }
        st.in_flight -= count;
        count
    }

    /// Hand unreclaimed blocks back to the ready list
    pub(crate) fn rewind(&self, st: &mut State) {
        st.read = st.free;
        st.ready += st.in_flight;
        st.in_flight = 0;
    }

    /// Drop the oldest block nobody has picked up yet.
    ///
    /// Only possible while the reader holds nothing, so no block it may be
    /// looking at is ever reused.
    fn discard_oldest(&self, st: &mut State) -> bool {
        if st.free != st.read {
            return false;
        }
        if self.next_span(st).is_none() {
            return false;
        }
        self.reclaim(st, None);
        st.dropped = st.dropped.wrapping_add(1);
        st.dropped_pending = st.dropped_pending.saturating_add(1);
        true
    }
}

impl<const N: usize> Default for Arena<N> {
    fn default() -> Self {
        Self::new(OverflowPolicy::Block)
    }
}

/// Exclusive write access to a reserved block.
///
/// The payload may be split in two parts when the block wraps around the
/// end of the storage. Dropping a grant seals it.
pub struct Grant<'a, const N: usize> {
    arena: &'a Arena<N>,
    seq: u32,
    head: &'a mut [u8],
    tail: &'a mut [u8],
    headers: (usize, Option<usize>),
    sealed: bool,
}

impl<'a, const N: usize> Grant<'a, N> {
    /// Sequence number assigned at reservation
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// Always false, grants carry at least one byte
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the payload wraps around the end of the storage
    pub fn is_split(&self) -> bool {
        !self.tail.is_empty()
    }

    /// Both payload parts; the second one is empty unless the block wraps
    pub fn parts_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut *self.head, &mut *self.tail)
    }

    /// Copy `data` into the payload starting at `offset`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> TraceResult<()> {
        let end = offset.checked_add(data.len()).ok_or(TraceError::InvalidArgument)?;
        if end > self.len() {
            return Err(TraceError::InvalidArgument);
        }
        let split = self.head.len();
        if offset < split {
            let n = data.len().min(split - offset);
            self.head[offset..offset + n].copy_from_slice(&data[..n]);
            self.tail[..data.len() - n].copy_from_slice(&data[n..]);
        } else {
            let start = offset - split;
            self.tail[start..start + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    /// Fill the whole payload; `data` must be exactly [`Grant::len`] bytes
    pub fn fill(&mut self, data: &[u8]) -> TraceResult<()> {
        if data.len() != self.len() {
            return Err(TraceError::InvalidArgument);
        }
        self.write_at(0, data)
    }

    /// Publish the block to the reader
    pub fn seal(mut self) {
        self.seal_once();
    }

    fn seal_once(&mut self) {
        if !self.sealed {
            self.sealed = true;
            self.arena.seal(self.headers);
        }
    }
}

impl<const N: usize> Drop for Grant<'_, N> {
    fn drop(&mut self) {
        self.seal_once();
    }
}

impl<const N: usize> core::fmt::Debug for Grant<'_, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Grant")
            .field("seq", &self.seq)
            .field("len", &self.len())
            .field("split", &self.is_split())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> Stamp {
        Stamp::new(1, 0)
    }

    #[test]
    fn single_block_round_trip() {
        let arena = Arena::<128>::new(OverflowPolicy::Block);
        let mut grant = arena.try_acquire(5, stamp()).unwrap();
        grant.fill(b"hello").unwrap();
        assert_eq!(grant.seq(), 0);
        grant.seal();

        let info = arena.info();
        assert_eq!(info.ready_blocks, 1);
        assert_eq!(info.used_bytes, HEADER_SIZE + 8);
        assert_eq!(arena.free_size(), 128 - HEADER_SIZE - 8);
    }

    #[test]
    fn rejects_empty_and_oversized() {
        let arena = Arena::<64>::new(OverflowPolicy::Block);
        assert_eq!(arena.try_acquire(0, stamp()).unwrap_err(), TraceError::InvalidArgument);
        let max = Arena::<64>::max_item_size();
        assert_eq!(max, 64 - 2 * HEADER_SIZE);
        assert_eq!(
            arena.try_acquire(max + 1, stamp()).unwrap_err(),
            TraceError::InvalidArgument
        );
        assert!(arena.try_acquire(max, stamp()).is_ok());
    }

    #[test]
    fn full_arena_is_busy() {
        let arena = Arena::<64>::new(OverflowPolicy::Block);
        let _held = arena.try_acquire(24, stamp()).unwrap();
        let err = arena.try_acquire(24, stamp()).unwrap_err();
        assert_eq!(err, TraceError::Busy);
        assert_eq!(arena.info().outstanding_grants, 1);
    }

    #[test]
    fn unsealed_block_holds_back_later_ones() {
        let arena = Arena::<128>::new(OverflowPolicy::Block);
        let first = arena.try_acquire(4, stamp()).unwrap();
        arena.try_acquire(4, stamp()).unwrap().seal();
        assert_eq!(arena.info().ready_blocks, 0);
        first.seal();
        assert_eq!(arena.info().ready_blocks, 2);
    }

    #[test]
    fn dropping_a_grant_seals_it() {
        let arena = Arena::<64>::new(OverflowPolicy::Block);
        drop(arena.try_acquire(8, stamp()).unwrap());
        let info = arena.info();
        assert_eq!(info.outstanding_grants, 0);
        assert_eq!(info.ready_blocks, 1);
    }

    #[test]
    fn write_at_spans_both_parts() {
        let arena = Arena::<64>::new(OverflowPolicy::Block);
        // Push the acquire cursor to offset 48 so 16 bytes remain.
        arena.try_acquire(36, stamp()).unwrap().seal();
        {
            let mut reader = arena.reader().unwrap();
            assert_eq!(reader.drain_ready().count(), 1);
            reader.reclaim_all();
        }
        let mut grant = arena.try_acquire(10, stamp()).unwrap();
        assert!(grant.is_split());
        grant.write_at(0, b"0123456789").unwrap();
        let (head, tail) = grant.parts_mut();
        assert_eq!(head, b"0123");
        assert_eq!(tail, b"456789");
        assert_eq!(grant.write_at(8, b"abc").unwrap_err(), TraceError::InvalidArgument);
    }
}
