//! Drain side of the arena.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use crate::arena::{Arena, Span};

impl<const N: usize> Arena<N> {
    /// Claim the single reader of this arena.
    ///
    /// Returns `None` while another [`Reader`] is alive.
    pub fn reader(&self) -> Option<Reader<'_, N>> {
        self.reader_taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Reader { arena: self })
    }

    fn block_ref(&self, span: Span) -> BlockRef<'_> {
        // SAFETY: spans between the free and read cursors are sealed and
        // cannot be reused until the reader reclaims them.
        let head = unsafe { self.bytes(span.head.0, span.head.1) };
        let tail: &[u8] = match span.tail {
            Some((off, len)) => unsafe { self.bytes(off, len) },
            None => &[],
        };
        BlockRef {
            seq: span.seq,
            origin: span.origin,
            wr_cnt: span.wr_cnt,
            head,
            tail,
        }
    }
}

/// Exclusive drain handle of an [`Arena`]
pub struct Reader<'a, const N: usize> {
    arena: &'a Arena<N>,
}

impl<'a, const N: usize> Reader<'a, N> {
    /// Take the next sealed block, in reservation order
    pub fn next_block(&mut self) -> Option<BlockRef<'_>> {
        let span = critical_section::with(|cs| {
            let mut st = self.arena.state.borrow_ref_mut(cs);
            self.arena.next_span(&mut st)
        })?;
        Some(self.arena.block_ref(span))
    }

    /// Iterate over every block sealed so far.
    ///
    /// Blocks stay in the arena until [`Reader::reclaim_drained`] or
    /// [`Reader::reclaim_all`] hands their space back.
    pub fn drain_ready(&mut self) -> DrainReady<'_, N> {
        DrainReady {
            arena: self.arena,
            _reader: PhantomData,
        }
    }

    /// Release drained blocks up to and including sequence number `upto`
    pub fn reclaim_drained(&mut self, upto: u32) -> usize {
        let count = critical_section::with(|cs| {
            let mut st = self.arena.state.borrow_ref_mut(cs);
            self.arena.reclaim(&mut st, Some(upto))
        });
        trace!("reclaimed {} blocks up to seq {}", count, upto);
        count
    }

    /// Release every drained block
    pub fn reclaim_all(&mut self) -> usize {
        critical_section::with(|cs| {
            let mut st = self.arena.state.borrow_ref_mut(cs);
            self.arena.reclaim(&mut st, None)
        })
    }

    /// Make drained but unreclaimed blocks available again.
    ///
    /// Used when the host link failed halfway and the data must be resent.
    pub fn rewind(&mut self) {
        critical_section::with(|cs| {
            let mut st = self.arena.state.borrow_ref_mut(cs);
            self.arena.rewind(&mut st);
        });
    }

    /// Number of sealed blocks waiting to be drained
    pub fn ready(&self) -> usize {
        critical_section::with(|cs| self.arena.state.borrow_ref(cs).ready)
    }

    /// Number of drained blocks not yet reclaimed
    pub fn in_flight(&self) -> usize {
        critical_section::with(|cs| self.arena.state.borrow_ref(cs).in_flight)
    }

    /// The arena this reader drains
    pub fn arena(&self) -> &'a Arena<N> {
        self.arena
    }
}

impl<const N: usize> Drop for Reader<'_, N> {
    fn drop(&mut self) {
        self.arena.reader_taken.store(false, Ordering::Release);
    }
}

/// Iterator returned by [`Reader::drain_ready`]
pub struct DrainReady<'r, const N: usize> {
    arena: &'r Arena<N>,
    _reader: PhantomData<&'r mut ()>,
}

impl<'r, const N: usize> Iterator for DrainReady<'r, N> {
    type Item = BlockRef<'r>;

    fn next(&mut self) -> Option<BlockRef<'r>> {
        let arena = self.arena;
        let span = critical_section::with(|cs| {
            let mut st = arena.state.borrow_ref_mut(cs);
            arena.next_span(&mut st)
        })?;
        Some(arena.block_ref(span))
    }
}

/// Read-only view of a sealed block
#[derive(Debug, Clone, Copy)]
pub struct BlockRef<'a> {
    /// Global sequence number
    pub seq: u32,
    /// Writer that produced the block
    pub origin: u8,
    /// Per-writer block counter
    pub wr_cnt: u32,
    head: &'a [u8],
    tail: &'a [u8],
}

impl<'a> BlockRef<'a> {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload parts; the second one is empty unless the block wraps
    pub fn parts(&self) -> (&'a [u8], &'a [u8]) {
        (self.head, self.tail)
    }

    /// Payload bytes in order
    pub fn bytes(&self) -> impl Iterator<Item = u8> + 'a {
        self.head.iter().chain(self.tail.iter()).copied()
    }

    /// Copy the payload into `out`, returning the number of bytes copied
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let n = self.head.len().min(out.len());
        out[..n].copy_from_slice(&self.head[..n]);
        let m = self.tail.len().min(out.len() - n);
        out[n..n + m].copy_from_slice(&self.tail[..m]);
        n + m
    }
}

impl PartialEq<[u8]> for BlockRef<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        self.len() == other.len() && self.bytes().eq(other.iter().copied())
    }
}
