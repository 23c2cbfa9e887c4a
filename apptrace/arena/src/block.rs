//! Block header layout.
//!
//! Every block in the arena starts with a fixed header:
//!
//! ```text
//! 0      4      6       7        8        12
//! +------+------+-------+--------+--------+----------------
//! | seq  | len  | flags | origin | wr_cnt | payload (len)..
//! +------+------+-------+--------+--------+----------------
//! ```
//!
//! All fields are little-endian. Payloads are padded to [`ALIGN`] bytes so
//! the next header always starts aligned. A block that does not fit before
//! the end of the storage is split in two parts, both carrying the same
//! sequence number; the first part has [`flags::SPLIT`] set.

/// Size of a block header in bytes
pub const HEADER_SIZE: usize = 12;

/// Alignment of headers and payloads
pub const ALIGN: usize = 4;

/// Header flag bits
pub mod flags {
    /// The writer sealed the block
    pub const WRITTEN: u8 = 0x01;
    /// First part of a block continued at the start of the storage
    pub const SPLIT: u8 = 0x02;
    /// Padding to the end of the storage, carries no payload
    pub const DUMMY: u8 = 0x04;
}

/// Round `len` up to the block alignment
pub const fn align_up(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub seq: u32,
    pub len: u16,
    pub flags: u8,
    pub origin: u8,
    pub wr_cnt: u32,
}

impl Header {
    pub const fn dummy(seq: u32) -> Self {
        Self {
            seq,
            len: 0,
            flags: flags::DUMMY,
            origin: 0,
            wr_cnt: 0,
        }
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            seq: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            len: u16::from_le_bytes([raw[4], raw[5]]),
            flags: raw[6],
            origin: raw[7],
            wr_cnt: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    pub fn encode(&self, raw: &mut [u8]) {
        raw[0..4].copy_from_slice(&self.seq.to_le_bytes());
        raw[4..6].copy_from_slice(&self.len.to_le_bytes());
        raw[6] = self.flags;
        raw[7] = self.origin;
        raw[8..12].copy_from_slice(&self.wr_cnt.to_le_bytes());
    }

    pub const fn is(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Bytes this part occupies in the storage, header included
    pub const fn footprint(&self) -> usize {
        HEADER_SIZE + align_up(self.len as usize)
    }
}

/// `a` comes strictly after `b` in wrapping sequence order
pub(crate) const fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
