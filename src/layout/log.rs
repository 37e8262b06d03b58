//! Redo-log entries.
//!
//! A log entry names the blocks a transaction touched: a 16-byte head plus
//! a tail of 4-byte logical block indices, one per 64-block run. Entries
//! live in per-thread log blocks addressed in 8-byte slots; a head always
//! starts on an even slot so it is naturally 16-byte aligned, and its tail
//! packs two lidxs per slot immediately after it. An entry carries at most
//! [`MAX_RUNS_PER_LOG_ENTRY`] runs; larger transactions chain entries via
//! `has_next` and the successor address in the head.
//!
//! Log entries are written and flushed before the commit word that
//! references them is published, and are immutable afterwards.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{LOG_HEAD_SLOTS, MAX_RUNS_PER_LOG_ENTRY, NUM_LOG_SLOTS};
use crate::layout::{Block, LogicalBlockIdx, VirtualBlockIdx};

pub const LOG_OP_OVERWRITE: u8 = 0;
const FLAG_HAS_NEXT: u8 = 1;

/// Fixed 16-byte head of a log entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LogEntryHead {
    op: u8,
    flags: u8,
    num_blocks: U16,
    leftover_bytes: U16,
    next_local_idx: U16,
    begin_vidx: U32,
    next_block_lidx: U32,
}

const _: () = assert!(std::mem::size_of::<LogEntryHead>() == 16);

impl LogEntryHead {
    pub fn new(
        num_blocks: u16,
        begin_vidx: VirtualBlockIdx,
        leftover_bytes: u16,
        has_next: bool,
    ) -> Self {
        Self {
            op: LOG_OP_OVERWRITE,
            flags: if has_next { FLAG_HAS_NEXT } else { 0 },
            num_blocks: U16::new(num_blocks),
            leftover_bytes: U16::new(leftover_bytes),
            next_local_idx: U16::new(0),
            begin_vidx: U32::new(begin_vidx),
            next_block_lidx: U32::new(0),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= size_of::<Self>(),
            "buffer too small for LogEntryHead: {} < {}",
            bytes.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&bytes[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read LogEntryHead: {:?}", e))
    }

    pub fn op(&self) -> u8 {
        self.op
    }

    pub fn has_next(&self) -> bool {
        self.flags & FLAG_HAS_NEXT != 0
    }

    pub fn num_blocks(&self) -> u16 {
        self.num_blocks.get()
    }

    pub fn leftover_bytes(&self) -> u16 {
        self.leftover_bytes.get()
    }

    pub fn begin_vidx(&self) -> VirtualBlockIdx {
        self.begin_vidx.get()
    }

    /// Successor entry address: `(block_lidx, local_slot)`. A zero block
    /// lidx means the successor sits in the same block.
    pub fn next_entry(&self) -> (LogicalBlockIdx, u16) {
        (self.next_block_lidx.get(), self.next_local_idx.get())
    }

    pub fn set_next_local(&mut self, local: u16) {
        self.next_local_idx = U16::new(local);
    }

    pub fn set_next_block(&mut self, lidx: LogicalBlockIdx) {
        self.next_block_lidx = U32::new(lidx);
    }

    /// Runs in this entry's tail, derived from the block count.
    pub fn num_runs(&self) -> usize {
        (self.num_blocks.get() as usize).div_ceil(64)
    }

    /// Slots occupied by this entry (head + packed tail).
    pub fn num_slots(&self) -> u16 {
        slots_for_runs(self.num_runs())
    }
}

/// Slots needed for an entry carrying `runs` tail lidxs.
pub fn slots_for_runs(runs: usize) -> u16 {
    debug_assert!(runs <= MAX_RUNS_PER_LOG_ENTRY);
    LOG_HEAD_SLOTS + runs.div_ceil(2) as u16
}

/// Raw pointer to an 8-byte slot inside a log block.
///
/// # Safety
/// `block` must point at a mapped block and `local < NUM_LOG_SLOTS`.
pub unsafe fn slot_ptr(block: *const Block, local: u16) -> *mut u8 {
    debug_assert!((local as usize) < NUM_LOG_SLOTS);
    (*block).as_mut_ptr().add(local as usize * 8)
}

/// Read the `idx`-th tail lidx of the entry whose head sits at `head`.
///
/// # Safety
/// The entry must be fully written (published) and `idx < num_runs`.
pub unsafe fn read_tail_lidx(head: *const u8, idx: usize) -> LogicalBlockIdx {
    let p = head.add(size_of::<LogEntryHead>() + idx * 4) as *const u8;
    u32::from_le_bytes([*p, *p.add(1), *p.add(2), *p.add(3)])
}

/// Write the `idx`-th tail lidx of the entry whose head sits at `head`.
///
/// # Safety
/// The entry must be exclusively owned (not yet published).
pub unsafe fn write_tail_lidx(head: *mut u8, idx: usize, lidx: LogicalBlockIdx) {
    let p = head.add(size_of::<LogEntryHead>() + idx * 4);
    p.copy_from_nonoverlapping(lidx.to_le_bytes().as_ptr(), 4);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<LogEntryHead>(), 16);
    }

    #[test]
    fn head_roundtrips_through_bytes() {
        let mut head = LogEntryHead::new(130, 7, 100, true);
        head.set_next_local(42);
        head.set_next_block(9);

        let parsed = LogEntryHead::parse(head.as_bytes()).unwrap();

        assert_eq!(parsed.op(), LOG_OP_OVERWRITE);
        assert!(parsed.has_next());
        assert_eq!(parsed.num_blocks(), 130);
        assert_eq!(parsed.leftover_bytes(), 100);
        assert_eq!(parsed.begin_vidx(), 7);
        assert_eq!(parsed.next_entry(), (9, 42));
        assert_eq!(parsed.num_runs(), 3);
    }

    #[test]
    fn slot_accounting_packs_two_lidxs_per_slot() {
        assert_eq!(slots_for_runs(1), 3);
        assert_eq!(slots_for_runs(2), 3);
        assert_eq!(slots_for_runs(3), 4);
        assert_eq!(slots_for_runs(MAX_RUNS_PER_LOG_ENTRY), 8);
    }

    #[test]
    fn tail_lidxs_write_and_read_back() {
        let mut buf = [0u8; 64];
        let head = buf.as_mut_ptr();

        // SAFETY: buf is a local array large enough for head + 4 lidxs.
        unsafe {
            write_tail_lidx(head, 0, 100);
            write_tail_lidx(head, 1, 164);
            write_tail_lidx(head, 2, 999);

            assert_eq!(read_tail_lidx(head, 0), 100);
            assert_eq!(read_tail_lidx(head, 1), 164);
            assert_eq!(read_tail_lidx(head, 2), 999);
        }
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(LogEntryHead::parse(&[0u8; 8]).is_err());
    }
}
