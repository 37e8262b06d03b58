//! # Redo-Log Composition and Decoding
//!
//! One transaction produces one chain of log entries naming every block it
//! wrote: the starting virtual block, the first logical block of each
//! 64-block run, and how many bytes of the last block are unused. The
//! chain is written into the committing thread's private log blocks and
//! flushed before the commit word that references its head is published,
//! so a reader that observes the commit word can always decode the chain.
//!
//! Entries are planned in two phases: first every entry's slot range is
//! allocated, then the entries are written with their successor addresses
//! already known. This keeps each entry write-once — no patching of
//! already-flushed heads.

use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::alloc::{Allocator, LogCursor};
use crate::config::{BITMAP_WORD_CAPACITY, MAX_RUNS_PER_LOG_ENTRY};
use crate::error::Result;
use crate::layout::bitmap::{self, Bitmap};
use crate::layout::log::{self, LogEntryHead};
use crate::layout::persist;
use crate::layout::{LogicalBlockIdx, VirtualBlockIdx};
use crate::mem_table::MemTable;

/// Decoded coverage of one log chain.
#[derive(Debug, Clone)]
pub struct Coverage {
    pub begin_vidx: VirtualBlockIdx,
    pub num_blocks: u32,
    pub leftover_bytes: u16,
    /// First logical block of each 64-block run, in order.
    pub run_lidxs: SmallVec<[LogicalBlockIdx; 4]>,
}

/// Write the redo record for one transaction and return the cursor of its
/// head entry. `run_lidxs` carries one lidx per 64-block run; the last run
/// may be shorter, and `leftover_bytes` counts the unused tail of the very
/// last block.
pub fn append(
    allocator: &mut Allocator,
    bitmap: &[Bitmap],
    mem_table: &MemTable,
    leftover_bytes: u16,
    num_blocks: u32,
    begin_vidx: VirtualBlockIdx,
    run_lidxs: &[LogicalBlockIdx],
) -> Result<LogCursor> {
    debug_assert!(num_blocks > 0);
    debug_assert_eq!(
        run_lidxs.len(),
        (num_blocks as usize).div_ceil(BITMAP_WORD_CAPACITY as usize)
    );

    // phase 1: allocate every entry's slots so successor links are known
    let num_entries = run_lidxs.len().div_ceil(MAX_RUNS_PER_LOG_ENTRY);
    let mut cursors: SmallVec<[LogCursor; 2]> = SmallVec::new();
    for chunk in run_lidxs.chunks(MAX_RUNS_PER_LOG_ENTRY) {
        cursors.push(allocator.alloc_log_slots(
            log::slots_for_runs(chunk.len()),
            bitmap,
            mem_table,
        )?);
    }

    // phase 2: write and flush entries front to back
    let mut blocks_left = num_blocks;
    let mut vidx = begin_vidx;
    for (i, chunk) in run_lidxs.chunks(MAX_RUNS_PER_LOG_ENTRY).enumerate() {
        let cursor = cursors[i];
        let is_last = i + 1 == num_entries;
        let entry_blocks = if is_last {
            blocks_left
        } else {
            (chunk.len() as u32) * BITMAP_WORD_CAPACITY
        };

        let mut head = LogEntryHead::new(
            entry_blocks as u16,
            vidx,
            if is_last { leftover_bytes } else { 0 },
            !is_last,
        );
        if !is_last {
            let next = cursors[i + 1];
            head.set_next_local(next.local);
            if next.lidx != cursor.lidx {
                head.set_next_block(next.lidx);
            }
        }

        let block = mem_table.addr(cursor.lidx).map_err(crate::error::Error::Fatal)?;
        // SAFETY: the slots were allocated for this thread above and are
        // not yet referenced by any commit word.
        unsafe {
            let head_ptr = log::slot_ptr(block, cursor.local);
            let head_bytes = head.as_bytes();
            std::ptr::copy_nonoverlapping(head_bytes.as_ptr(), head_ptr, head_bytes.len());
            for (j, &lidx) in chunk.iter().enumerate() {
                log::write_tail_lidx(head_ptr, j, lidx);
            }
            persist::persist_unfenced(head_ptr, log::slots_for_runs(chunk.len()) as usize * 8);
        }

        blocks_left -= entry_blocks;
        vidx += entry_blocks;
    }
    persist::fence();

    Ok(cursors[0])
}

/// Walk a published log chain and concatenate its coverage. When `mark` is
/// given (recovery), every visited log block and every covered data block
/// is marked allocated in the bitmap mirror.
pub fn coverage(
    head: LogCursor,
    mem_table: &MemTable,
    mark: Option<&[Bitmap]>,
) -> eyre::Result<Coverage> {
    let mut cursor = head;
    let mut out: Option<Coverage> = None;

    loop {
        if let Some(bm) = mark {
            bitmap::set_allocated(bm, cursor.lidx);
        }
        let block = mem_table.addr(cursor.lidx)?;
        // SAFETY: the chain was flushed before the commit word referencing
        // it was published; the acquire-load of that word ordered these
        // reads.
        let (entry, next) = unsafe {
            let head_ptr = log::slot_ptr(block, cursor.local);
            let bytes = std::slice::from_raw_parts(head_ptr, size_of::<LogEntryHead>());
            let entry = *LogEntryHead::parse(bytes)?;
            let mut runs: SmallVec<[LogicalBlockIdx; 4]> = SmallVec::new();
            for j in 0..entry.num_runs() {
                runs.push(log::read_tail_lidx(head_ptr, j));
            }
            (
                (entry, runs),
                entry.has_next().then(|| entry.next_entry()),
            )
        };
        let (head_entry, runs) = entry;

        if let Some(bm) = mark {
            let mut remaining = head_entry.num_blocks() as u32;
            for &run in &runs {
                let len = remaining.min(BITMAP_WORD_CAPACITY);
                for i in 0..len {
                    bitmap::set_allocated(bm, run + i);
                }
                remaining -= len;
            }
        }

        match &mut out {
            None => {
                out = Some(Coverage {
                    begin_vidx: head_entry.begin_vidx(),
                    num_blocks: head_entry.num_blocks() as u32,
                    leftover_bytes: head_entry.leftover_bytes(),
                    run_lidxs: runs,
                });
            }
            Some(cov) => {
                cov.num_blocks += head_entry.num_blocks() as u32;
                cov.leftover_bytes = head_entry.leftover_bytes();
                cov.run_lidxs.extend(runs);
            }
        }

        match next {
            None => break,
            Some((next_block, next_local)) => {
                cursor = LogCursor {
                    lidx: if next_block == 0 { cursor.lidx } else { next_block },
                    local: next_local,
                };
            }
        }
    }

    Ok(out.expect("chain has at least one entry"))
}
