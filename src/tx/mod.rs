//! # Transaction Dispatch
//!
//! One write maps to one of three transaction shapes, picked by its
//! alignment; reads are their own, commit-free shape:
//!
//! - **Aligned**: block-aligned offset and count. Writes only fresh
//!   blocks, reads nothing, so commit needs no reconciliation.
//! - **SingleBlock**: the touched range stays within one block. The write
//!   copies the current block (the before-image), overlays the new bytes,
//!   and must reconcile on commit conflicts.
//! - **MultiBlock**: everything else — aligned semantics for the interior
//!   blocks, single-block semantics for the up-to-two partial boundary
//!   blocks, reconciliation only for those.
//!
//! ```text
//! [Start] → [Acquire offset if sequential] → [Allocate] → [Copy+persist]
//!        → [WriteLog] → [TryCommit] → ok → [End]
//!                                   → conflict → [Reconcile] → retry
//! ```

pub mod read;
pub mod write;

use crate::alloc::{Allocator, LogCursor};
use crate::blk_table::{BlkTable, FileState};
use crate::config::{BITMAP_WORD_CAPACITY, BLOCK_SHIFT, BLOCK_SIZE};
use crate::error::Result;
use crate::layout::tx::TxEntry;
use crate::layout::{LogicalBlockIdx, VirtualBlockIdx};
use crate::log_mgr;
use crate::shm::PerThreadData;
use crate::tx_mgr::ChainCtx;

/// Everything a transaction needs from its file.
pub struct TxCtx<'a> {
    pub chain: ChainCtx<'a>,
    pub blk_table: &'a BlkTable,
    /// The calling thread's liveness slot; catch-up records its tail tx
    /// block here so GC keeps the snapshot readable.
    pub pthread: Option<&'a PerThreadData>,
}

impl TxCtx<'_> {
    /// Writer-side catch-up: positions the tail at a valid commit slot,
    /// allocating a chain block if the tail container is full.
    pub fn update_for_write(&self, allocator: &mut Allocator) -> Result<FileState> {
        let state = self.blk_table.catch_up(&self.chain, Some(allocator), None)?;
        self.pin(state);
        Ok(state)
    }

    /// Reader-side catch-up: replay only, never allocates.
    pub fn update_for_read(&self) -> Result<FileState> {
        let state = self.blk_table.catch_up(&self.chain, None, None)?;
        self.pin(state);
        Ok(state)
    }

    fn pin(&self, state: FileState) {
        if let Some(pthread) = self.pthread {
            pthread.pin_tx_block(state.cursor.lidx);
        }
    }
}

/// Build the commit entry for a set of freshly written runs: inline when
/// one run with no leftover fits the packed word, a log chain otherwise.
pub fn build_commit(
    ctx: &TxCtx<'_>,
    allocator: &mut Allocator,
    num_blocks: u32,
    begin_vidx: VirtualBlockIdx,
    run_lidxs: &[LogicalBlockIdx],
    leftover_bytes: u16,
) -> Result<TxEntry> {
    if leftover_bytes == 0 && run_lidxs.len() == 1 {
        if let Some(entry) = TxEntry::inline(num_blocks, begin_vidx, run_lidxs[0]) {
            return Ok(entry);
        }
    }
    let head = log_mgr::append(
        allocator,
        ctx.chain.bitmap,
        ctx.chain.mem_table,
        leftover_bytes,
        num_blocks,
        begin_vidx,
        run_lidxs,
    )?;
    Ok(TxEntry::indirect(head.lidx, head.local))
}

/// Unused bytes a commit must record for a write ending at `write_end`.
///
/// Replay computes the file size as `max(old, block_end - leftover)`, so a
/// zero leftover is only sound when the write ends block-aligned or its
/// last block already lies within the file. Everything else records the
/// true gap.
pub fn leftover_for(write_end: u64, file_size: u64) -> u16 {
    let block_end = write_end.next_multiple_of(BLOCK_SIZE as u64);
    if write_end == block_end || block_end <= file_size {
        0
    } else {
        (block_end - write_end) as u16
    }
}

/// The logical block `entry` maps `vidx` to, if the entry covers it.
/// Drives reconciliation: a conflict whose coverage includes a boundary
/// block invalidates that block's before-image.
pub fn committed_lidx_of(
    ctx: &TxCtx<'_>,
    entry: TxEntry,
    vidx: VirtualBlockIdx,
) -> Result<Option<LogicalBlockIdx>> {
    if entry.is_inline() {
        let (num_blocks, begin_vidx, begin_lidx) = entry.inline_fields();
        if vidx >= begin_vidx && vidx < begin_vidx + num_blocks {
            return Ok(Some(begin_lidx + (vidx - begin_vidx)));
        }
        return Ok(None);
    }

    let (log_lidx, log_local) = entry.indirect_fields();
    let cov = log_mgr::coverage(
        LogCursor {
            lidx: log_lidx,
            local: log_local,
        },
        ctx.chain.mem_table,
        None,
    )
    .map_err(crate::error::Error::Fatal)?;
    if vidx < cov.begin_vidx || vidx >= cov.begin_vidx + cov.num_blocks {
        return Ok(None);
    }
    let delta = vidx - cov.begin_vidx;
    let run = cov.run_lidxs[(delta / BITMAP_WORD_CAPACITY) as usize];
    Ok(Some(run + delta % BITMAP_WORD_CAPACITY))
}

/// Virtual block holding byte `offset`.
pub fn vidx_of(offset: u64) -> VirtualBlockIdx {
    (offset >> BLOCK_SHIFT as u64) as VirtualBlockIdx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leftover_is_zero_for_aligned_end() {
        assert_eq!(leftover_for(8192, 0), 0);
    }

    #[test]
    fn leftover_is_zero_when_block_already_inside_file() {
        // overwrite within an existing tail block: replay must not grow
        // the file past the recorded size
        assert_eq!(leftover_for(110, 4096), 0);
        assert_eq!(leftover_for(8292, 12288), 0);
    }

    #[test]
    fn leftover_records_gap_for_extending_unaligned_write() {
        assert_eq!(leftover_for(8292, 8192), (12288 - 8292) as u16);
        assert_eq!(leftover_for(1, 0), 4095);
    }

    #[test]
    fn vidx_of_splits_at_block_boundaries() {
        assert_eq!(vidx_of(0), 0);
        assert_eq!(vidx_of(4095), 0);
        assert_eq!(vidx_of(4096), 1);
    }
}
