//! # Virtual-to-Logical Block Table
//!
//! The per-file DRAM index mapping application block numbers to the
//! logical blocks that currently hold their bytes. Cell value 0 means the
//! virtual block is a hole (or past EOF).
//!
//! The table only ever changes by replaying committed tx entries in chain
//! order — `catch_up` is the single mutator, and it runs under a dedicated
//! lock. A tail cursor records how far the log has been applied, so
//! catch-up is incremental and idempotent: with no new commits it is a
//! no-op. Every read or write path calls `catch_up` first and then works
//! against the snapshot it observed.

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::alloc::{Allocator, LogCursor};
use crate::config::{BITMAP_WORD_CAPACITY, BLOCK_SHIFT};
use crate::error::Result;
use crate::layout::bitmap::{self, Bitmap};
use crate::layout::tx::{TxCursor, TxEntry};
use crate::layout::{LogicalBlockIdx, VirtualBlockIdx};
use crate::log_mgr;
use crate::tx_mgr::ChainCtx;

/// Snapshot of the replayed prefix: where the tail sits and the logical
/// file size it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub cursor: TxCursor,
    pub file_size: u64,
}

struct Inner {
    table: Vec<LogicalBlockIdx>,
    tail: TxCursor,
    file_size: u64,
}

pub struct BlkTable {
    inner: Mutex<Inner>,
}

impl Default for BlkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlkTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: Vec::new(),
                tail: TxCursor::START,
                file_size: 0,
            }),
        }
    }

    /// Replay every committed entry newer than the tail cursor. With
    /// `allocator`, a full tail container gets a successor block allocated
    /// so the returned cursor is a valid commit position. With
    /// `init_bitmap`, every block the replay proves live is marked in the
    /// mirror (recovery).
    pub fn catch_up(
        &self,
        ctx: &ChainCtx<'_>,
        mut allocator: Option<&mut Allocator>,
        init_bitmap: Option<&[Bitmap]>,
    ) -> Result<FileState> {
        let mut inner = self.inner.lock();
        let mut replayed = 0u64;

        // a previous catch-up may have parked the tail past a full block
        if !ctx.handle_overflow(&mut inner.tail, allocator.as_deref_mut())? {
            return Ok(FileState {
                cursor: inner.tail,
                file_size: inner.file_size,
            });
        }

        loop {
            // chain blocks are live even while their tail slots are still
            // empty; mark before looking at the entry
            if let Some(bm) = init_bitmap {
                if inner.tail.lidx != 0 {
                    bitmap::set_allocated(bm, inner.tail.lidx);
                }
            }
            let Some(entry) = ctx.entry_at(inner.tail).map_err(crate::error::Error::Fatal)?
            else {
                break;
            };
            apply_entry(&mut inner, ctx, entry, init_bitmap)?;
            replayed += 1;
            if !ctx.advance(&mut inner.tail, allocator.as_deref_mut())? {
                break;
            }
        }

        if init_bitmap.is_some() {
            debug!(replayed, file_size = inner.file_size, "rebuilt block table from log");
        }
        Ok(FileState {
            cursor: inner.tail,
            file_size: inner.file_size,
        })
    }

    /// Current mapping for one virtual block; 0 is a hole.
    pub fn get(&self, vidx: VirtualBlockIdx) -> LogicalBlockIdx {
        let inner = self.inner.lock();
        inner.table.get(vidx as usize).copied().unwrap_or(0)
    }

    /// Mappings for `[begin_vidx, begin_vidx + n)` as one consistent
    /// snapshot, taken after the caller's catch-up.
    pub fn snapshot_range(
        &self,
        begin_vidx: VirtualBlockIdx,
        n: u32,
    ) -> SmallVec<[LogicalBlockIdx; 8]> {
        let inner = self.inner.lock();
        (begin_vidx..begin_vidx + n)
            .map(|v| inner.table.get(v as usize).copied().unwrap_or(0))
            .collect()
    }

    pub fn file_size(&self) -> u64 {
        self.inner.lock().file_size
    }
}

fn apply_entry(
    inner: &mut Inner,
    ctx: &ChainCtx<'_>,
    entry: TxEntry,
    init_bitmap: Option<&[Bitmap]>,
) -> Result<()> {
    if entry.is_inline() {
        let (num_blocks, begin_vidx, begin_lidx) = entry.inline_fields();
        if num_blocks == 0 {
            return Ok(()); // dummy filler
        }
        resize_to_fit(&mut inner.table, begin_vidx + num_blocks - 1);
        for i in 0..num_blocks {
            inner.table[(begin_vidx + i) as usize] = begin_lidx + i;
            if let Some(bm) = init_bitmap {
                bitmap::set_allocated(bm, begin_lidx + i);
            }
        }
        let end = u64::from(begin_vidx + num_blocks) << BLOCK_SHIFT as u64;
        inner.file_size = inner.file_size.max(end);
        return Ok(());
    }

    let (log_lidx, log_local) = entry.indirect_fields();
    let head = LogCursor {
        lidx: log_lidx,
        local: log_local,
    };
    let cov = log_mgr::coverage(head, ctx.mem_table, init_bitmap)
        .map_err(crate::error::Error::Fatal)?;

    resize_to_fit(&mut inner.table, cov.begin_vidx + cov.num_blocks - 1);
    let mut vidx = cov.begin_vidx;
    let mut remaining = cov.num_blocks;
    for &run in &cov.run_lidxs {
        let len = remaining.min(BITMAP_WORD_CAPACITY);
        for i in 0..len {
            inner.table[(vidx + i) as usize] = run + i;
        }
        vidx += len;
        remaining -= len;
    }

    let end =
        (u64::from(cov.begin_vidx + cov.num_blocks) << BLOCK_SHIFT as u64) - u64::from(cov.leftover_bytes);
    inner.file_size = inner.file_size.max(end);
    Ok(())
}

/// Grow the table to the next power of two that can hold `vidx`.
fn resize_to_fit(table: &mut Vec<LogicalBlockIdx>, vidx: VirtualBlockIdx) {
    let needed = vidx as usize + 1;
    if table.len() >= needed {
        return;
    }
    table.resize(needed.next_power_of_two(), 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_BITMAP_WORDS;
    use crate::mem_table::MemTable;
    use crate::tx_mgr;

    struct Fixture {
        mem_table: MemTable,
        bitmap: Vec<Bitmap>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.keep().join("blk_table.bin");
            let file = std::fs::File::options()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .unwrap();
            let mem_table = MemTable::new(file, 0).unwrap();
            mem_table.meta().init();
            let bitmap: Vec<Bitmap> = (0..NUM_BITMAP_WORDS).map(|_| Bitmap::new(0)).collect();
            bitmap[0].set(0);
            Fixture { mem_table, bitmap }
        }

        fn ctx(&self) -> ChainCtx<'_> {
            ChainCtx {
                mem_table: &self.mem_table,
                meta: self.mem_table.meta(),
                bitmap: &self.bitmap,
            }
        }
    }

    #[test]
    fn empty_log_yields_empty_state() {
        let fx = Fixture::new();
        let table = BlkTable::new();

        let state = table.catch_up(&fx.ctx(), None, None).unwrap();

        assert_eq!(state.cursor, TxCursor::START);
        assert_eq!(state.file_size, 0);
        assert_eq!(table.get(0), 0);
    }

    #[test]
    fn inline_commit_is_applied() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut alloc = Allocator::new(0);
        let table = BlkTable::new();

        let mut cursor = TxCursor::START;
        let entry = TxEntry::inline(2, 3, 100).unwrap();
        tx_mgr::commit(&ctx, &mut cursor, entry, &mut alloc).unwrap();

        let state = table.catch_up(&ctx, None, None).unwrap();

        assert_eq!(table.get(3), 100);
        assert_eq!(table.get(4), 101);
        assert_eq!(table.get(5), 0);
        assert_eq!(state.file_size, 5 * 4096);
        assert_eq!(state.cursor, TxCursor { lidx: 0, local: 1 });
    }

    #[test]
    fn catch_up_is_idempotent() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut alloc = Allocator::new(0);
        let table = BlkTable::new();
        let mut cursor = TxCursor::START;
        tx_mgr::commit(
            &ctx,
            &mut cursor,
            TxEntry::inline(1, 0, 64).unwrap(),
            &mut alloc,
        )
        .unwrap();

        let first = table.catch_up(&ctx, None, None).unwrap();
        let second = table.catch_up(&ctx, None, None).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn later_commit_overrides_earlier_mapping() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut alloc = Allocator::new(0);
        let table = BlkTable::new();
        let mut cursor = TxCursor::START;
        tx_mgr::commit(&ctx, &mut cursor, TxEntry::inline(1, 0, 64).unwrap(), &mut alloc).unwrap();
        tx_mgr::commit(&ctx, &mut cursor, TxEntry::inline(1, 0, 65).unwrap(), &mut alloc).unwrap();

        table.catch_up(&ctx, None, None).unwrap();

        assert_eq!(table.get(0), 65);
    }

    #[test]
    fn indirect_commit_applies_coverage_and_leftover() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut alloc = Allocator::new(0);
        let table = BlkTable::new();

        let runs = alloc.alloc_runs(70, &fx.bitmap).unwrap();
        let run_lidxs: Vec<LogicalBlockIdx> = runs.iter().map(|&(_, s)| s).collect();
        let head = log_mgr::append(&mut alloc, &fx.bitmap, &fx.mem_table, 96, 70, 0, &run_lidxs)
            .unwrap();
        let mut cursor = TxCursor::START;
        tx_mgr::commit(
            &ctx,
            &mut cursor,
            TxEntry::indirect(head.lidx, head.local),
            &mut alloc,
        )
        .unwrap();

        let state = table.catch_up(&ctx, None, None).unwrap();

        assert_eq!(state.file_size, 70 * 4096 - 96);
        assert_eq!(table.get(0), run_lidxs[0]);
        assert_eq!(table.get(63), run_lidxs[0] + 63);
        assert_eq!(table.get(64), run_lidxs[1]);
        assert_eq!(table.get(69), run_lidxs[1] + 5);
    }

    #[test]
    fn init_bitmap_marks_live_blocks_only() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut alloc = Allocator::new(0);
        let table = BlkTable::new();
        let mut cursor = TxCursor::START;
        tx_mgr::commit(&ctx, &mut cursor, TxEntry::inline(2, 0, 70).unwrap(), &mut alloc).unwrap();

        let mirror: Vec<Bitmap> = (0..NUM_BITMAP_WORDS).map(|_| Bitmap::new(0)).collect();
        table.catch_up(&ctx, None, Some(&mirror)).unwrap();

        assert!(bitmap::is_allocated(&mirror, 70));
        assert!(bitmap::is_allocated(&mirror, 71));
        assert!(
            !bitmap::is_allocated(&mirror, 72),
            "orphaned blocks stay free after recovery"
        );
    }

    #[test]
    fn snapshot_range_covers_holes_and_mappings() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut alloc = Allocator::new(0);
        let table = BlkTable::new();
        let mut cursor = TxCursor::START;
        tx_mgr::commit(&ctx, &mut cursor, TxEntry::inline(1, 2, 90).unwrap(), &mut alloc).unwrap();
        table.catch_up(&ctx, None, None).unwrap();

        let snap = table.snapshot_range(0, 4);

        assert_eq!(snap.as_slice(), &[0, 0, 90, 0]);
    }
}
