//! # Per-Thread Block Allocator
//!
//! Each thread gets its own allocator per file. Block allocation claims
//! whole 64-block runs from the shared bitmap mirror (one CAS per word)
//! and serves fine-grained requests from a private DRAM free list, so the
//! hot path never touches shared state. Log entry slots come from private
//! log blocks owned by the thread.
//!
//! ## Free List
//!
//! The free list is a vector of `(run_length, start_lidx)` pairs kept
//! sorted ascending so best-fit lookup is a partition-point search. Freed
//! runs are appended and re-sorted; runs are never merged with existing
//! entries — the search cost outweighs the fragmentation benefit at this
//! scale. Runs never start at logical block 0 (block 0 is the meta block
//! and doubles as the hole marker).

use eyre::Result as EyreResult;
use smallvec::SmallVec;
use tracing::trace;

use crate::config::{BITMAP_WORD_CAPACITY, BLOCK_SIZE, NUM_LOG_SLOTS};
use crate::error::{Error, Result};
use crate::layout::bitmap::{self, Bitmap};
use crate::layout::LogicalBlockIdx;
use crate::mem_table::MemTable;

/// Address of a log entry: owning block plus 8-byte slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub lidx: LogicalBlockIdx,
    pub local: u16,
}

/// A run of freshly allocated blocks: `(length, first_lidx)`.
pub type AllocRuns = SmallVec<[(u32, LogicalBlockIdx); 4]>;

pub struct Allocator {
    free_list: Vec<(u32, LogicalBlockIdx)>,
    recent_bitmap_word: usize,
    /// Log blocks this thread has claimed, current one last.
    log_blocks: Vec<LogicalBlockIdx>,
    free_log_slot: u16,
    /// This thread's liveness slot in the file's shm region.
    per_thread_slot: usize,
    #[cfg(feature = "debug-counters")]
    blocks_allocated: u64,
}

impl Allocator {
    pub fn new(per_thread_slot: usize) -> Self {
        Self {
            free_list: Vec::new(),
            recent_bitmap_word: 0,
            log_blocks: Vec::new(),
            free_log_slot: NUM_LOG_SLOTS as u16,
            per_thread_slot,
            #[cfg(feature = "debug-counters")]
            blocks_allocated: 0,
        }
    }

    pub fn per_thread_slot(&self) -> usize {
        self.per_thread_slot
    }

    /// Allocate `n <= 64` contiguous blocks: best-fit from the free list,
    /// else claim a fresh 64-run from the bitmap and keep the surplus.
    pub fn alloc(&mut self, n: u32, bitmap: &[Bitmap]) -> Result<LogicalBlockIdx> {
        debug_assert!(n > 0 && n <= BITMAP_WORD_CAPACITY);

        let pos = self.free_list.partition_point(|&(len, _)| len < n);
        if pos < self.free_list.len() {
            let (len, start) = self.free_list[pos];
            debug_assert!(start != 0);
            trace!(start, n, "allocating from free list");
            if len == n {
                self.free_list.remove(pos);
            } else {
                self.free_list[pos] = (len - n, start + n);
                self.free_list.sort_unstable();
            }
            #[cfg(feature = "debug-counters")]
            {
                self.blocks_allocated += u64::from(n);
            }
            return Ok(start);
        }

        let word = bitmap::alloc_batch(bitmap, self.recent_bitmap_word)
            .ok_or(Error::OutOfSpace)?;
        self.recent_bitmap_word = word + 1;
        let start = word as LogicalBlockIdx * BITMAP_WORD_CAPACITY;
        if n < BITMAP_WORD_CAPACITY {
            self.free_list
                .push((BITMAP_WORD_CAPACITY - n, start + n));
            self.free_list.sort_unstable();
        }
        trace!(start, n, "allocating from bitmap batch");
        #[cfg(feature = "debug-counters")]
        {
            self.blocks_allocated += u64::from(n);
        }
        Ok(start)
    }

    /// Allocate `n` blocks of any count as runs of at most 64 blocks each.
    /// On exhaustion every already-claimed run goes back to the free list
    /// and the transaction is abandoned with no side effects.
    pub fn alloc_runs(&mut self, mut n: u32, bitmap: &[Bitmap]) -> Result<AllocRuns> {
        debug_assert!(n > 0);
        let mut runs = AllocRuns::new();
        while n > 0 {
            let len = n.min(BITMAP_WORD_CAPACITY);
            match self.alloc(len, bitmap) {
                Ok(start) => runs.push((len, start)),
                Err(e) => {
                    for (len, start) in runs {
                        self.free(start, len);
                    }
                    return Err(e);
                }
            }
            n -= len;
        }
        Ok(runs)
    }

    /// Return a run to the free list. No merging; lidx 0 is never a run.
    pub fn free(&mut self, lidx: LogicalBlockIdx, n: u32) {
        if lidx == 0 || n == 0 {
            return;
        }
        trace!(lidx, n, "adding to free list");
        self.free_list.push((n, lidx));
        self.free_list.sort_unstable();
    }

    /// Free a recycle image: coalesce consecutive non-zero entries into
    /// runs, then append each run to the free list.
    pub fn free_image(&mut self, image: &[LogicalBlockIdx]) {
        if image.is_empty() {
            return;
        }
        let mut group_begin = 0usize;
        let mut group_begin_lidx: LogicalBlockIdx = 0;

        for curr in 0..image.len() {
            if group_begin_lidx == 0 {
                if image[curr] == 0 {
                    continue;
                }
                group_begin = curr;
                group_begin_lidx = image[curr];
            } else {
                if image[curr] == group_begin_lidx + (curr - group_begin) as u32 {
                    continue;
                }
                self.free_list
                    .push(((curr - group_begin) as u32, group_begin_lidx));
                group_begin_lidx = image[curr];
                if group_begin_lidx != 0 {
                    group_begin = curr;
                }
            }
        }
        if group_begin_lidx != 0 {
            self.free_list
                .push(((image.len() - group_begin) as u32, group_begin_lidx));
        }
        self.free_list.sort_unstable();
    }

    /// Hand every cached run back to the shared bitmap. Called when the
    /// file handle is torn down so other threads can reuse the blocks.
    pub fn return_free_list(&mut self, bitmap: &[Bitmap]) {
        for (len, start) in self.free_list.drain(..) {
            for i in 0..len {
                bitmap::clear_allocated(bitmap, start + i);
            }
        }
    }

    /// Allocate `num_slots` contiguous 8-byte slots for one log entry. The
    /// head lands on an even slot so 16-byte fields stay naturally
    /// aligned; slots are zeroed on allocation. Claims a fresh log block
    /// when the current one cannot fit the entry.
    pub fn alloc_log_slots(
        &mut self,
        num_slots: u16,
        bitmap: &[Bitmap],
        mem_table: &MemTable,
    ) -> Result<LogCursor> {
        debug_assert!(num_slots as usize <= NUM_LOG_SLOTS);
        let mut local = self.free_log_slot.next_multiple_of(2);
        if self.log_blocks.is_empty() || local + num_slots > NUM_LOG_SLOTS as u16 {
            let lidx = self.alloc(1, bitmap)?;
            let block = mem_table.addr(lidx).map_err(Error::Fatal)?;
            // SAFETY: the block was just claimed by this thread; recycled
            // blocks may hold stale bytes.
            unsafe { (*block).zero() };
            self.log_blocks.push(lidx);
            local = 0;
        }
        let lidx = *self.log_blocks.last().expect("log block claimed above");
        self.free_log_slot = local + num_slots;
        Ok(LogCursor { lidx, local })
    }
}

/// Copy `buf` into freshly allocated runs block by block, flushing without
/// fencing; the caller fences once. A short final block is zero-padded.
///
/// Returns an error only if the file cannot grow to back a run.
pub fn fill_runs(
    runs: &[(u32, LogicalBlockIdx)],
    buf: &[u8],
    mem_table: &MemTable,
) -> EyreResult<()> {
    let mut copied = 0usize;
    for &(len, start) in runs {
        for i in 0..len {
            let bytes = BLOCK_SIZE.min(buf.len() - copied);
            let block = mem_table.block(start + i)?;
            // SAFETY: the run is exclusively owned by the calling thread
            // until its commit entry is published.
            unsafe {
                block.copy_in(0, &buf[copied..copied + bytes]);
                if bytes < BLOCK_SIZE {
                    std::ptr::write_bytes(block.as_mut_ptr().add(bytes), 0, BLOCK_SIZE - bytes);
                }
                crate::layout::persist::persist_unfenced(block.as_ptr(), BLOCK_SIZE);
            }
            copied += bytes;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror(words: usize) -> Vec<Bitmap> {
        (0..words).map(|_| Bitmap::new(0)).collect()
    }

    fn mirror_with_reserved() -> Vec<Bitmap> {
        let words = mirror(8);
        words[0].set(0); // block 0 is never allocatable
        words
    }

    #[test]
    fn alloc_batch_claims_a_full_word() {
        let words = mirror_with_reserved();
        let mut alloc = Allocator::new(0);

        let start = alloc.alloc(64, &words).unwrap();

        assert_eq!(start, 64, "word 0 is partially used, word 1 is claimed");
        assert_eq!(words[1].load(), u64::MAX);
    }

    #[test]
    fn small_alloc_keeps_surplus_in_free_list() {
        let words = mirror_with_reserved();
        let mut alloc = Allocator::new(0);

        let a = alloc.alloc(3, &words).unwrap();
        let b = alloc.alloc(3, &words).unwrap();

        assert_eq!(a, 64);
        assert_eq!(b, 67, "second alloc is served from the cached surplus");
        assert_eq!(words[2].load(), 0, "no second bitmap word touched");
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_run() {
        let words = mirror_with_reserved();
        let mut alloc = Allocator::new(0);
        alloc.free(100, 2);
        alloc.free(200, 10);

        let got = alloc.alloc(2, &words).unwrap();

        assert_eq!(got, 100);
    }

    #[test]
    fn exact_fit_removes_entry_larger_fit_shrinks_it() {
        let words = mirror_with_reserved();
        let mut alloc = Allocator::new(0);
        alloc.free(100, 4);

        assert_eq!(alloc.alloc(4, &words).unwrap(), 100);

        alloc.free(300, 6);
        assert_eq!(alloc.alloc(2, &words).unwrap(), 300);
        assert_eq!(alloc.alloc(4, &words).unwrap(), 302);
    }

    #[test]
    fn free_of_block_zero_is_ignored() {
        let mut alloc = Allocator::new(0);

        alloc.free(0, 5);

        assert!(alloc.free_list.is_empty());
    }

    #[test]
    fn alloc_runs_splits_into_64_block_runs() {
        let words = mirror_with_reserved();
        let mut alloc = Allocator::new(0);

        let runs = alloc.alloc_runs(130, &words).unwrap();

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], (64, 64));
        assert_eq!(runs[1], (64, 128));
        assert_eq!(runs[2].0, 2);
    }

    #[test]
    fn alloc_runs_rolls_back_on_exhaustion() {
        let words = mirror(2);
        words[0].set(0);
        let mut alloc = Allocator::new(0);

        let err = alloc.alloc_runs(200, &words).unwrap_err();

        assert!(matches!(err, Error::OutOfSpace));
        // the one claimable word is cached for a later, smaller request
        assert_eq!(alloc.alloc(64, &words).unwrap(), 64);
    }

    #[test]
    fn free_image_coalesces_consecutive_entries() {
        let mut alloc = Allocator::new(0);

        alloc.free_image(&[0, 100, 101, 102, 0, 200, 300, 301]);

        let mut list = alloc.free_list.clone();
        list.sort_unstable();
        // 100..=102 and 300..=301 coalesce; 200 stands alone
        assert_eq!(list, vec![(1, 200), (2, 300), (3, 100)]);
    }

    #[test]
    fn free_image_never_produces_overlapping_runs() {
        let mut alloc = Allocator::new(0);

        alloc.free_image(&[10, 11, 12, 50, 51, 13, 14]);

        let mut covered = std::collections::HashSet::new();
        for &(len, start) in &alloc.free_list {
            for i in 0..len {
                assert!(covered.insert(start + i), "block {} freed twice", start + i);
            }
        }
    }

    #[test]
    fn return_free_list_clears_bitmap_bits() {
        let words = mirror_with_reserved();
        let mut alloc = Allocator::new(0);
        alloc.alloc(4, &words).unwrap();

        alloc.return_free_list(&words);

        // 4 blocks still allocated, the 60-block surplus is returned
        assert_eq!(words[1].load(), 0xf);
    }
}
