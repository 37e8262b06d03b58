//! Write transactions: aligned, single-block, and multi-block.
//!
//! Every write is out-of-place: fresh blocks are allocated, filled, and
//! persisted before a commit entry publishes them. Aligned writes read no
//! existing block, so their commit loop skips conflicts without looking at
//! them. The unaligned shapes copy a before-image of each partial boundary
//! block and must reconcile when the commit CAS loses: the winning entry
//! may have republished a boundary block, in which case the unchanged
//! prefix/suffix bytes are re-copied from the winner's block before the
//! next attempt.

use smallvec::SmallVec;

use crate::alloc::{self, Allocator};
use crate::config::{BLOCK_SHIFT, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::layout::persist;
use crate::layout::tx::TxCursor;
use crate::layout::{Block, LogicalBlockIdx};
use crate::tx::{build_commit, committed_lidx_of, leftover_for, vidx_of, TxCtx};
use crate::tx_mgr::{self, TryCommit};

/// Dispatch a positional write. Returns the cursor the commit landed at.
pub fn do_pwrite(
    ctx: &TxCtx<'_>,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
) -> Result<TxCursor> {
    debug_assert!(!buf.is_empty());
    let count = buf.len() as u64;
    if offset % BLOCK_SIZE as u64 == 0 && count % BLOCK_SIZE as u64 == 0 {
        aligned_tx(ctx, allocator, buf, offset)
    } else if vidx_of(offset) == vidx_of(offset + count - 1) {
        single_block_tx(ctx, allocator, buf, offset)
    } else {
        multi_block_tx(ctx, allocator, buf, offset)
    }
}

/// Block-aligned offset and count: no before-image, no reconciliation.
fn aligned_tx(
    ctx: &TxCtx<'_>,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
) -> Result<TxCursor> {
    let state = ctx.update_for_write(allocator)?;
    let num_blocks = (buf.len() >> BLOCK_SHIFT) as u32;

    let runs = allocator.alloc_runs(num_blocks, ctx.chain.bitmap)?;
    alloc::fill_runs(&runs, buf, ctx.chain.mem_table).map_err(Error::Fatal)?;
    persist::fence();

    let run_lidxs: SmallVec<[LogicalBlockIdx; 4]> = runs.iter().map(|&(_, s)| s).collect();
    let entry = build_commit(ctx, allocator, num_blocks, vidx_of(offset), &run_lidxs, 0)?;
    let mut cursor = state.cursor;
    tx_mgr::commit(&ctx.chain, &mut cursor, entry, allocator)
}

/// The touched range lies within one block: full copy-on-write.
fn single_block_tx(
    ctx: &TxCtx<'_>,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
) -> Result<TxCursor> {
    let count = buf.len();
    let vidx = vidx_of(offset);
    let in_block = (offset % BLOCK_SIZE as u64) as usize;

    let state = ctx.update_for_write(allocator)?;
    let new_lidx = allocator.alloc(1, ctx.chain.bitmap)?;
    let dst = ctx.chain.mem_table.block(new_lidx).map_err(Error::Fatal)?;

    let src_lidx = ctx.blk_table.get(vidx);
    cow_into(ctx, dst, src_lidx)?;
    // SAFETY: dst was claimed by this thread above and is unpublished.
    unsafe {
        dst.copy_in(in_block, buf);
        persist::persist_fenced(dst.as_ptr(), BLOCK_SIZE);
    }

    let leftover = leftover_for(offset + count as u64, state.file_size);
    let entry = build_commit(ctx, allocator, 1, vidx, &[new_lidx], leftover)?;

    let mut cursor = state.cursor;
    loop {
        match tx_mgr::try_commit_once(&ctx.chain, &mut cursor, entry, allocator)? {
            TryCommit::Committed(at) => return Ok(at),
            TryCommit::Conflict(winner) => {
                // the winner may have republished our source block, making
                // the copied before-image stale
                if let Some(fresh) = committed_lidx_of(ctx, winner, vidx)? {
                    recopy_around(ctx, dst, fresh, in_block, count)?;
                }
            }
        }
    }
}

/// Unaligned write spanning several blocks: aligned semantics inside,
/// copy-on-write on the partial boundary blocks.
fn multi_block_tx(
    ctx: &TxCtx<'_>,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
) -> Result<TxCursor> {
    let count = buf.len();
    let end_offset = offset + count as u64;
    let begin_vidx = vidx_of(offset);
    let end_vidx = vidx_of(end_offset - 1);
    let num_blocks = end_vidx - begin_vidx + 1;
    let in_block = (offset % BLOCK_SIZE as u64) as usize;
    let end_in_block = (end_offset % BLOCK_SIZE as u64) as usize;
    let head_partial = in_block != 0;
    let tail_partial = end_in_block != 0;

    let state = ctx.update_for_write(allocator)?;
    let runs = allocator.alloc_runs(num_blocks, ctx.chain.bitmap)?;

    for i in 0..num_blocks {
        let dst_lidx = nth_lidx(&runs, i);
        let dst = ctx.chain.mem_table.block(dst_lidx).map_err(Error::Fatal)?;
        // SAFETY (all arms): dst blocks were claimed above, unpublished.
        if i == 0 && head_partial {
            cow_into(ctx, dst, ctx.blk_table.get(begin_vidx))?;
            unsafe { dst.copy_in(in_block, &buf[..BLOCK_SIZE - in_block]) };
        } else if i == num_blocks - 1 && tail_partial {
            cow_into(ctx, dst, ctx.blk_table.get(end_vidx))?;
            unsafe { dst.copy_in(0, &buf[count - end_in_block..]) };
        } else {
            let buf_off = i as usize * BLOCK_SIZE - in_block;
            unsafe { dst.copy_in(0, &buf[buf_off..buf_off + BLOCK_SIZE]) };
        }
        // SAFETY: dst is a mapped block.
        unsafe { persist::persist_unfenced(dst.as_ptr(), BLOCK_SIZE) };
    }
    persist::fence();

    let leftover = leftover_for(end_offset, state.file_size);
    let run_lidxs: SmallVec<[LogicalBlockIdx; 4]> = runs.iter().map(|&(_, s)| s).collect();
    let entry = build_commit(ctx, allocator, num_blocks, begin_vidx, &run_lidxs, leftover)?;

    let mut cursor = state.cursor;
    loop {
        match tx_mgr::try_commit_once(&ctx.chain, &mut cursor, entry, allocator)? {
            TryCommit::Committed(at) => return Ok(at),
            TryCommit::Conflict(winner) => {
                // only the partial boundary blocks carry a before-image
                if head_partial {
                    if let Some(fresh) = committed_lidx_of(ctx, winner, begin_vidx)? {
                        let dst = ctx
                            .chain
                            .mem_table
                            .block(nth_lidx(&runs, 0))
                            .map_err(Error::Fatal)?;
                        recopy_around(ctx, dst, fresh, in_block, BLOCK_SIZE - in_block)?;
                    }
                }
                if tail_partial {
                    if let Some(fresh) = committed_lidx_of(ctx, winner, end_vidx)? {
                        let dst = ctx
                            .chain
                            .mem_table
                            .block(nth_lidx(&runs, num_blocks - 1))
                            .map_err(Error::Fatal)?;
                        recopy_around(ctx, dst, fresh, 0, end_in_block)?;
                    }
                }
            }
        }
    }
}

/// Copy the current contents of `src_lidx` into `dst` (zeros for a hole).
fn cow_into(ctx: &TxCtx<'_>, dst: &Block, src_lidx: LogicalBlockIdx) -> Result<()> {
    // SAFETY: dst is exclusively owned by the caller; src, when present,
    // is a published immutable block.
    unsafe {
        if src_lidx == 0 {
            dst.zero();
        } else {
            let src = ctx.chain.mem_table.block(src_lidx).map_err(Error::Fatal)?;
            dst.copy_from_block(src);
        }
    }
    Ok(())
}

/// Refresh the unchanged bytes around the written range `[in_block,
/// in_block + count)` from a newly committed source block, then re-persist.
fn recopy_around(
    ctx: &TxCtx<'_>,
    dst: &Block,
    src_lidx: LogicalBlockIdx,
    in_block: usize,
    count: usize,
) -> Result<()> {
    let src = ctx.chain.mem_table.block(src_lidx).map_err(Error::Fatal)?;
    // SAFETY: dst is still unpublished (its commit keeps failing); src is
    // published and immutable.
    unsafe {
        if in_block > 0 {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), in_block);
        }
        let tail_start = in_block + count;
        if tail_start < BLOCK_SIZE {
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(tail_start),
                dst.as_mut_ptr().add(tail_start),
                BLOCK_SIZE - tail_start,
            );
        }
        persist::persist_fenced(dst.as_ptr(), BLOCK_SIZE);
    }
    Ok(())
}

/// Logical block `i` blocks into a run list.
fn nth_lidx(runs: &[(u32, LogicalBlockIdx)], mut i: u32) -> LogicalBlockIdx {
    for &(len, start) in runs {
        if i < len {
            return start + i;
        }
        i -= len;
    }
    unreachable!("index {} beyond allocated runs", i)
}
