//! Read transactions: catch up, snapshot the mappings, copy out.
//!
//! Reads never allocate and never append a tx entry. The snapshot taken
//! after catch-up stays readable even while writers commit, because data
//! blocks referenced by committed entries are immutable until GC proves
//! no live thread can still reach them.

use crate::config::{BLOCK_SHIFT, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::tx::{vidx_of, TxCtx};

/// Copy up to `buf.len()` bytes at `offset` into `buf`, stopping at EOF.
/// Returns the bytes copied; holes read as zeros.
pub fn do_pread(ctx: &TxCtx<'_>, buf: &mut [u8], offset: u64) -> Result<usize> {
    let state = ctx.update_for_read()?;
    pread_with_size(ctx, buf, offset, state.file_size)
}

/// The copy loop, with the EOF decision already made by the caller (the
/// sequential read path clamps through the offset ticket instead).
pub fn pread_with_size(
    ctx: &TxCtx<'_>,
    buf: &mut [u8],
    offset: u64,
    file_size: u64,
) -> Result<usize> {
    if offset >= file_size || buf.is_empty() {
        return Ok(0);
    }
    let count = (buf.len() as u64).min(file_size - offset) as usize;

    let begin_vidx = vidx_of(offset);
    let end_vidx = vidx_of(offset + count as u64 - 1);
    let num_blocks = end_vidx - begin_vidx + 1;
    let lidxs = ctx.blk_table.snapshot_range(begin_vidx, num_blocks);

    let mut copied = 0usize;
    let mut in_block = (offset - (u64::from(begin_vidx) << BLOCK_SHIFT as u64)) as usize;
    for &lidx in lidxs.iter() {
        let bytes = (BLOCK_SIZE - in_block).min(count - copied);
        let dst = &mut buf[copied..copied + bytes];
        if lidx == 0 {
            dst.fill(0);
        } else {
            let block = ctx.chain.mem_table.block(lidx).map_err(Error::Fatal)?;
            // SAFETY: lidx came from a committed entry, so the block is
            // published and immutable; GC cannot reclaim it while this
            // thread's pin covers the snapshot.
            unsafe { block.copy_out(in_block, dst) };
        }
        copied += bytes;
        in_block = 0;
    }

    Ok(count)
}
