//! # Garbage Collection
//!
//! The tx chain only ever grows, and every overwrite strands the block it
//! replaced. GC reclaims both: it rewrites the reclaimable prefix of the
//! chain as a compact encoding of the file state at the *safe boundary*,
//! swings `meta.log_head` to the new chain, and frees the old prefix
//! blocks plus every data block displaced before the boundary.
//!
//! ## Safe Boundary
//!
//! Every live thread pins the tx block its replay cursor sits in. The
//! boundary is the first chain block (in chain order) pinned by any alive
//! thread, or the tail block itself. Blocks at or after the boundary are
//! off-limits: a pinned reader may still resume replay there, and may
//! still read data blocks that entries after the boundary displaced. Only
//! displacements that committed *before* the boundary are reclaimed.
//!
//! ## Replay Equivalence
//!
//! Replay after a cycle reads: inline entries, then the new chain (the
//! boundary-time state, re-applied over the inline effects it already
//! includes), then the untouched suffix from the boundary on. The final
//! table is identical to a replay of the old chain.
//!
//! Log entry blocks referenced by reclaimed commits are left allocated:
//! their owning thread may still append entries to them, and ownership is
//! not recoverable from the layout. The next recovery (shm rebuild)
//! returns them.

use hashbrown::HashSet;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::alloc::{Allocator, LogCursor};
use crate::config::{
    BITMAP_WORD_CAPACITY, BLOCK_SHIFT, BLOCK_SIZE, MAX_BLOCKS_PER_INLINE_TX,
    NUM_TX_ENTRY_PER_BLOCK,
};
use crate::error::{Error, Result};
use crate::layout::tx::{TxEntry, TxLogBlock};
use crate::layout::{persist, LogicalBlockIdx, VirtualBlockIdx};
use crate::log_mgr;
use crate::shm::ShmMgr;
use crate::tx::TxCtx;

/// One reclamation cycle; returns without effect when there is nothing
/// worth collecting.
pub fn run(ctx: &TxCtx<'_>, shm: &ShmMgr, allocator: &mut Allocator) -> Result<()> {
    let state = ctx.update_for_read()?;
    let tail = state.cursor.lidx;
    if tail == 0 {
        return Ok(()); // commits still fit inline
    }
    let head = ctx.chain.meta.log_head();
    if head == 0 || head == tail {
        return Ok(());
    }

    let boundary = safe_boundary(ctx, shm, head, tail)?;
    let prefix = chain_prefix(ctx, head, boundary)?;
    if prefix.len() < 2 {
        return Ok(());
    }

    let shadow = shadow_replay(ctx, &prefix)?;
    if !size_is_encodable(&shadow) {
        // a hole at EOF cannot be expressed by run entries; a later write
        // will fill it and the next cycle collects
        return Ok(());
    }
    let new_blocks = encode_chain(ctx, allocator, &shadow, boundary)?;
    if new_blocks.len() >= prefix.len() {
        // not worth it; the candidate blocks link to the boundary but are
        // unreachable, so they are plain free blocks
        for &lidx in &new_blocks {
            allocator.free(lidx, 1);
        }
        return Ok(());
    }

    {
        let guard = ctx.chain.meta.lock();
        if ctx.chain.meta.log_head() != head {
            // another collector rebuilt the chain under us
            drop(guard);
            for &lidx in &new_blocks {
                allocator.free(lidx, 1);
            }
            return Ok(());
        }
        ctx.chain.meta.set_log_head(&guard, new_blocks[0]);
    }
    debug!(
        old_prefix = prefix.len(),
        new_chain = new_blocks.len(),
        displaced = shadow.displaced.len(),
        "tx chain rewritten"
    );

    // a thread may have pinned a prefix block between the boundary scan
    // and the swing; if so, leave the old blocks for the next recovery
    let prefix_set: HashSet<LogicalBlockIdx> = prefix.iter().copied().collect();
    if any_alive_pin_in(shm, &prefix_set) {
        trace!("late pin on old prefix; skipping the free pass");
        return Ok(());
    }

    allocator.free_image(&shadow.displaced);
    for &lidx in &prefix {
        allocator.free(lidx, 1);
    }
    Ok(())
}

/// First chain block, in chain order, pinned by an alive thread — or the
/// tail block when nothing earlier is pinned.
fn safe_boundary(
    ctx: &TxCtx<'_>,
    shm: &ShmMgr,
    head: LogicalBlockIdx,
    tail: LogicalBlockIdx,
) -> Result<LogicalBlockIdx> {
    let pins = alive_pins(shm);
    let mut lidx = head;
    while lidx != 0 && lidx != tail {
        if pins.contains(&lidx) {
            return Ok(lidx);
        }
        lidx = tx_block(ctx, lidx)?.next();
    }
    Ok(tail)
}

fn alive_pins(shm: &ShmMgr) -> HashSet<LogicalBlockIdx> {
    let mut pins = HashSet::new();
    for idx in 0..crate::config::MAX_NUM_THREADS {
        let slot = shm.per_thread(idx);
        if slot.is_initialized() && slot.is_alive() {
            let pin = slot.pinned_tx_block();
            if pin != 0 {
                pins.insert(pin);
            }
        }
    }
    pins
}

fn any_alive_pin_in(shm: &ShmMgr, set: &HashSet<LogicalBlockIdx>) -> bool {
    alive_pins(shm).iter().any(|pin| set.contains(pin))
}

fn chain_prefix(
    ctx: &TxCtx<'_>,
    head: LogicalBlockIdx,
    boundary: LogicalBlockIdx,
) -> Result<Vec<LogicalBlockIdx>> {
    let mut prefix = Vec::new();
    let mut lidx = head;
    while lidx != 0 && lidx != boundary {
        prefix.push(lidx);
        lidx = tx_block(ctx, lidx)?.next();
    }
    Ok(prefix)
}

fn tx_block<'a>(ctx: &TxCtx<'a>, lidx: LogicalBlockIdx) -> Result<&'a TxLogBlock> {
    let block = ctx.chain.mem_table.block(lidx).map_err(Error::Fatal)?;
    // SAFETY: lidx was reached through the tx chain.
    Ok(unsafe { block.as_tx_log() })
}

/// File state as of the boundary, plus every block displaced on the way.
struct Shadow {
    table: Vec<LogicalBlockIdx>,
    file_size: u64,
    /// Displaced blocks in replay order; consecutive overwrites coalesce
    /// into runs for `free_image`.
    displaced: Vec<LogicalBlockIdx>,
}

fn shadow_replay(ctx: &TxCtx<'_>, prefix: &[LogicalBlockIdx]) -> Result<Shadow> {
    let mut shadow = Shadow {
        table: Vec::new(),
        file_size: 0,
        displaced: Vec::new(),
    };

    for slot in ctx.chain.meta.inline_tx_entries() {
        match slot.load() {
            Some(entry) => shadow_apply(ctx, &mut shadow, entry)?,
            None => break,
        }
    }
    for &lidx in prefix {
        for slot in tx_block(ctx, lidx)?.entries() {
            match slot.load() {
                Some(entry) => shadow_apply(ctx, &mut shadow, entry)?,
                None => break,
            }
        }
    }
    Ok(shadow)
}

fn shadow_apply(ctx: &TxCtx<'_>, shadow: &mut Shadow, entry: TxEntry) -> Result<()> {
    let (begin_vidx, num_blocks, runs, leftover): (u32, u32, SmallVec<[u32; 4]>, u16) =
        if entry.is_inline() {
            let (n, vidx, lidx) = entry.inline_fields();
            if n == 0 {
                return Ok(());
            }
            (vidx, n, SmallVec::from_slice(&[lidx]), 0)
        } else {
            let (log_lidx, log_local) = entry.indirect_fields();
            let cov = log_mgr::coverage(
                LogCursor {
                    lidx: log_lidx,
                    local: log_local,
                },
                ctx.chain.mem_table,
                None,
            )
            .map_err(Error::Fatal)?;
            (cov.begin_vidx, cov.num_blocks, cov.run_lidxs, cov.leftover_bytes)
        };

    let end = (begin_vidx + num_blocks) as usize;
    if shadow.table.len() < end {
        shadow.table.resize(end, 0);
    }
    let mut vidx = begin_vidx;
    let mut remaining = num_blocks;
    for &run in &runs {
        let len = remaining.min(BITMAP_WORD_CAPACITY);
        for i in 0..len {
            let cell = &mut shadow.table[(vidx + i) as usize];
            if *cell != 0 && *cell != run + i {
                shadow.displaced.push(*cell);
            }
            *cell = run + i;
        }
        vidx += len;
        remaining -= len;
    }
    let end_bytes = (u64::from(begin_vidx + num_blocks) << BLOCK_SHIFT as u64) - u64::from(leftover);
    shadow.file_size = shadow.file_size.max(end_bytes);
    Ok(())
}

/// The rebuilt chain encodes the file size through its final entry, so
/// the size must end inside (or at the end of) the last mapped block.
fn size_is_encodable(shadow: &Shadow) -> bool {
    if shadow.file_size == 0 {
        return shadow.table.iter().all(|&l| l == 0);
    }
    let last_mapped = match shadow.table.iter().rposition(|&l| l != 0) {
        Some(v) => v as u64,
        None => return false,
    };
    shadow.file_size.next_multiple_of(BLOCK_SIZE as u64) == (last_mapped + 1) << BLOCK_SHIFT as u64
}

/// Encode the shadow state as a fresh chain whose last block links to the
/// boundary. Entries are inline runs of consecutive blocks; an unaligned
/// file size turns the final run into an indirect entry carrying the
/// leftover count.
fn encode_chain(
    ctx: &TxCtx<'_>,
    allocator: &mut Allocator,
    shadow: &Shadow,
    boundary: LogicalBlockIdx,
) -> Result<Vec<LogicalBlockIdx>> {
    let mut writer = ChainWriter {
        ctx,
        blocks: Vec::new(),
        slot: 0,
    };

    let leftover = (shadow.file_size.next_multiple_of(BLOCK_SIZE as u64) - shadow.file_size) as u16;
    let mut run_start: Option<(VirtualBlockIdx, LogicalBlockIdx)> = None;
    let mut run_len: u32 = 0;
    for vidx in 0..shadow.table.len() as u32 {
        let lidx = shadow.table[vidx as usize];
        let continues = match run_start {
            Some((_, start_lidx)) => {
                lidx != 0 && lidx == start_lidx + run_len && run_len < MAX_BLOCKS_PER_INLINE_TX
            }
            None => false,
        };
        if continues {
            run_len += 1;
            continue;
        }
        if let Some((start_vidx, start_lidx)) = run_start.take() {
            writer.emit_run(allocator, start_vidx, start_lidx, run_len, 0)?;
        }
        if lidx != 0 {
            run_start = Some((vidx, lidx));
            run_len = 1;
        }
    }
    if let Some((start_vidx, start_lidx)) = run_start {
        writer.emit_run(allocator, start_vidx, start_lidx, run_len, leftover)?;
    }

    writer.finish(allocator, boundary)
}

struct ChainWriter<'a, 'b> {
    ctx: &'b TxCtx<'a>,
    blocks: Vec<LogicalBlockIdx>,
    slot: usize,
}

impl ChainWriter<'_, '_> {
    fn emit_run(
        &mut self,
        allocator: &mut Allocator,
        begin_vidx: VirtualBlockIdx,
        begin_lidx: LogicalBlockIdx,
        num_blocks: u32,
        leftover: u16,
    ) -> Result<()> {
        let entry = if leftover == 0 {
            TxEntry::inline(num_blocks, begin_vidx, begin_lidx)
                .expect("runs are capped at inline field widths")
        } else {
            let head = log_mgr::append(
                allocator,
                self.ctx.chain.bitmap,
                self.ctx.chain.mem_table,
                leftover,
                num_blocks,
                begin_vidx,
                &[begin_lidx],
            )?;
            TxEntry::indirect(head.lidx, head.local)
        };
        self.store(allocator, entry)
    }

    fn store(&mut self, allocator: &mut Allocator, entry: TxEntry) -> Result<()> {
        if self.blocks.is_empty() || self.slot == NUM_TX_ENTRY_PER_BLOCK {
            let lidx = allocator.alloc(1, self.ctx.chain.bitmap)?;
            let block = self.ctx.chain.mem_table.block(lidx).map_err(Error::Fatal)?;
            // SAFETY: freshly claimed by this thread, not yet linked.
            unsafe {
                block.zero();
                block.as_tx_log().init(*self.blocks.last().unwrap_or(&0));
            }
            if let Some(&prev) = self.blocks.last() {
                tx_block(self.ctx, prev)?
                    .try_set_next(lidx)
                    .expect("unlinked candidate chain is private");
            }
            self.blocks.push(lidx);
            self.slot = 0;
        }
        let lidx = *self.blocks.last().expect("block exists");
        tx_block(self.ctx, lidx)?.entries()[self.slot]
            .try_commit(entry)
            .expect("candidate block slots start zeroed");
        self.slot += 1;
        Ok(())
    }

    /// Pad the tail block with dummies, link it to the boundary, persist.
    fn finish(
        mut self,
        allocator: &mut Allocator,
        boundary: LogicalBlockIdx,
    ) -> Result<Vec<LogicalBlockIdx>> {
        if self.blocks.is_empty() {
            self.store(allocator, TxEntry::DUMMY)?;
        }
        while self.slot < NUM_TX_ENTRY_PER_BLOCK {
            let lidx = *self.blocks.last().expect("block exists");
            tx_block(self.ctx, lidx)?.entries()[self.slot]
                .try_commit(TxEntry::DUMMY)
                .expect("candidate block slots start zeroed");
            self.slot += 1;
        }
        let last = *self.blocks.last().expect("block exists");
        tx_block(self.ctx, last)?
            .try_set_next(boundary)
            .expect("unlinked candidate chain is private");
        for &lidx in &self.blocks {
            let block = self.ctx.chain.mem_table.block(lidx).map_err(Error::Fatal)?;
            // SAFETY: candidate blocks are mapped.
            unsafe { persist::persist_fenced(block.as_ptr(), BLOCK_SIZE) };
        }
        Ok(self.blocks)
    }
}
