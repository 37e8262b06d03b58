//! # Transaction Commit Protocol
//!
//! All committed state of a file is the sequence of non-zero tx entry
//! words, read in order: the meta block's inline entries first, then the
//! chained tx log blocks starting at `meta.log_head`. Committing means
//! CAS-ing your 8-byte entry into the first empty slot at the tail; the
//! successful CAS is the linearization point and its release ordering
//! publishes the data and log blocks written before it.
//!
//! A failed CAS means another transaction won that slot. The caller
//! advances past the winner and, for copy-on-write transactions, first
//! reconciles against it: if the winner touched a block this transaction
//! read a before-image from, the before-image is stale and must be
//! re-copied from the winner's blocks.
//!
//! Chain growth is itself lock-free: the committer that finds the tail
//! block full allocates a successor, links it with a CAS on the `next`
//! word (or `meta.log_head` for the first chain block), and frees its
//! candidate if another committer linked first.

use tracing::trace;

use crate::alloc::Allocator;
use crate::error::{Error, Result};
use crate::layout::bitmap::Bitmap;
use crate::layout::meta::MetaBlock;
use crate::layout::tx::{TxCursor, TxEntry};
use crate::mem_table::MemTable;

/// Context a commit needs to walk and extend the tx chain.
pub struct ChainCtx<'a> {
    pub mem_table: &'a MemTable,
    pub meta: &'a MetaBlock,
    pub bitmap: &'a [Bitmap],
}

impl<'a> ChainCtx<'a> {
    /// The committed entry at `cursor`, or `None` for an empty slot.
    pub fn entry_at(&self, cursor: TxCursor) -> eyre::Result<Option<TxEntry>> {
        debug_assert!(!cursor.is_past_end());
        if cursor.lidx == 0 {
            Ok(cursor.slot_in_meta(self.meta).load())
        } else {
            let block = self.mem_table.block(cursor.lidx)?;
            // SAFETY: a lidx reached via the tx chain is a tx log block.
            Ok(cursor.slot_in_block(unsafe { block.as_tx_log() }).load())
        }
    }

    /// Successor block of the container `cursor` sits in (0 = none).
    fn next_of(&self, cursor: TxCursor) -> eyre::Result<u32> {
        if cursor.lidx == 0 {
            Ok(self.meta.log_head())
        } else {
            let block = self.mem_table.block(cursor.lidx)?;
            // SAFETY: as in entry_at.
            Ok(unsafe { block.as_tx_log() }.next())
        }
    }

    /// Move a cursor sitting past the end of its container into the next
    /// chain block. With an allocator, a missing successor is allocated
    /// and linked; without one, returns false and leaves the cursor at
    /// the overflow position.
    pub fn handle_overflow(
        &self,
        cursor: &mut TxCursor,
        mut allocator: Option<&mut Allocator>,
    ) -> Result<bool> {
        while cursor.is_past_end() {
            let next = self.next_of(*cursor).map_err(Error::Fatal)?;
            if next != 0 {
                *cursor = TxCursor { lidx: next, local: 0 };
                continue;
            }
            let Some(alloc) = allocator.as_deref_mut() else {
                return Ok(false);
            };
            let candidate = alloc.alloc(1, self.bitmap)?;
            let block = self.mem_table.block(candidate).map_err(Error::Fatal)?;
            // SAFETY: candidate was just claimed by this thread; a
            // recycled block may hold stale bytes, and the zeroing must
            // reach PM before the block becomes reachable or recovery
            // could read stale slots as commits.
            unsafe {
                block.zero();
                block.as_tx_log().init(cursor.lidx);
                crate::layout::persist::persist_fenced(
                    block.as_ptr(),
                    crate::config::BLOCK_SIZE,
                );
            }
            let linked = if cursor.lidx == 0 {
                self.meta.try_set_log_head(candidate)
            } else {
                let tail = self.mem_table.block(cursor.lidx).map_err(Error::Fatal)?;
                // SAFETY: as in entry_at.
                unsafe { tail.as_tx_log() }.try_set_next(candidate)
            };
            match linked {
                Ok(()) => {
                    trace!(lidx = candidate, "tx chain grew by one block");
                    *cursor = TxCursor { lidx: candidate, local: 0 };
                }
                Err(winner) => {
                    alloc.free(candidate, 1);
                    *cursor = TxCursor { lidx: winner, local: 0 };
                }
            }
            self.meta.set_log_tail_hint(cursor.lidx);
        }
        Ok(true)
    }

    /// Advance one slot, crossing chain blocks as needed.
    pub fn advance(
        &self,
        cursor: &mut TxCursor,
        allocator: Option<&mut Allocator>,
    ) -> Result<bool> {
        cursor.local += 1;
        self.handle_overflow(cursor, allocator)
    }
}

/// Outcome of one commit attempt.
pub enum TryCommit {
    /// The entry was published at this cursor.
    Committed(TxCursor),
    /// Another transaction owns the slot; the cursor now points past it.
    Conflict(TxEntry),
}

/// Attempt to publish `entry` at `*cursor`. On conflict the cursor is
/// advanced past the winning entry, which is returned for reconciliation;
/// the caller loops. Every loop iteration makes global progress (some
/// transaction committed), so the retry is livelock-free.
pub fn try_commit_once(
    ctx: &ChainCtx<'_>,
    cursor: &mut TxCursor,
    entry: TxEntry,
    allocator: &mut Allocator,
) -> Result<TryCommit> {
    ctx.handle_overflow(cursor, Some(allocator))?;

    let result = if cursor.lidx == 0 {
        cursor.slot_in_meta(ctx.meta).try_commit(entry)
    } else {
        let block = ctx.mem_table.block(cursor.lidx).map_err(Error::Fatal)?;
        // SAFETY: a lidx reached via the tx chain is a tx log block.
        cursor.slot_in_block(unsafe { block.as_tx_log() }).try_commit(entry)
    };

    match result {
        Ok(()) => Ok(TryCommit::Committed(*cursor)),
        Err(winner) => {
            ctx.advance(cursor, Some(allocator))?;
            Ok(TryCommit::Conflict(winner))
        }
    }
}

/// Commit without reconciliation, for transactions that read no existing
/// block (aligned writes) and for replay-order fillers.
pub fn commit(
    ctx: &ChainCtx<'_>,
    cursor: &mut TxCursor,
    entry: TxEntry,
    allocator: &mut Allocator,
) -> Result<TxCursor> {
    loop {
        if let TryCommit::Committed(at) = try_commit_once(ctx, cursor, entry, allocator)? {
            return Ok(at);
        }
    }
}
