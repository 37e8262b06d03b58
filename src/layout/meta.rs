//! The meta block and its cross-process lock.
//!
//! Block 0 of every managed file. The first cache line holds the header
//! (signature, logical file size, block counts, tx chain head/tail); it is
//! only modified with the futex in the second cache line held. Cache lines
//! 2–3 are the inline bitmap words and the remaining 60 lines are inline tx
//! entries, so small files never allocate a separate tx log block.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{
    BLOCK_SIZE, CACHELINE_SIZE, NUM_BITMAP_BLOCKS, NUM_INLINE_BITMAP, NUM_INLINE_TX_ENTRY,
    SIGNATURE,
};
use crate::layout::bitmap::Bitmap;
use crate::layout::persist;
use crate::layout::tx::TxEntrySlot;
use crate::layout::LogicalBlockIdx;

/// Futex-backed lock word sized to its own cache line so contention on the
/// lock does not bounce the header line.
#[repr(C, align(64))]
pub struct Futex {
    word: AtomicU32,
    _pad: [u8; CACHELINE_SIZE - 4],
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

impl Futex {
    pub fn lock(&self) {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        loop {
            let prev = self.word.swap(CONTENDED, Ordering::Acquire);
            if prev == UNLOCKED {
                return;
            }
            self.wait(CONTENDED);
        }
    }

    pub fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.wake_one();
        }
    }

    fn wait(&self, expected: u32) {
        // SAFETY: the futex word is a valid, mapped u32; FUTEX_WAIT with a
        // stale value returns EAGAIN which is fine (we re-check in lock()).
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
            );
        }
    }

    fn wake_one(&self) {
        // SAFETY: see wait().
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicU32,
                libc::FUTEX_WAKE,
                1,
            );
        }
    }
}

/// RAII guard for the meta lock.
pub struct MetaGuard<'a> {
    futex: &'a Futex,
}

impl Drop for MetaGuard<'_> {
    fn drop(&mut self) {
        self.futex.unlock();
    }
}

#[repr(C, align(4096))]
pub struct MetaBlock {
    // cache line 0: header, modified with the futex held
    signature: std::cell::UnsafeCell<[u8; 16]>,
    file_size: AtomicU64,
    num_blocks: AtomicU32,
    num_bitmap_blocks: AtomicU32,
    log_head: AtomicU32,
    log_tail: AtomicU32,
    _pad0: [u8; 24],

    // cache line 1
    lock: Futex,

    // cache lines 2..4
    inline_bitmaps: [Bitmap; NUM_INLINE_BITMAP],

    // cache lines 4..64
    inline_tx_entries: [TxEntrySlot; NUM_INLINE_TX_ENTRY],
}

const _: () = assert!(std::mem::size_of::<MetaBlock>() == BLOCK_SIZE);

// SAFETY: the signature is written exactly once, during init of a file no
// other thread can reach yet; afterwards it is read-only. Every other
// field is an atomic or lock.
unsafe impl Sync for MetaBlock {}

impl MetaBlock {
    /// One-time initialization of a freshly created file. The caller must
    /// have zero-filled backing storage (ftruncate extension guarantees
    /// this).
    pub fn init(&self) {
        // block 0 (this meta block) plus the reserved bitmap blocks
        for lidx in 0..=(NUM_BITMAP_BLOCKS as LogicalBlockIdx) {
            crate::layout::bitmap::set_allocated(&self.inline_bitmaps, lidx);
        }
        self.num_bitmap_blocks
            .store(NUM_BITMAP_BLOCKS as u32, Ordering::Release);
        // SAFETY: init runs before the file is visible to any other thread.
        unsafe {
            *self.signature.get() = SIGNATURE;
            persist::persist_fenced(self as *const MetaBlock as *const u8, CACHELINE_SIZE);
        }
    }

    pub fn has_valid_signature(&self) -> bool {
        // SAFETY: read-only after init.
        unsafe { *self.signature.get() == SIGNATURE }
    }

    pub fn lock(&self) -> MetaGuard<'_> {
        self.lock.lock();
        MetaGuard { futex: &self.lock }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Caller holds the meta lock.
    pub fn set_file_size(&self, _guard: &MetaGuard<'_>, size: u64) {
        self.file_size.store(size, Ordering::Release);
        // SAFETY: header line of a mapped meta block.
        unsafe { persist::persist_fenced(self as *const MetaBlock as *const u8, CACHELINE_SIZE) };
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks.load(Ordering::Acquire)
    }

    /// Used during init and under the meta lock during growth.
    pub fn set_num_blocks(&self, num_blocks: u32) {
        self.num_blocks.store(num_blocks, Ordering::Release);
    }

    pub fn num_bitmap_blocks(&self) -> u32 {
        self.num_bitmap_blocks.load(Ordering::Acquire)
    }

    /// First tx log block of the chain, 0 while commits still fit inline.
    pub fn log_head(&self) -> LogicalBlockIdx {
        self.log_head.load(Ordering::Acquire)
    }

    /// Publish a chain head. CAS so that two threads racing to hang the
    /// first chain block agree; losers free their block.
    pub fn try_set_log_head(&self, lidx: LogicalBlockIdx) -> Result<(), LogicalBlockIdx> {
        match self
            .log_head
            .compare_exchange(0, lidx, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: header line of a mapped meta block.
                unsafe {
                    persist::persist_fenced(self as *const MetaBlock as *const u8, CACHELINE_SIZE)
                };
                Ok(())
            }
            Err(observed) => Err(observed),
        }
    }

    /// Swing the chain head during GC. Caller holds the meta lock.
    pub fn set_log_head(&self, _guard: &MetaGuard<'_>, lidx: LogicalBlockIdx) {
        self.log_head.store(lidx, Ordering::Release);
        // SAFETY: header line of a mapped meta block.
        unsafe { persist::persist_fenced(self as *const MetaBlock as *const u8, CACHELINE_SIZE) };
    }

    /// Tail hint; may lag behind the true tail.
    pub fn log_tail(&self) -> LogicalBlockIdx {
        self.log_tail.load(Ordering::Acquire)
    }

    pub fn set_log_tail_hint(&self, lidx: LogicalBlockIdx) {
        self.log_tail.store(lidx, Ordering::Release);
    }

    pub fn inline_bitmaps(&self) -> &[Bitmap] {
        &self.inline_bitmaps
    }

    pub fn inline_tx_entries(&self) -> &[TxEntrySlot] {
        &self.inline_tx_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_block_is_exactly_one_block() {
        assert_eq!(std::mem::size_of::<MetaBlock>(), BLOCK_SIZE);
    }

    #[test]
    fn futex_lock_excludes_and_unlocks() {
        let futex = Futex {
            word: AtomicU32::new(0),
            _pad: [0; CACHELINE_SIZE - 4],
        };

        futex.lock();
        assert_ne!(futex.word.load(Ordering::Relaxed), UNLOCKED);
        futex.unlock();
        assert_eq!(futex.word.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn init_marks_meta_and_bitmap_blocks() {
        let meta: Box<MetaBlock> = unsafe { Box::new_zeroed().assume_init() };

        meta.init();

        assert!(meta.has_valid_signature());
        assert_eq!(meta.num_bitmap_blocks(), NUM_BITMAP_BLOCKS as u32);
        for lidx in 0..=(NUM_BITMAP_BLOCKS as u32) {
            assert!(crate::layout::bitmap::is_allocated(
                meta.inline_bitmaps(),
                lidx
            ));
        }
        assert!(!crate::layout::bitmap::is_allocated(
            meta.inline_bitmaps(),
            NUM_BITMAP_BLOCKS as u32 + 1
        ));
    }
}
