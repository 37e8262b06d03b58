//! # Layout Constants
//!
//! This module centralizes the constants that define the persistent layout,
//! grouping interdependent values together and documenting their
//! relationships. Constants that depend on each other are co-located to
//! prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> CACHELINE_SIZE (64 bytes, persistence granularity)
//!       │     │
//!       │     ├─> NUM_CL_PER_BLOCK (64 cache lines per block)
//!       │     │
//!       │     └─> Meta block budget: 1 CL header + 1 CL lock word
//!       │           + NUM_CL_BITMAP_IN_META (2) inline bitmap lines
//!       │           + 60 inline tx entry lines
//!       │
//!       ├─> NUM_TX_ENTRY_PER_BLOCK ((4096 - 8) / 8 = 511 entries)
//!       │     A tx log block spends 8 bytes on prev/next chain links.
//!       │
//!       ├─> NUM_LOG_SLOTS (512 eight-byte slots per log block)
//!       │     Log entry heads are 16 bytes and must start on an even slot.
//!       │
//!       └─> GROW_UNIT_SIZE (2 MiB)
//!             Each mmap covers one grow unit so huge pages stay usable.
//!             GROW_UNIT_IN_BLOCKS = 512.
//!
//! NUM_BITMAP_BLOCKS (32, fixed at file init)
//!       │
//!       ├─> NUM_BITMAP_WORDS (inline 16 + 32 * 512 = 16400 words)
//!       │
//!       ├─> MAX_NUM_BLOCKS (16400 * 64 ≈ 1.05M blocks ≈ 4 GiB file)
//!       │
//!       └─> TOTAL_NUM_BITMAP_BYTES (131200, the shm mirror size)
//!             │
//!             └─> SHM_SIZE (mirror + MAX_NUM_THREADS per-thread slots)
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions here and in `layout`:
//!
//! 1. `TOTAL_NUM_BITMAP_BYTES % SHM_PER_THREAD_SIZE == 0` so the per-thread
//!    array in shm starts 128-byte aligned.
//! 2. Meta block cache-line budget sums to exactly `NUM_CL_PER_BLOCK`.
//! 3. `MAX_BLOCKS_PER_INLINE_TX < 64` so an inline tx entry's block count
//!    fits in its 6-bit field.

/// Unit of PM allocation and of application-visible addressing.
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SHIFT: u32 = 12;

/// Persistence granularity: one cache-line flush instruction covers this.
pub const CACHELINE_SIZE: usize = 64;
pub const NUM_CL_PER_BLOCK: usize = BLOCK_SIZE / CACHELINE_SIZE;

/// Cache lines of the meta block dedicated to inline bitmap words.
pub const NUM_CL_BITMAP_IN_META: usize = 2;
/// Inline bitmap words in the meta block (one u64 covers 64 blocks).
pub const NUM_INLINE_BITMAP: usize = NUM_CL_BITMAP_IN_META * CACHELINE_SIZE / 8;
/// Inline tx entries in the meta block: everything after the header line,
/// the lock line, and the inline bitmap lines.
pub const NUM_INLINE_TX_ENTRY: usize =
    (NUM_CL_PER_BLOCK - 2 - NUM_CL_BITMAP_IN_META) * CACHELINE_SIZE / 8;

/// Tx entries in a chained tx log block; 8 bytes go to prev/next links.
pub const NUM_TX_ENTRY_PER_BLOCK: usize = (BLOCK_SIZE - 8) / 8;

/// Bitmap words in one dedicated bitmap block.
pub const NUM_BITMAP_PER_BLOCK: usize = BLOCK_SIZE / 8;
/// Dedicated bitmap blocks reserved right after the meta block.
pub const NUM_BITMAP_BLOCKS: usize = 32;
/// Total bitmap words across the inline region and all bitmap blocks.
pub const NUM_BITMAP_WORDS: usize = NUM_INLINE_BITMAP + NUM_BITMAP_BLOCKS * NUM_BITMAP_PER_BLOCK;
/// Largest logical block index any bitmap word can describe, exclusive.
pub const MAX_NUM_BLOCKS: usize = NUM_BITMAP_WORDS * 64;
/// Size of the DRAM bitmap mirror kept in the shm region.
pub const TOTAL_NUM_BITMAP_BYTES: usize = NUM_BITMAP_WORDS * 8;

/// One bitmap word worth of blocks, the batch allocation unit.
pub const BITMAP_WORD_CAPACITY: u32 = 64;

/// Eight-byte slots per log entry block.
pub const NUM_LOG_SLOTS: usize = BLOCK_SIZE / 8;
/// A log entry head spans this many slots (16 bytes).
pub const LOG_HEAD_SLOTS: u16 = 2;
/// Most 64-block runs a single log entry may carry in its tail; together
/// with the head this keeps an entry within one cache line.
pub const MAX_RUNS_PER_LOG_ENTRY: usize = 12;

/// Largest block count an inline tx entry can encode (6-bit field).
pub const MAX_BLOCKS_PER_INLINE_TX: u32 = 63;

/// Growth and mapping unit: 2 MiB, so MAP_HUGETLB stays possible.
pub const GROW_UNIT_SHIFT: u32 = 21;
pub const GROW_UNIT_SIZE: u64 = 1 << GROW_UNIT_SHIFT;
pub const GROW_UNIT_IN_BLOCKS: u32 = (GROW_UNIT_SIZE >> BLOCK_SHIFT as u64) as u32;
/// Initial file size for a freshly created file.
pub const PREALLOC_SIZE: u64 = GROW_UNIT_SIZE;

/// Per-file cap on threads across all processes sharing the file.
pub const MAX_NUM_THREADS: usize = 64;
/// Bytes per `PerThreadData` slot in the shm region.
pub const SHM_PER_THREAD_SIZE: usize = 128;
/// Total size of the shm region: bitmap mirror + per-thread slots.
pub const SHM_SIZE: usize = TOTAL_NUM_BITMAP_BYTES + MAX_NUM_THREADS * SHM_PER_THREAD_SIZE;

/// File signature stored in the first 16 bytes of the meta block.
pub const SIGNATURE: [u8; 16] = *b"ULAYFS\0\0\0\0\0\0\0\0\0\0";

/// Extended attribute on the data file recording the shm object path.
pub const SHM_XATTR_NAME: &[u8] = b"user.ulayfs.shm_path\0";
/// Fixed buffer length for the shm path, xattr value included.
pub const SHM_PATH_LEN: usize = 64;

/// Commits between opportunistic garbage collection attempts.
pub const GC_COMMIT_INTERVAL: u64 = 64;

const _: () = assert!(NUM_INLINE_BITMAP == 16);
const _: () = assert!(NUM_INLINE_TX_ENTRY == 480);
const _: () = assert!(NUM_TX_ENTRY_PER_BLOCK == 511);
const _: () = assert!(TOTAL_NUM_BITMAP_BYTES % SHM_PER_THREAD_SIZE == 0);
const _: () = assert!(MAX_RUNS_PER_LOG_ENTRY % 2 == 0);
