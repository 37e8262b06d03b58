//! # File Entity
//!
//! One `File` owns everything the engine keeps for a managed path: the
//! mapped PM region, the DRAM block table, the shared offset, and the shm
//! region. All POSIX-level operations enter here; the per-thread allocator
//! is supplied by the registry so the `File` itself holds no thread state.
//!
//! ## Open Path
//!
//! `open` decides whether the file is ours before touching it: a
//! non-regular file, a size that is not block-aligned, or an all-zero
//! signature on a sized file fall back to the kernel (`NotOurFile`); a
//! wrong non-zero signature is `Corruption`. Only then is the file mapped,
//! initialized if empty, and — when this opener created the shm object —
//! recovered by replaying the committed log into the block table and the
//! bitmap mirror.

use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use tracing::debug;

use crate::alloc::Allocator;
use crate::blk_table::BlkTable;
use crate::config::{BLOCK_SIZE, GC_COMMIT_INTERVAL, NUM_BITMAP_BLOCKS, SIGNATURE};
use crate::error::{Error, Result};
use crate::layout::bitmap::{self, Bitmap};
use crate::layout::meta::MetaBlock;
use crate::layout::persist;
use crate::layout::tx::TxCursor;
use crate::mem_table::MemTable;
use crate::offset::OffsetMgr;
use crate::shm::ShmMgr;
use crate::tx::{read as read_tx, write as write_tx, TxCtx};
use crate::tx_mgr::ChainCtx;
use crate::{gc, registry};

bitflags! {
    /// Open flags the engine inspects; unknown bits are preserved and
    /// passed through to the kernel open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const CREAT = libc::O_CREAT;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const DIRECT = libc::O_DIRECT;
        const _ = !0;
    }
}

pub struct File {
    mem_table: MemTable,
    blk_table: BlkTable,
    offset_mgr: OffsetMgr,
    shm: ShmMgr,
    append: bool,
    file_id: u64,
    commits: AtomicU64,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("file_id", &self.file_id)
            .field("append", &self.append)
            .finish_non_exhaustive()
    }
}

impl File {
    /// Open or create a managed file. `NotOurFile` tells the caller to
    /// pass the open through to the kernel instead.
    pub fn open(path: &Path, flags: i32, mode: u32) -> Result<File> {
        let oflags = OpenFlags::from_bits_retain(flags);
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => {
                // commits and COW need the write mapping
                debug!(?path, "read-only open falls back to kernel syscalls");
                return Err(Error::NotOurFile);
            }
            libc::O_WRONLY => {
                debug!(?path, "write-only open promoted to read-write");
            }
            _ => {}
        }

        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true).mode(mode);
        if oflags.contains(OpenFlags::CREAT) {
            options.create(true);
        }
        if oflags.contains(OpenFlags::TRUNC) {
            options.truncate(true);
        }
        // O_DIRECT is a no-op here: reads and writes are already direct
        let custom = flags
            & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND | libc::O_DIRECT);
        if custom != 0 {
            options.custom_flags(custom);
        }
        let data_file = options.open(path)?;
        let md = data_file.metadata()?;
        if !md.is_file() {
            return Err(Error::NotOurFile);
        }
        let size = md.len();
        if size % BLOCK_SIZE as u64 != 0 {
            return Err(Error::NotOurFile);
        }
        if size > 0 {
            let mut sig = [0u8; 16];
            data_file.read_exact_at(&mut sig, 0)?;
            if sig != SIGNATURE {
                return if sig == [0u8; 16] {
                    Err(Error::NotOurFile)
                } else {
                    Err(Error::Corruption)
                };
            }
        }

        let fresh = size == 0;
        let mem_table = MemTable::new(data_file, size)?;
        if fresh {
            mem_table.meta().init();
        }
        let shm = ShmMgr::open(mem_table.file())?;

        let file = File {
            mem_table,
            blk_table: BlkTable::new(),
            offset_mgr: OffsetMgr::new(),
            shm,
            append: oflags.contains(OpenFlags::APPEND),
            file_id: md.ino(),
            commits: AtomicU64::new(0),
        };

        if file.shm.created() || fresh {
            file.reset_bitmap_mirror();
            if !fresh {
                file.recover()?;
            }
        } else {
            // mirror is live; just bring our table up to date
            file.tx_ctx(None).update_for_read()?;
        }

        Ok(file)
    }

    pub fn fd(&self) -> i32 {
        self.mem_table.file().as_raw_fd()
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    /// Path of the shared-memory object backing this file.
    pub fn shm_path(&self) -> &str {
        self.shm.path()
    }

    /// Whether `lidx` is marked allocated in the bitmap mirror.
    pub fn is_block_allocated(&self, lidx: u32) -> bool {
        bitmap::is_allocated(self.bitmap(), lidx)
    }

    /// Total blocks marked allocated in the bitmap mirror.
    pub fn allocated_block_count(&self) -> u64 {
        self.bitmap()
            .iter()
            .map(|word| u64::from(word.load().count_ones()))
            .sum()
    }

    pub(crate) fn meta(&self) -> &MetaBlock {
        self.mem_table.meta()
    }

    pub(crate) fn shm(&self) -> &ShmMgr {
        &self.shm
    }

    pub(crate) fn bitmap(&self) -> &[Bitmap] {
        self.shm.bitmap()
    }

    pub(crate) fn tx_ctx(&self, slot: Option<usize>) -> TxCtx<'_> {
        TxCtx {
            chain: ChainCtx {
                mem_table: &self.mem_table,
                meta: self.meta(),
                bitmap: self.bitmap(),
            },
            blk_table: &self.blk_table,
            pthread: slot.map(|s| self.shm.per_thread(s)),
        }
    }

    /// Positional write; never moves the shared offset.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        registry::with_allocator(self, |alloc| {
            let ctx = self.tx_ctx(Some(alloc.per_thread_slot()));
            let at = write_tx::do_pwrite(&ctx, alloc, buf, offset)?;
            self.finish_commit(&ctx, alloc, at)?;
            Ok(buf.len())
        })
    }

    /// Positional read; stops at EOF, holes read as zeros.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        registry::with_allocator(self, |alloc| {
            let ctx = self.tx_ctx(Some(alloc.per_thread_slot()));
            let state = ctx.update_for_read()?;
            read_tx::pread_with_size(&ctx, buf, offset, state.file_size)
        })
    }

    /// Sequential write at the shared offset (append mode re-bases to the
    /// committed EOF).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        registry::with_allocator(self, |alloc| {
            let ctx = self.tx_ctx(Some(alloc.per_thread_slot()));
            let ticket = self.offset_mgr.acquire_write(buf.len() as u64, self.append, || {
                let _ = ctx.update_for_read();
                self.blk_table.file_size()
            });
            let result = write_tx::do_pwrite(&ctx, alloc, buf, ticket.offset);
            self.offset_mgr.release(ticket.ticket);
            let at = result?;
            self.finish_commit(&ctx, alloc, at)?;
            Ok(buf.len())
        })
    }

    /// Sequential read at the shared offset, stopping at EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        registry::with_allocator(self, |alloc| {
            let ctx = self.tx_ctx(Some(alloc.per_thread_slot()));
            let state = ctx.update_for_read()?;
            let ticket = self.offset_mgr.acquire_read(buf.len() as u64, state.file_size, || {
                let _ = ctx.update_for_read();
                self.blk_table.file_size()
            });
            let result = read_tx::pread_with_size(
                &ctx,
                &mut buf[..ticket.count as usize],
                ticket.offset,
                ticket.offset + ticket.count,
            );
            self.offset_mgr.release(ticket.ticket);
            result
        })
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<u64> {
        let new_offset = match whence {
            libc::SEEK_SET => {
                if offset < 0 {
                    return Err(Error::InvalidArgument);
                }
                self.offset_mgr.seek(|_| Some(offset as u64))
            }
            libc::SEEK_CUR => self.offset_mgr.seek(|cur| cur.checked_add_signed(offset)),
            libc::SEEK_END => {
                let eof = self.file_size()?;
                self.offset_mgr.seek(|_| eof.checked_add_signed(offset))
            }
            _ => return Err(Error::InvalidArgument),
        };
        new_offset.ok_or(Error::InvalidArgument)
    }

    /// Commits persist synchronously, so fsync only has to order stores.
    pub fn fsync(&self) -> Result<()> {
        persist::fence();
        Ok(())
    }

    /// Logical file size from the committed log.
    pub fn file_size(&self) -> Result<u64> {
        let state = self.tx_ctx(None).update_for_read()?;
        Ok(state.file_size)
    }

    /// Run a garbage collection cycle now.
    pub fn gc(&self) -> Result<()> {
        registry::with_allocator(self, |alloc| {
            let ctx = self.tx_ctx(Some(alloc.per_thread_slot()));
            gc::run(&ctx, &self.shm, alloc)
        })
    }

    fn finish_commit(&self, ctx: &TxCtx<'_>, alloc: &mut Allocator, at: TxCursor) -> Result<()> {
        if let Some(pthread) = ctx.pthread {
            pthread.pin_tx_block(at.lidx);
        }
        let n = self.commits.fetch_add(1, Ordering::Relaxed);
        if n % GC_COMMIT_INTERVAL == GC_COMMIT_INTERVAL - 1 {
            gc::run(ctx, &self.shm, alloc)?;
        }
        Ok(())
    }

    /// Wipe the mirror and mark the fixed layout blocks (meta + bitmap
    /// blocks). Recovery then re-marks everything the log proves live.
    fn reset_bitmap_mirror(&self) {
        let mirror = self.bitmap();
        for word in mirror {
            word.store(0);
        }
        for lidx in 0..=(NUM_BITMAP_BLOCKS as u32) {
            bitmap::set_allocated(mirror, lidx);
        }
    }

    /// Rebuild the block table and the bitmap mirror by replaying the
    /// whole committed log (the open path, before any application I/O).
    fn recover(&self) -> Result<()> {
        let ctx = self.tx_ctx(None);
        let state = self
            .blk_table
            .catch_up(&ctx.chain, None, Some(self.bitmap()))?;
        debug!(
            file_size = state.file_size,
            tail_lidx = state.cursor.lidx,
            "recovery replay complete"
        );
        Ok(())
    }

}

impl Drop for File {
    fn drop(&mut self) {
        registry::forget_local(self);
        // leave a fresh size hint for offline tools; correctness never
        // depends on it (recovery recomputes from the log)
        let size = self.blk_table.file_size();
        let guard = self.meta().lock();
        if size > self.meta().file_size() {
            self.meta().set_file_size(&guard, size);
        }
    }
}
