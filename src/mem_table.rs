//! # Memory-Mapped Block Table
//!
//! `MemTable` maps the PM file into the process in 2 MiB grow units and
//! answers `addr(lidx) -> *mut Block` for any logical block, growing the
//! backing file transparently when a block past the end is touched.
//!
//! ## Design
//!
//! The file is mapped one grow unit at a time so that huge pages remain
//! usable and growth never remaps existing regions. Mappings are additive:
//! once a unit is mapped its address stays valid until the `MemTable` is
//! dropped, so block pointers handed out earlier never dangle. This is the
//! property the rest of the engine leans on — committed data blocks are
//! immutable and their addresses stable for the life of the file handle.
//!
//! ## Growth
//!
//! `validate` is a three-tier check, cheapest first:
//!
//! 1. fast path: compare against a process-local copy of `num_blocks`
//! 2. medium path: re-read `num_blocks` from the meta block
//! 3. slow path: take the meta futex, re-check, and `ftruncate` the file
//!    to the next grow-unit boundary
//!
//! Growth failure is fatal for the file (an infrastructure invariant, not
//! a recoverable I/O error); every other operation here is total.

use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::config::{
    BLOCK_SHIFT, BLOCK_SIZE, GROW_UNIT_IN_BLOCKS, GROW_UNIT_SIZE, MAX_NUM_BLOCKS, PREALLOC_SIZE,
};
use crate::layout::meta::MetaBlock;
use crate::layout::{Block, LogicalBlockIdx};

struct Mappings {
    /// grow-unit start lidx -> base address of that unit's mapping
    units: HashMap<LogicalBlockIdx, *mut Block>,
    /// owners; kept so the regions outlive every pointer in `units`
    regions: Vec<MmapMut>,
}

pub struct MemTable {
    file: File,
    meta: *const MetaBlock,
    /// Local copy of `meta.num_blocks`; may lag, never leads.
    num_blocks_local: AtomicU32,
    mappings: RwLock<Mappings>,
}

// SAFETY: the raw pointers reference mmap regions owned by `mappings`,
// which live as long as self and are only extended, never removed. All
// shared mutation behind those pointers goes through atomics or the
// block ownership protocol.
unsafe impl Send for MemTable {}
unsafe impl Sync for MemTable {}

impl MemTable {
    /// Map an opened data file. The file size must be block-aligned; it is
    /// rounded up to a grow-unit multiple (or preallocated if empty) before
    /// the first mapping is created.
    pub fn new(file: File, file_size: u64) -> Result<Self> {
        ensure!(
            file_size % BLOCK_SIZE as u64 == 0,
            "file size {} is not block-aligned",
            file_size
        );

        let mapped_size = if file_size == 0 {
            PREALLOC_SIZE
        } else {
            file_size.next_multiple_of(GROW_UNIT_SIZE)
        };
        if mapped_size != file_size {
            file.set_len(mapped_size)
                .wrap_err_with(|| format!("failed to grow file to {} bytes", mapped_size))?;
        }

        let region = map_region(&file, 0, mapped_size as usize)?;
        let base = region.as_ptr() as *mut Block;

        let mut units = HashMap::new();
        let num_units = (mapped_size / GROW_UNIT_SIZE) as u32;
        for unit in 0..num_units {
            let start = unit * GROW_UNIT_IN_BLOCKS;
            // SAFETY: start * BLOCK_SIZE < mapped_size, inside the region.
            units.insert(start, unsafe { base.add(start as usize) });
        }

        let meta = base as *const MetaBlock;
        let num_blocks = (mapped_size >> BLOCK_SHIFT as u64) as u32;
        // SAFETY: block 0 of the mapping is the meta block.
        unsafe { (*meta).set_num_blocks(num_blocks) };

        Ok(Self {
            file,
            meta,
            num_blocks_local: AtomicU32::new(num_blocks),
            mappings: RwLock::new(Mappings {
                units,
                regions: vec![region],
            }),
        })
    }

    /// The meta block; valid for the life of this MemTable.
    pub fn meta(&self) -> &MetaBlock {
        // SAFETY: block 0 is mapped for the whole lifetime of self and the
        // MetaBlock type is all atomics behind shared references.
        unsafe { &*self.meta }
    }

    /// Address of a logical block, growing and mapping on demand.
    pub fn addr(&self, lidx: LogicalBlockIdx) -> Result<*mut Block> {
        ensure!(
            (lidx as usize) < MAX_NUM_BLOCKS,
            "logical block {} beyond bitmap coverage",
            lidx
        );
        let unit_start = lidx & !(GROW_UNIT_IN_BLOCKS - 1);
        let offset = (lidx - unit_start) as usize;

        {
            let mappings = self.mappings.read();
            if let Some(&base) = mappings.units.get(&unit_start) {
                // SAFETY: offset < GROW_UNIT_IN_BLOCKS, inside the unit.
                return Ok(unsafe { base.add(offset) });
            }
        }

        self.validate(lidx)?;

        let mut mappings = self.mappings.write();
        if let Some(&base) = mappings.units.get(&unit_start) {
            // SAFETY: as above.
            return Ok(unsafe { base.add(offset) });
        }
        let byte_offset = (unit_start as u64) << BLOCK_SHIFT as u64;
        let region = map_region(&self.file, byte_offset, GROW_UNIT_SIZE as usize)?;
        let base = region.as_ptr() as *mut Block;
        mappings.units.insert(unit_start, base);
        mappings.regions.push(region);
        // SAFETY: as above.
        Ok(unsafe { base.add(offset) })
    }

    /// Typed convenience over [`addr`](Self::addr).
    pub fn block(&self, lidx: LogicalBlockIdx) -> Result<&Block> {
        // SAFETY: addr returns a pointer into a live mapping; Block access
        // rules are enforced by the ownership protocol.
        Ok(unsafe { &*self.addr(lidx)? })
    }

    /// Ensure the kernel file is large enough for `lidx` to be written.
    pub fn validate(&self, lidx: LogicalBlockIdx) -> Result<()> {
        if lidx < self.num_blocks_local.load(Ordering::Acquire) {
            return Ok(());
        }

        let meta = self.meta();
        let global = meta.num_blocks();
        self.num_blocks_local.store(global, Ordering::Release);
        if lidx < global {
            return Ok(());
        }

        let guard = meta.lock();
        // meta.num_blocks may lag behind a grow done by another opener of
        // the same file; the kernel's length is the ground truth, and
        // consulting it keeps set_len from ever shrinking the file
        let kernel_len = self
            .file
            .metadata()
            .wrap_err("failed to stat file during growth")?
            .len();
        let kernel_blocks = (kernel_len >> BLOCK_SHIFT as u64) as u32;
        if lidx >= kernel_blocks {
            let new_num_blocks = (lidx + 1).next_multiple_of(GROW_UNIT_IN_BLOCKS);
            let new_size = (new_num_blocks as u64) << BLOCK_SHIFT as u64;
            self.file
                .set_len(new_size)
                .wrap_err_with(|| format!("failed to grow file to {} bytes", new_size))?;
            meta.set_num_blocks(new_num_blocks);
            self.num_blocks_local.store(new_num_blocks, Ordering::Release);
        } else {
            meta.set_num_blocks(kernel_blocks.max(meta.num_blocks()));
            self.num_blocks_local.store(kernel_blocks, Ordering::Release);
        }
        drop(guard);
        Ok(())
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

fn map_region(file: &File, offset: u64, len: usize) -> Result<MmapMut> {
    let mut options = MmapOptions::new();
    options.offset(offset).len(len);
    #[cfg(feature = "hugepage")]
    options.huge(Some(21));
    // SAFETY: the engine is the only writer through this mapping; external
    // modification of a managed PM file is outside the supported model.
    // The mapping is never unmapped while pointers into it exist (regions
    // are only appended, dropped with the MemTable).
    unsafe {
        options
            .map_mut(file)
            .wrap_err_with(|| format!("failed to mmap {} bytes at offset {}", len, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NUM_BITMAP_BLOCKS, SIGNATURE};

    fn scratch_file() -> File {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep().join("mem_table.bin");
        File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn empty_file_is_preallocated_one_grow_unit() {
        let file = scratch_file();

        let table = MemTable::new(file, 0).unwrap();

        assert_eq!(table.file().metadata().unwrap().len(), PREALLOC_SIZE);
        assert_eq!(table.meta().num_blocks(), GROW_UNIT_IN_BLOCKS);
    }

    #[test]
    fn meta_init_is_visible_through_block_zero() {
        let file = scratch_file();
        let table = MemTable::new(file, 0).unwrap();

        table.meta().init();

        let block0 = table.block(0).unwrap();
        // SAFETY: block 0 is the meta block.
        let sig_ok = unsafe { block0.as_meta().has_valid_signature() };
        assert!(sig_ok);
        assert_eq!(table.meta().num_bitmap_blocks(), NUM_BITMAP_BLOCKS as u32);
        assert_eq!(&SIGNATURE[..6], b"ULAYFS");
    }

    #[test]
    fn addr_past_end_grows_the_file() {
        let file = scratch_file();
        let table = MemTable::new(file, 0).unwrap();
        let beyond = GROW_UNIT_IN_BLOCKS + 3;

        let ptr = table.addr(beyond).unwrap();

        assert!(!ptr.is_null());
        assert_eq!(
            table.file().metadata().unwrap().len(),
            2 * GROW_UNIT_SIZE,
            "file grows by whole units"
        );
        assert_eq!(table.meta().num_blocks(), 2 * GROW_UNIT_IN_BLOCKS);
    }

    #[test]
    fn addresses_are_stable_across_growth() {
        let file = scratch_file();
        let table = MemTable::new(file, 0).unwrap();

        let early = table.addr(1).unwrap();
        table.addr(5 * GROW_UNIT_IN_BLOCKS).unwrap();
        let again = table.addr(1).unwrap();

        assert_eq!(early, again);
    }

    #[test]
    fn blocks_within_one_unit_are_contiguous() {
        let file = scratch_file();
        let table = MemTable::new(file, 0).unwrap();

        let a = table.addr(10).unwrap() as usize;
        let b = table.addr(11).unwrap() as usize;

        assert_eq!(b - a, BLOCK_SIZE);
    }
}
