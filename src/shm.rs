//! # Cross-Process Shared Memory
//!
//! Every managed file has one shm object holding the DRAM mirror of its
//! block bitmap followed by a fixed array of per-thread liveness slots.
//! The object lives in `/dev/shm` under a name derived from the data
//! file's inode and creation time, and the data file remembers that name
//! in an extended attribute so every opener of the same file finds the
//! same region.
//!
//! ## Creation Protocol
//!
//! The object is created atomically with the right permissions: open an
//! anonymous `O_TMPFILE` in `/dev/shm`, `fchmod`/`fchown` it to match the
//! data file, `fallocate` it to the fixed size, then `linkat` it into
//! place. A concurrent creator losing the `linkat` race just opens the
//! winner's object.
//!
//! ## Liveness
//!
//! Each thread that touches the file claims one [`PerThreadData`] slot and
//! locks its robust, process-shared mutex for the rest of the thread's
//! life. Another process can then ask the kernel whether that thread still
//! exists: `trylock` returning `EBUSY` means alive, `EOWNERDEAD` means the
//! owner died with the lock held (the slot is made reusable), and a plain
//! success means the slot was abandoned in an orderly fashion. The garbage
//! collector uses this to find the minimum pinned tx block across live
//! threads.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{bail, ensure, eyre, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::config::{
    MAX_NUM_THREADS, NUM_BITMAP_WORDS, SHM_PATH_LEN, SHM_PER_THREAD_SIZE, SHM_SIZE,
    SHM_XATTR_NAME, TOTAL_NUM_BITMAP_BYTES,
};
use crate::layout::bitmap::Bitmap;
use crate::layout::meta::MetaBlock;
use crate::layout::LogicalBlockIdx;

const STATE_UNINIT: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_INITIALIZED: u32 = 2;

/// One thread's slot in the shm region. The robust mutex, held by the
/// owning thread for its lifetime, doubles as a liveness token.
#[repr(C, align(128))]
pub struct PerThreadData {
    state: AtomicU32,
    _pad: u32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    index: AtomicU64,
    pinned_tx_block: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<PerThreadData>() == SHM_PER_THREAD_SIZE);

// SAFETY: all fields are atomics except the mutex, whose concurrent use is
// exactly what pthread robust mutexes are for.
unsafe impl Sync for PerThreadData {}

impl PerThreadData {
    /// Claim and initialize this slot for the calling thread, which locks
    /// the robust mutex and never unlocks it. Returns false if the slot is
    /// already taken. Callers serialize on the meta lock, so the state CAS
    /// only ever races with nothing.
    pub fn try_init(&self, index: usize) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.index.store(index as u64, Ordering::Release);
        self.pinned_tx_block.store(0, Ordering::Release);

        // SAFETY: the slot is exclusively ours (state = INITIALIZING); the
        // mutex memory is mapped shared and lives as long as the shm
        // object, which outlives every locker.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut attr);
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            libc::pthread_mutex_init(self.mutex.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            libc::pthread_mutex_lock(self.mutex.get());
        }

        self.state.store(STATE_INITIALIZED, Ordering::Release);
        true
    }

    /// Whether the owning thread is still alive. Only meaningful (and only
    /// safe) once the slot reached the initialized state; a dead owner
    /// detected via EOWNERDEAD resets the slot for reuse.
    pub fn is_alive(&self) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_INITIALIZED {
            return false;
        }
        // SAFETY: state is INITIALIZED, so the mutex has been through
        // pthread_mutex_init and not yet destroyed.
        unsafe {
            match libc::pthread_mutex_trylock(self.mutex.get()) {
                libc::EBUSY => true,
                0 => {
                    libc::pthread_mutex_unlock(self.mutex.get());
                    false
                }
                libc::EOWNERDEAD => {
                    libc::pthread_mutex_consistent(self.mutex.get());
                    libc::pthread_mutex_unlock(self.mutex.get());
                    self.reset();
                    false
                }
                rc => {
                    warn!(rc, "pthread_mutex_trylock on liveness slot failed");
                    false
                }
            }
        }
    }

    /// Make the slot reusable after its owner died or released it.
    pub fn reset(&self) {
        debug!(index = self.index.load(Ordering::Relaxed), "per-thread slot reset");
        // SAFETY: callers only reset initialized slots whose mutex is
        // currently unlocked.
        unsafe {
            libc::pthread_mutex_destroy(self.mutex.get());
        }
        self.pinned_tx_block.store(0, Ordering::Release);
        self.state.store(STATE_UNINIT, Ordering::Release);
    }

    /// The tx block this thread may still read from; GC never reclaims it
    /// or any later block. Zero means no pin.
    pub fn pinned_tx_block(&self) -> LogicalBlockIdx {
        self.pinned_tx_block.load(Ordering::Acquire)
    }

    pub fn pin_tx_block(&self, lidx: LogicalBlockIdx) {
        self.pinned_tx_block.store(lidx, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_INITIALIZED
    }
}

pub struct ShmMgr {
    #[allow(dead_code)]
    file: File,
    map: MmapMut,
    path: String,
    created: bool,
}

// SAFETY: the mapping is shared by design; all access goes through
// atomics, robust mutexes, or the bitmap CAS protocol.
unsafe impl Send for ShmMgr {}
unsafe impl Sync for ShmMgr {}

impl ShmMgr {
    /// Open (or atomically create) the shm object for `file`. Returns the
    /// manager and whether this call created the object — a fresh object
    /// means the bitmap mirror is empty and must be rebuilt by recovery.
    pub fn open(file: &File) -> Result<Self> {
        let stat = fstat(file)?;
        let path = Self::locate_or_assign_path(file, &stat)?;

        let (fd, created) = match open_shm(&path) {
            Ok(fd) => (fd, false),
            Err(_) => create_shm(&path, &stat)?,
        };
        debug!(%path, created, "shm object opened");
        let shm_file = File::from(fd);

        // SAFETY: the fd refers to a /dev/shm file fallocated to SHM_SIZE;
        // the mapping is shared with other processes on purpose.
        let map = unsafe {
            MmapOptions::new()
                .len(SHM_SIZE)
                .map_mut(&shm_file)
                .wrap_err_with(|| format!("failed to mmap shm object '{}'", path))?
        };

        Ok(Self {
            file: shm_file,
            map,
            path,
            created,
        })
    }

    /// Whether this open created the shm object (mirror starts empty).
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The DRAM bitmap mirror covering the whole file.
    pub fn bitmap(&self) -> &[Bitmap] {
        // SAFETY: the first TOTAL_NUM_BITMAP_BYTES of the region are the
        // mirror; Bitmap is repr(transparent) over AtomicU64 and the region
        // is 8-byte aligned (page-aligned mapping).
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr() as *const Bitmap, NUM_BITMAP_WORDS)
        }
    }

    pub fn per_thread(&self, idx: usize) -> &PerThreadData {
        assert!(idx < MAX_NUM_THREADS);
        // SAFETY: the per-thread array starts right after the mirror,
        // 128-byte aligned by the config invariant, and idx is bounded.
        unsafe {
            &*(self
                .map
                .as_ptr()
                .add(TOTAL_NUM_BITMAP_BYTES + idx * SHM_PER_THREAD_SIZE)
                as *const PerThreadData)
        }
    }

    /// Claim a liveness slot for the calling thread. Serialized on the
    /// meta lock; dead slots are reclaimed on the way.
    pub fn alloc_per_thread_data(&self, meta: &MetaBlock) -> Result<usize> {
        let _guard = meta.lock();
        for idx in 0..MAX_NUM_THREADS {
            let slot = self.per_thread(idx);
            if slot.is_initialized() {
                // a dead owner is reclaimed inside is_alive()
                let _ = slot.is_alive();
            }
            if slot.try_init(idx) {
                return Ok(idx);
            }
        }
        bail!("no free per-thread slot in shm region '{}'", self.path);
    }

    /// Remove the shm object from /dev/shm. Other openers keep their
    /// mappings; the next open recreates the object and re-runs recovery.
    pub fn unlink(&self) {
        let c_path = CString::new(self.path.as_str()).expect("path has no NUL");
        // SAFETY: plain unlink on an owned C string.
        let rc = unsafe { libc::unlink(c_path.as_ptr()) };
        if rc < 0 {
            warn!(path = %self.path, "could not unlink shm object");
        }
    }

    fn locate_or_assign_path(file: &File, stat: &libc::stat) -> Result<String> {
        let mut buf = [0u8; SHM_PATH_LEN];
        // SAFETY: fgetxattr writes at most SHM_PATH_LEN bytes into buf.
        let rc = unsafe {
            libc::fgetxattr(
                file.as_raw_fd(),
                SHM_XATTR_NAME.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_void,
                SHM_PATH_LEN,
            )
        };
        if rc > 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(rc as usize);
            return Ok(String::from_utf8_lossy(&buf[..len]).into_owned());
        }

        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        ensure!(
            errno == libc::ENODATA || errno == libc::ENOTSUP,
            "failed to read shm path attribute: errno {}",
            errno
        );

        let ctime_ns = stat.st_ctime as i64 * 1_000_000_000 + stat.st_ctime_nsec as i64;
        let path = format!("/dev/shm/ulayfs_{:016x}_{:013x}", stat.st_ino, ctime_ns >> 3);
        ensure!(path.len() < SHM_PATH_LEN, "shm path too long: {}", path);

        let mut value = [0u8; SHM_PATH_LEN];
        value[..path.len()].copy_from_slice(path.as_bytes());
        // SAFETY: value is a SHM_PATH_LEN buffer holding the NUL-padded path.
        let rc = unsafe {
            libc::fsetxattr(
                file.as_raw_fd(),
                SHM_XATTR_NAME.as_ptr() as *const libc::c_char,
                value.as_ptr() as *const libc::c_void,
                SHM_PATH_LEN,
                0,
            )
        };
        if rc < 0 {
            // Filesystems without xattr support still work; every opener
            // derives the same path from (inode, ctime).
            debug!(%path, "could not persist shm path attribute");
        }
        Ok(path)
    }
}

fn fstat(file: &File) -> Result<libc::stat> {
    // SAFETY: fstat fills the buffer or fails.
    unsafe {
        let mut stat: libc::stat = std::mem::zeroed();
        let rc = libc::fstat(file.as_raw_fd(), &mut stat);
        ensure!(rc == 0, "fstat failed: {}", std::io::Error::last_os_error());
        Ok(stat)
    }
}

fn open_shm(path: &str) -> Result<OwnedFd> {
    let c_path = CString::new(path).wrap_err("shm path contains NUL")?;
    // SAFETY: open with a valid C string; the raw fd is immediately owned.
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    ensure!(
        fd >= 0,
        "cannot open shm object '{}': {}",
        path,
        std::io::Error::last_os_error()
    );
    // SAFETY: fd is a fresh, valid descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create the shm object atomically: anonymous tmpfile, match the data
/// file's permissions, size it, then link it into place.
fn create_shm(path: &str, stat: &libc::stat) -> Result<(OwnedFd, bool)> {
    let shm_dir = CString::new("/dev/shm").expect("static path");
    // SAFETY: O_TMPFILE open of a constant directory path.
    let fd = unsafe {
        libc::open(
            shm_dir.as_ptr(),
            libc::O_TMPFILE | libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            libc::S_IRUSR | libc::S_IWUSR,
        )
    };
    ensure!(
        fd >= 0,
        "cannot create tmpfile in /dev/shm: {}",
        std::io::Error::last_os_error()
    );
    // SAFETY: fd is a fresh, valid descriptor.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: plain syscalls on an owned fd.
    unsafe {
        ensure!(
            libc::fchmod(fd, stat.st_mode & 0o7777) == 0,
            "fchmod on shm object failed: {}",
            std::io::Error::last_os_error()
        );
        if libc::fchown(fd, stat.st_uid, stat.st_gid) < 0 {
            debug!("fchown on shm object failed; keeping creator ownership");
        }
        ensure!(
            libc::fallocate(fd, 0, 0, SHM_SIZE as libc::off_t) == 0,
            "fallocate on shm object failed: {}",
            std::io::Error::last_os_error()
        );
    }

    let proc_path = CString::new(format!("/proc/self/fd/{}", fd)).expect("no NUL");
    let c_path = CString::new(path).wrap_err("shm path contains NUL")?;
    // SAFETY: linkat publishes the tmpfile under its final name.
    let rc = unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            proc_path.as_ptr(),
            libc::AT_FDCWD,
            c_path.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    };
    if rc == 0 {
        return Ok((owned, true));
    }

    // Another process linked its object first; use theirs.
    drop(owned);
    let fd = open_shm(path)
        .map_err(|e| eyre!("lost shm creation race but cannot open winner: {:#}", e))?;
    Ok((fd, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_slot() -> Box<PerThreadData> {
        // SAFETY: all-zero bytes are the UNINIT state for every field.
        unsafe { Box::new_zeroed().assume_init() }
    }

    #[test]
    fn per_thread_slot_is_exactly_shm_stride() {
        assert_eq!(std::mem::size_of::<PerThreadData>(), SHM_PER_THREAD_SIZE);
    }

    #[test]
    fn try_init_claims_slot_once() {
        let slot = zeroed_slot();

        assert!(slot.try_init(3));
        assert!(!slot.try_init(3));
        assert!(slot.is_initialized());
    }

    #[test]
    fn owner_thread_reads_as_alive() {
        let slot = zeroed_slot();
        slot.try_init(0);

        assert!(slot.is_alive());
    }

    #[test]
    fn pin_roundtrips() {
        let slot = zeroed_slot();
        slot.try_init(0);

        slot.pin_tx_block(17);

        assert_eq!(slot.pinned_tx_block(), 17);
    }

    #[test]
    fn dead_owner_is_detected_and_slot_reclaimed() {
        let slot: &'static PerThreadData = Box::leak(zeroed_slot());

        std::thread::spawn(move || {
            slot.try_init(0);
            // exits holding the robust mutex
        })
        .join()
        .unwrap();

        assert!(!slot.is_alive(), "dead owner must read as not alive");
        assert!(slot.try_init(0), "slot must be reusable after EOWNERDEAD");
    }
}
