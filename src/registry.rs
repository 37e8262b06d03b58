//! # Process-Wide Registries
//!
//! Two pieces of global state back the POSIX surface:
//!
//! - the fd → `File` map, shared by every thread, so interposed syscalls
//!   can route by file descriptor;
//! - the per-thread allocator map, keyed by file identity (inode), created
//!   lazily on a thread's first operation against a file. The allocator
//!   claims the thread's liveness slot in the file's shm region as a side
//!   effect.
//!
//! Both live for the life of the process; `close` drops the fd route but
//! the mapping and shm region stay valid for other openers, and a
//! thread's liveness slot is released implicitly when the thread exits
//! (the robust mutex reports the dead owner).

use std::cell::RefCell;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::alloc::Allocator;
use crate::error::{Error, Result};
use crate::file::File;

static FILES: OnceLock<RwLock<HashMap<i32, Arc<File>>>> = OnceLock::new();

thread_local! {
    static ALLOCATORS: RefCell<HashMap<u64, Allocator>> = RefCell::new(HashMap::new());
}

fn files() -> &'static RwLock<HashMap<i32, Arc<File>>> {
    FILES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Run `f` with the calling thread's allocator for `file`, creating it
/// (and claiming a shm liveness slot) on first use.
pub fn with_allocator<R>(
    file: &File,
    f: impl FnOnce(&mut Allocator) -> Result<R>,
) -> Result<R> {
    ALLOCATORS.with(|map| {
        let mut map = map.borrow_mut();
        let allocator = match map.entry(file.file_id()) {
            hashbrown::hash_map::Entry::Occupied(e) => e.into_mut(),
            hashbrown::hash_map::Entry::Vacant(v) => {
                let slot = file.shm().alloc_per_thread_data(file.meta())?;
                v.insert(Allocator::new(slot))
            }
        };
        f(allocator)
    })
}

/// Open a managed file and register it under its descriptor. Propagates
/// `NotOurFile` so an interposing shim can fall through to the kernel.
pub fn open(path: &Path, flags: i32, mode: u32) -> Result<i32> {
    let file = File::open(path, flags, mode)?;
    let fd = file.fd();
    files().write().insert(fd, Arc::new(file));
    Ok(fd)
}

pub fn get(fd: i32) -> Option<Arc<File>> {
    files().read().get(&fd).cloned()
}

/// Drop the fd route. The last handle tears the mapping down; shm stays
/// for other openers.
pub fn close(fd: i32) -> Result<()> {
    match files().write().remove(&fd) {
        Some(_) => Ok(()),
        None => Err(Error::InvalidArgument),
    }
}

/// Forget the calling thread's allocator for `file`, returning its cached
/// runs to the shared bitmap. Called when a `File` handle is torn down so
/// a later open of the same inode starts from the mirror, not from stale
/// cached runs.
pub fn forget_local(file: &File) {
    let _ = ALLOCATORS.try_with(|map| {
        if let Some(mut allocator) = map.borrow_mut().remove(&file.file_id()) {
            allocator.return_free_list(file.bitmap());
        }
    });
}

pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    route(fd)?.read(buf)
}

pub fn write(fd: i32, buf: &[u8]) -> Result<usize> {
    route(fd)?.write(buf)
}

pub fn pread(fd: i32, buf: &mut [u8], offset: u64) -> Result<usize> {
    route(fd)?.pread(buf, offset)
}

pub fn pwrite(fd: i32, buf: &[u8], offset: u64) -> Result<usize> {
    route(fd)?.pwrite(buf, offset)
}

pub fn lseek(fd: i32, offset: i64, whence: i32) -> Result<u64> {
    route(fd)?.lseek(offset, whence)
}

pub fn fsync(fd: i32) -> Result<()> {
    route(fd)?.fsync()
}

fn route(fd: i32) -> Result<Arc<File>> {
    get(fd).ok_or(Error::InvalidArgument)
}
