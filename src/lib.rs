//! # ulayfs - User-Space File I/O for Persistent Memory
//!
//! ulayfs executes POSIX file I/O directly against a memory-mapped
//! persistent-memory file, bypassing the kernel on the hot path while
//! keeping crash consistency through an embedded log-structured
//! transaction protocol. Multiple threads of one process and multiple
//! processes opening the same file cooperate through lock-free commit
//! entries, a shared bitmap mirror, and robust-mutex liveness slots.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ulayfs::File;
//!
//! let file = File::open("/mnt/pmem/data".as_ref(), libc::O_CREAT | libc::O_RDWR, 0o644)?;
//! file.pwrite(b"hello", 0)?;
//!
//! let mut buf = [0u8; 5];
//! file.pread(&mut buf, 0)?;
//! assert_eq!(&buf, b"hello");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   POSIX surface (File / registry)       │
//! ├─────────────────────────────────────────┤
//! │  OffsetMgr   │  Tx dispatch (R/W/COW)   │
//! ├──────────────┼──────────────────────────┤
//! │  BlkTable    │  TxMgr + LogMgr          │
//! ├──────────────┴──────────────────────────┤
//! │  Allocator (per thread) │ GC            │
//! ├─────────────────────────────────────────┤
//! │  MemTable (2 MiB mmap units)  │ ShmMgr  │
//! ├─────────────────────────────────────────┤
//! │  PM block layout (meta/bitmap/tx/log)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//!
//! A write allocates fresh blocks, copies and flushes the payload, writes
//! a redo-log chain naming the blocks, and publishes one atomic 8-byte
//! commit entry. Readers replay committed entries into a DRAM
//! virtual-to-logical table before copying bytes straight out of PM. A
//! crash at any instant leaves either the commit word visible with all
//! its effects, or nothing.
//!
//! ## Module Overview
//!
//! - [`layout`]: on-PM block formats and persistence primitives
//! - [`mem_table`]: grow-unit mmap management
//! - [`alloc`]: per-thread block and log-slot allocation
//! - [`log_mgr`] / [`tx_mgr`]: redo logging and the commit protocol
//! - [`blk_table`]: the replayed virtual-to-logical index
//! - [`offset`]: ticket-ordered shared file offset
//! - [`shm`]: cross-process bitmap mirror and liveness slots
//! - [`gc`]: tx chain rewriting and block reclamation
//! - [`file`] / [`registry`]: the POSIX-facing surface

pub mod alloc;
pub mod blk_table;
pub mod config;
pub mod error;
pub mod file;
pub mod gc;
pub mod layout;
pub mod log_mgr;
pub mod mem_table;
pub mod offset;
pub mod registry;
pub mod shm;
pub mod tx;
pub mod tx_mgr;

pub use error::{Error, Result};
pub use file::{File, OpenFlags};
