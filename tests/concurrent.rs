//! # Concurrency Behavior
//!
//! Multi-threaded semantics: unique offsets for sequential writers,
//! optimistic-concurrency reconciliation on single-block overwrites, and
//! reader/writer coexistence. All scenarios run on one shared `File`;
//! every thread claims its own allocator and shm liveness slot on first
//! use.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use ulayfs::File;

fn open_new(name: &str) -> File {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.keep().join(name);
    File::open(&path, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap()
}

#[test]
fn three_sequential_writers_get_distinct_offsets() {
    let file = open_new("three_writers.dat");

    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                file.write(b"x").unwrap();
            });
        }
    });

    assert_eq!(file.file_size().unwrap(), 3);
    let mut buf = [0u8; 3];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), 3);
    assert_eq!(&buf, b"xxx");
}

#[test]
fn sequential_writers_never_overlap() {
    let file = open_new("no_overlap.dat");
    const THREADS: usize = 4;
    const WRITES: usize = 50;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let file = &file;
            scope.spawn(move || {
                let marker = [b'a' + t as u8; 16];
                for _ in 0..WRITES {
                    file.write(&marker).unwrap();
                }
            });
        }
    });

    let total = THREADS * WRITES * 16;
    assert_eq!(file.file_size().unwrap(), total as u64);

    let mut buf = vec![0u8; total];
    file.pread(&mut buf, 0).unwrap();
    for chunk in buf.chunks(16) {
        let first = chunk[0];
        assert!((b'a'..b'a' + THREADS as u8).contains(&first));
        assert!(
            chunk.iter().all(|&b| b == first),
            "each 16-byte write is atomic, found torn chunk {:?}",
            chunk
        );
    }
}

#[test]
fn concurrent_overwrites_of_one_block_all_survive() {
    let file = open_new("occ.dat");
    file.pwrite(&[0u8; 4096], 0).unwrap();
    const THREADS: usize = 8;

    // every thread rewrites its own 128-byte range of the same block, so
    // each commit conflicts with the others and must reconcile its
    // before-image
    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let file = &file;
            scope.spawn(move || {
                let payload = [t as u8 + 1; 128];
                file.pwrite(&payload, (t * 128) as u64).unwrap();
            });
        }
    });

    let mut buf = [0u8; 4096];
    file.pread(&mut buf, 0).unwrap();
    for t in 0..THREADS {
        let range = &buf[t * 128..(t + 1) * 128];
        assert!(
            range.iter().all(|&b| b == t as u8 + 1),
            "thread {}'s range was lost by a conflicting commit",
            t
        );
    }
    assert!(buf[THREADS * 128..].iter().all(|&b| b == 0));
}

#[test]
fn concurrent_multi_block_boundary_overwrites_reconcile() {
    let file = open_new("occ_multi.dat");
    file.pwrite(&[0u8; 3 * 4096], 0).unwrap();

    // both writes share block 1 as a partial boundary block
    std::thread::scope(|scope| {
        let file_a = &file;
        scope.spawn(move || {
            file_a.pwrite(&[1u8; 4096], 2048).unwrap(); // blocks 0..=1
        });
        let file_b = &file;
        scope.spawn(move || {
            file_b.pwrite(&[2u8; 4096], 2048 + 4096).unwrap(); // blocks 1..=2
        });
    });

    let mut buf = [0u8; 3 * 4096];
    file.pread(&mut buf, 0).unwrap();
    assert!(buf[..2048].iter().all(|&b| b == 0));
    assert!(buf[2048..2048 + 4096].iter().all(|&b| b == 1));
    assert!(buf[2048 + 4096..2048 + 8192].iter().all(|&b| b == 2));
    assert!(buf[2048 + 8192..].iter().all(|&b| b == 0));
}

#[test]
fn disjoint_block_writers_do_not_interfere() {
    let file = open_new("disjoint.dat");
    const THREADS: usize = 6;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let file = &file;
            scope.spawn(move || {
                let payload = vec![t as u8 + 1; 4096];
                for round in 0..20 {
                    let _ = round;
                    file.pwrite(&payload, (t * 4096) as u64).unwrap();
                }
            });
        }
    });

    let mut buf = vec![0u8; THREADS * 4096];
    file.pread(&mut buf, 0).unwrap();
    for t in 0..THREADS {
        assert!(buf[t * 4096..(t + 1) * 4096].iter().all(|&b| b == t as u8 + 1));
    }
}

#[test]
fn reader_sees_complete_writes_only() {
    let file = open_new("reader_writer.dat");
    file.pwrite(&[0u8; 4096], 0).unwrap();
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let file_w = &file;
        let stop_w = &stop;
        scope.spawn(move || {
            for round in 0..200u32 {
                let payload = [(round % 255) as u8 + 1; 4096];
                file_w.pwrite(&payload, 0).unwrap();
            }
            stop_w.store(true, Ordering::Release);
        });

        let file_r = &file;
        let stop_r = &stop;
        scope.spawn(move || {
            while !stop_r.load(Ordering::Acquire) {
                let mut buf = [0u8; 4096];
                file_r.pread(&mut buf, 0).unwrap();
                let first = buf[0];
                assert!(
                    buf.iter().all(|&b| b == first),
                    "read observed a torn aligned write"
                );
            }
        });
    });
}

#[test]
fn read_your_writes_within_a_thread() {
    let file = open_new("ryw.dat");

    for i in 0..32u32 {
        let payload = [(i % 7) as u8 + 10; 100];
        let offset = u64::from(i) * 50;
        file.pwrite(&payload, offset).unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(file.pread(&mut buf, offset).unwrap(), 100);
        assert_eq!(buf, payload, "write {} not visible to its own thread", i);
    }
}

#[test]
fn cross_handle_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.keep().join("two_handles.dat");

    let writer = File::open(&path, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    writer.pwrite(b"written by A", 0).unwrap();

    let reader = File::open(&path, libc::O_RDWR, 0o644).unwrap();
    let mut buf = [0u8; 12];
    assert_eq!(reader.pread(&mut buf, 0).unwrap(), 12);
    assert_eq!(&buf, b"written by A");

    // and in the other direction, after the second handle exists
    writer.pwrite(b"more from A", 100).unwrap();
    let mut buf = [0u8; 11];
    assert_eq!(reader.pread(&mut buf, 100).unwrap(), 11);
    assert_eq!(&buf, b"more from A");
}
