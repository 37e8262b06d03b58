//! # Basic Read/Write Behavior
//!
//! Single-threaded POSIX semantics of the engine: aligned writes,
//! copy-on-write overwrites, unaligned multi-block writes, hole reads,
//! the shared offset, and the open-path fallback decisions.

use std::path::PathBuf;

use ulayfs::File;

fn scratch_path(name: &str) -> PathBuf {
    let dir = tempfile::tempdir().unwrap();
    dir.keep().join(name)
}

fn open_new(name: &str) -> File {
    File::open(
        &scratch_path(name),
        libc::O_CREAT | libc::O_RDWR,
        0o644,
    )
    .unwrap()
}

mod aligned_writes {
    use super::*;

    #[test]
    fn one_block_write_reads_back() {
        let file = open_new("aligned.dat");
        let payload = [b'A'; 4096];

        assert_eq!(file.pwrite(&payload, 0).unwrap(), 4096);

        let mut buf = [0u8; 4096];
        assert_eq!(file.pread(&mut buf, 0).unwrap(), 4096);
        assert_eq!(buf, payload);
        assert_eq!(file.file_size().unwrap(), 4096);
    }

    #[test]
    fn first_data_block_is_allocated_from_the_first_free_word() {
        let file = open_new("first_block.dat");

        file.pwrite(&[b'A'; 4096], 0).unwrap();

        // blocks 0..=32 are meta + bitmap blocks; the first batch claim
        // starts at the next bitmap word
        assert!(file.is_block_allocated(64));
    }

    #[test]
    fn multi_block_aligned_write() {
        let file = open_new("aligned_multi.dat");
        let payload: Vec<u8> = (0..3 * 4096).map(|i| (i % 251) as u8).collect();

        file.pwrite(&payload, 4096).unwrap();

        let mut buf = vec![0u8; 3 * 4096];
        assert_eq!(file.pread(&mut buf, 4096).unwrap(), 3 * 4096);
        assert_eq!(buf, payload);
        assert_eq!(file.file_size().unwrap(), 4 * 4096);
    }

    #[test]
    fn write_larger_than_one_bitmap_batch() {
        let file = open_new("aligned_large.dat");
        // 100 blocks forces two 64-block runs and an indirect commit
        let payload: Vec<u8> = (0..100 * 4096).map(|i| (i % 13) as u8).collect();

        file.pwrite(&payload, 0).unwrap();

        let mut buf = vec![0u8; 100 * 4096];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, payload);
    }
}

mod overwrites {
    use super::*;

    #[test]
    fn small_overwrite_preserves_surrounding_bytes() {
        let file = open_new("overwrite.dat");
        file.pwrite(&[b'A'; 4096], 0).unwrap();

        file.pwrite(&[b'B'; 10], 100).unwrap();

        let mut buf = [0u8; 4096];
        file.pread(&mut buf, 0).unwrap();
        assert!(buf[..100].iter().all(|&b| b == b'A'));
        assert!(buf[100..110].iter().all(|&b| b == b'B'));
        assert!(buf[110..].iter().all(|&b| b == b'A'));
        assert_eq!(file.file_size().unwrap(), 4096, "overwrite must not grow the file");
    }

    #[test]
    fn overwrite_moves_to_a_fresh_block() {
        let file = open_new("cow.dat");
        file.pwrite(&[b'A'; 4096], 0).unwrap();
        let before = file.allocated_block_count();

        file.pwrite(&[b'B'; 10], 100).unwrap();

        assert!(
            file.allocated_block_count() > before,
            "copy-on-write allocates a new block instead of updating in place"
        );
    }

    #[test]
    fn overwrite_spanning_two_blocks() {
        let file = open_new("spanning.dat");
        file.pwrite(&[b'A'; 2 * 4096], 0).unwrap();

        file.pwrite(&[b'C'; 200], 4000).unwrap();

        let mut buf = [0u8; 2 * 4096];
        file.pread(&mut buf, 0).unwrap();
        assert!(buf[..4000].iter().all(|&b| b == b'A'));
        assert!(buf[4000..4200].iter().all(|&b| b == b'C'));
        assert!(buf[4200..].iter().all(|&b| b == b'A'));
    }
}

mod unaligned_writes {
    use super::*;

    #[test]
    fn multi_block_unaligned_write_into_empty_file() {
        let file = open_new("unaligned.dat");
        let payload: Vec<u8> = (0..8192).map(|i| (i % 97) as u8 + 1).collect();

        file.pwrite(&payload, 100).unwrap();

        assert_eq!(file.file_size().unwrap(), 8292);

        let mut buf = vec![0u8; 8192];
        assert_eq!(file.pread(&mut buf, 100).unwrap(), 8192);
        assert_eq!(buf, payload);

        let mut head = vec![0u8; 100];
        assert_eq!(file.pread(&mut head, 0).unwrap(), 100);
        assert!(head.iter().all(|&b| b == 0), "bytes before the write are NULs");
    }

    #[test]
    fn unaligned_extension_sets_exact_size() {
        let file = open_new("tail_size.dat");

        file.pwrite(b"hello", 0).unwrap();
        assert_eq!(file.file_size().unwrap(), 5);

        file.pwrite(b"!", 4095).unwrap();
        assert_eq!(file.file_size().unwrap(), 4096);

        file.pwrite(b"more", 4096).unwrap();
        assert_eq!(file.file_size().unwrap(), 4100);
    }
}

mod holes {
    use super::*;

    #[test]
    fn bytes_in_a_hole_read_as_zeros() {
        let file = open_new("holes.dat");

        file.pwrite(&[b'Z'; 4096], 2 * 4096).unwrap();

        let mut buf = vec![0xffu8; 4096];
        assert_eq!(file.pread(&mut buf, 0).unwrap(), 4096);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(file.file_size().unwrap(), 3 * 4096);
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let file = open_new("eof.dat");
        file.pwrite(b"ten bytes!", 0).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(file.pread(&mut buf, 10).unwrap(), 0);
        assert_eq!(file.pread(&mut buf, 1000).unwrap(), 0);
    }

    #[test]
    fn read_clamps_at_eof() {
        let file = open_new("clamp.dat");
        file.pwrite(b"ten bytes!", 0).unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(file.pread(&mut buf, 4).unwrap(), 6);
        assert_eq!(&buf[..6], b"bytes!");
    }
}

mod shared_offset {
    use super::*;

    #[test]
    fn sequential_write_then_read_roundtrips() {
        let file = open_new("seq.dat");

        file.write(b"first").unwrap();
        file.write(b"second").unwrap();

        file.lseek(0, libc::SEEK_SET).unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(file.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"firstsecond");
    }

    #[test]
    fn read_advances_the_offset() {
        let file = open_new("advance.dat");
        file.write(b"abcdef").unwrap();
        file.lseek(0, libc::SEEK_SET).unwrap();

        let mut buf = [0u8; 3];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
        assert_eq!(file.read(&mut buf).unwrap(), 0, "offset is at EOF now");
    }

    #[test]
    fn lseek_whence_semantics() {
        let file = open_new("lseek.dat");
        file.pwrite(&[7u8; 100], 0).unwrap();

        assert_eq!(file.lseek(10, libc::SEEK_SET).unwrap(), 10);
        assert_eq!(file.lseek(5, libc::SEEK_CUR).unwrap(), 15);
        assert_eq!(file.lseek(-5, libc::SEEK_CUR).unwrap(), 10);
        assert_eq!(file.lseek(-10, libc::SEEK_END).unwrap(), 90);

        assert!(file.lseek(-1, libc::SEEK_SET).is_err());
        assert!(file.lseek(-200, libc::SEEK_CUR).is_err());
        assert!(file.lseek(0, 999).is_err());
    }

    #[test]
    fn append_mode_writes_land_at_eof() {
        let path = scratch_path("append.dat");
        {
            let file = File::open(&path, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
            file.pwrite(b"base", 0).unwrap();
        }
        let file = File::open(&path, libc::O_RDWR | libc::O_APPEND, 0o644).unwrap();
        file.lseek(0, libc::SEEK_SET).unwrap();

        file.write(b"+tail").unwrap();

        let mut buf = [0u8; 9];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"base+tail");
    }

    #[test]
    fn pwrite_does_not_move_the_offset() {
        let file = open_new("pwrite_offset.dat");
        file.write(b"abc").unwrap();

        file.pwrite(b"xyz", 100).unwrap();

        assert_eq!(file.lseek(0, libc::SEEK_CUR).unwrap(), 3);
    }
}

mod open_fallbacks {
    use super::*;

    #[test]
    fn foreign_block_aligned_file_is_not_ours() {
        let path = scratch_path("foreign.dat");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let err = File::open(&path, libc::O_RDWR, 0o644).unwrap_err();

        assert!(matches!(err, ulayfs::Error::NotOurFile));
    }

    #[test]
    fn unaligned_file_is_not_ours() {
        let path = scratch_path("unaligned_size.dat");
        std::fs::write(&path, b"just some text").unwrap();

        let err = File::open(&path, libc::O_RDWR, 0o644).unwrap_err();

        assert!(matches!(err, ulayfs::Error::NotOurFile));
    }

    #[test]
    fn wrong_signature_is_corruption() {
        let path = scratch_path("corrupt.dat");
        let mut bytes = vec![0u8; 4096];
        bytes[..16].copy_from_slice(b"DEFINITELYNOTPM\x00");
        std::fs::write(&path, bytes).unwrap();

        let err = File::open(&path, libc::O_RDWR, 0o644).unwrap_err();

        assert!(matches!(err, ulayfs::Error::Corruption));
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn read_only_open_falls_back() {
        let path = scratch_path("rdonly.dat");
        let err = File::open(&path, libc::O_RDONLY, 0).unwrap_err();

        assert!(matches!(err, ulayfs::Error::NotOurFile));
    }

    #[test]
    fn fsync_succeeds() {
        let file = open_new("fsync.dat");
        file.pwrite(b"durable", 0).unwrap();

        file.fsync().unwrap();
    }
}

mod registry_surface {
    use super::*;

    #[test]
    fn fd_routed_operations_work_end_to_end() {
        let path = scratch_path("registry.dat");

        let fd = ulayfs::registry::open(&path, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
        assert_eq!(ulayfs::registry::write(fd, b"hello registry").unwrap(), 14);
        ulayfs::registry::lseek(fd, 0, libc::SEEK_SET).unwrap();

        let mut buf = [0u8; 14];
        assert_eq!(ulayfs::registry::read(fd, &mut buf).unwrap(), 14);
        assert_eq!(&buf, b"hello registry");

        ulayfs::registry::fsync(fd).unwrap();
        ulayfs::registry::close(fd).unwrap();
        assert!(ulayfs::registry::pread(fd, &mut buf, 0).is_err());
    }
}
