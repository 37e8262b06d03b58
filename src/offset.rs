//! # Shared File Offset
//!
//! Sequential `read`/`write` share one file offset per open file, and
//! POSIX wants every sequential operation to see a unique, gap-free range.
//! A ticket protocol provides that: each operation takes a ticket, computes
//! its offset during its turn (FIFO by ticket), and releases the ticket by
//! CAS-advancing a serving counter when its copy has completed.
//!
//! Writers never wait on completion — their range is reserved the moment
//! their turn computes it. A reader that would cross EOF must first wait
//! until every earlier ticket has been served: only then is the file size
//! final for its snapshot and the read can clamp correctly. `pread` and
//! `pwrite` bypass this module entirely.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct OffsetMgr {
    offset: AtomicU64,
    next_ticket: AtomicU64,
    /// Tickets whose offset computation has finished.
    computed: AtomicU64,
    /// Tickets whose I/O has completed.
    serving: AtomicU64,
}

/// A reserved range of the shared offset.
#[derive(Debug, Clone, Copy)]
pub struct OffsetTicket {
    pub ticket: u64,
    pub offset: u64,
    /// Count after EOF clamping; zero for a read at or past EOF.
    pub count: u64,
}

impl Default for OffsetMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetMgr {
    pub fn new() -> Self {
        Self {
            offset: AtomicU64::new(0),
            next_ticket: AtomicU64::new(0),
            computed: AtomicU64::new(0),
            serving: AtomicU64::new(0),
        }
    }

    /// Reserve `count` bytes at the current offset for a write. With
    /// `append`, the offset is re-based to the file size returned by
    /// `refresh` (which must reflect all completed operations, so the
    /// turn first drains earlier tickets).
    pub fn acquire_write(&self, count: u64, append: bool, refresh: impl FnMut() -> u64) -> OffsetTicket {
        let ticket = self.take_turn();
        let offset = if append {
            self.wait_served(ticket);
            let mut refresh = refresh;
            let eof = refresh();
            self.offset.store(eof + count, Ordering::Release);
            eof
        } else {
            let offset = self.offset.load(Ordering::Acquire);
            self.offset.store(offset + count, Ordering::Release);
            offset
        };
        self.finish_turn(ticket);
        OffsetTicket {
            ticket,
            offset,
            count,
        }
    }

    /// Reserve up to `count` bytes for a sequential read that stops at
    /// EOF. If the read would cross the current file size, earlier
    /// operations are drained and the size re-read before clamping.
    pub fn acquire_read(
        &self,
        count: u64,
        file_size: u64,
        mut refresh: impl FnMut() -> u64,
    ) -> OffsetTicket {
        let ticket = self.take_turn();
        let offset = self.offset.load(Ordering::Acquire);
        let count = if offset + count <= file_size {
            count
        } else {
            // would cross EOF: the size is only final once every earlier
            // ticket has completed
            self.wait_served(ticket);
            let eof = refresh();
            count.min(eof.saturating_sub(offset))
        };
        self.offset.store(offset + count, Ordering::Release);
        self.finish_turn(ticket);
        OffsetTicket {
            ticket,
            offset,
            count,
        }
    }

    /// Release a ticket once its copy has completed. Completion is FIFO:
    /// the serving counter only advances to a ticket after every earlier
    /// one has released.
    pub fn release(&self, ticket: u64) {
        loop {
            match self.serving.compare_exchange_weak(
                ticket,
                ticket + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Reposition the offset (lseek). Serializes with in-flight sequential
    /// operations via the same turn mechanism. Returns the new offset, or
    /// `None` when the computed position is negative.
    pub fn seek(&self, compute: impl FnOnce(u64) -> Option<u64>) -> Option<u64> {
        let ticket = self.take_turn();
        let current = self.offset.load(Ordering::Acquire);
        let result = compute(current);
        if let Some(new_offset) = result {
            self.offset.store(new_offset, Ordering::Release);
        }
        self.finish_turn(ticket);
        // lseek does no I/O; release waits out earlier tickets by itself
        self.release(ticket);
        result
    }

    fn take_turn(&self) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel);
        while self.computed.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
        ticket
    }

    fn finish_turn(&self, ticket: u64) {
        self.computed.store(ticket + 1, Ordering::Release);
    }

    fn wait_served(&self, ticket: u64) {
        while self.serving.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn writes_reserve_disjoint_ranges() {
        let mgr = OffsetMgr::new();

        let a = mgr.acquire_write(10, false, || 0);
        mgr.release(a.ticket);
        let b = mgr.acquire_write(5, false, || 0);
        mgr.release(b.ticket);

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 10);
    }

    #[test]
    fn read_within_file_does_not_wait() {
        let mgr = OffsetMgr::new();

        let t = mgr.acquire_read(100, 4096, || panic!("refresh must not run"));

        assert_eq!(t.offset, 0);
        assert_eq!(t.count, 100);
        mgr.release(t.ticket);
    }

    #[test]
    fn read_clamps_at_eof_after_drain() {
        let mgr = OffsetMgr::new();
        let w = mgr.acquire_write(10, false, || 0);
        mgr.release(w.ticket);

        let r = mgr.acquire_read(100, 10, || 10);

        assert_eq!(r.offset, 10);
        assert_eq!(r.count, 0, "read at EOF returns zero bytes");
        mgr.release(r.ticket);
    }

    #[test]
    fn append_rebases_to_refreshed_eof() {
        let mgr = OffsetMgr::new();
        let w = mgr.acquire_write(7, true, || 4096);
        mgr.release(w.ticket);

        assert_eq!(w.offset, 4096);

        let r = mgr.acquire_read(1, 8192, || 8192);
        assert_eq!(r.offset, 4103);
        mgr.release(r.ticket);
    }

    #[test]
    fn seek_repositions_and_rejects_negative() {
        let mgr = OffsetMgr::new();

        assert_eq!(mgr.seek(|_| Some(100)), Some(100));
        assert_eq!(mgr.seek(|cur| cur.checked_sub(200)), None);
        assert_eq!(mgr.seek(|cur| Some(cur + 1)), Some(101));
    }

    #[test]
    fn concurrent_writers_get_unique_offsets() {
        let mgr = Arc::new(OffsetMgr::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                let mut offsets = Vec::new();
                for _ in 0..100 {
                    let t = mgr.acquire_write(1, false, || 0);
                    mgr.release(t.ticket);
                    offsets.push(t.offset);
                }
                offsets
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        let expected: Vec<u64> = (0..800).collect();
        assert_eq!(all, expected, "every byte offset is claimed exactly once");
    }
}
