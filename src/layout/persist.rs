//! Cache-line persistence primitives.
//!
//! PM stores become durable once their cache lines are written back and a
//! store fence has drained the write-back queue. Commit ordering in the
//! transaction protocol is: data stores → clwb+sfence → log entry stores
//! → clwb+sfence → commit word store → clwb+sfence.
//!
//! `clwb` writes a line back without evicting it, which is what the hot
//! path wants: the committing thread (and readers right behind it) touch
//! the same lines again immediately. CPUs without CLWB fall back to
//! `clflushopt` and finally `clflush`, both of which evict but carry the
//! same durability guarantee. On non-x86 targets (and under Miri) the
//! write-backs degrade to compiler fences; the ordering argument is
//! unchanged, only durability timing is.

use crate::config::CACHELINE_SIZE;

/// Write back every cache line overlapping `[addr, addr + len)`.
///
/// # Safety
/// `addr..addr + len` must be a mapped, readable range.
#[inline]
pub unsafe fn flush_range(addr: *const u8, len: usize) {
    let start = addr as usize & !(CACHELINE_SIZE - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        flush_line(line as *const u8);
        line += CACHELINE_SIZE;
    }
}

/// Drain pending write-backs; the ordering point of the commit protocol.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: _mm_sfence has no preconditions.
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Write back a range and fence: the store-then-publish step.
///
/// # Safety
/// Same as [`flush_range`].
#[inline]
pub unsafe fn persist_fenced(addr: *const u8, len: usize) {
    flush_range(addr, len);
    fence();
}

/// Write back a range without fencing; the caller batches several ranges
/// and fences once.
///
/// # Safety
/// Same as [`flush_range`].
#[inline]
pub unsafe fn persist_unfenced(addr: *const u8, len: usize) {
    flush_range(addr, len);
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn flush_line(line: *const u8) {
    // the detection results are cached, so this check is one atomic load
    // each after the first call
    match cache_line_flush_kind() {
        FlushKind::Clwb => clwb(line),
        FlushKind::Clflushopt => clflushopt(line),
        FlushKind::Clflush => std::arch::x86_64::_mm_clflush(line),
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
unsafe fn flush_line(line: *const u8) {
    let _ = line;
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(target_arch = "x86_64")]
#[derive(Clone, Copy)]
enum FlushKind {
    Clwb,
    Clflushopt,
    Clflush,
}

// `std::arch::is_x86_feature_detected!` does not recognize "clwb" or
// "clflushopt" on this toolchain, so the CPUID leaf is read directly.
// Bit 24 (CLWB) and bit 23 (CLFLUSHOPT) of leaf 7, sub-leaf 0, EBX.
#[cfg(target_arch = "x86_64")]
#[inline]
fn cache_line_flush_kind() -> FlushKind {
    use std::sync::atomic::{AtomicU8, Ordering};
    static CACHED: AtomicU8 = AtomicU8::new(0);
    const CLWB: u8 = 1;
    const CLFLUSHOPT: u8 = 2;
    const CLFLUSH: u8 = 3;

    let cached = CACHED.load(Ordering::Relaxed);
    let kind = match cached {
        CLWB => FlushKind::Clwb,
        CLFLUSHOPT => FlushKind::Clflushopt,
        CLFLUSH => FlushKind::Clflush,
        _ => {
            let ebx = std::arch::x86_64::__cpuid_count(7, 0).ebx;
            let (kind, tag) = if (ebx >> 24) & 1 != 0 {
                (FlushKind::Clwb, CLWB)
            } else if (ebx >> 23) & 1 != 0 {
                (FlushKind::Clflushopt, CLFLUSHOPT)
            } else {
                (FlushKind::Clflush, CLFLUSH)
            };
            CACHED.store(tag, Ordering::Relaxed);
            kind
        }
    };
    kind
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn clwb(line: *const u8) {
    std::arch::asm!("clwb [{0}]", in(reg) line, options(nostack, preserves_flags));
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn clflushopt(line: *const u8) {
    std::arch::asm!("clflushopt [{0}]", in(reg) line, options(nostack, preserves_flags));
}
