// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The guest physical RAM region.

use core::slice;
use core::sync::atomic::{AtomicU32, AtomicU64};

use crate::{Error, Result};

/// One contiguous `mmap`-backed region of guest RAM.
///
/// Harts and device threads access RAM concurrently; racing plain accesses
/// are the guest's own data races and are routed through raw pointers, never
/// through Rust references to the whole region. AMOs go through the
/// [`Self::atomic_u32`]/[`Self::atomic_u64`] views so the word touched is
/// serialized machine-wide.
///
/// # Safety invariants
///
/// - `ptr` points to a live, page-aligned mapping of exactly `len` bytes for
///   the lifetime of the struct.
/// - All bounds checks happen here; callers hand in RAM-relative offsets that
///   have already been checked against `len`.
pub(crate) struct GuestRam {
    ptr: *mut u8,
    len: usize,
}

// Safety: the mapping is plain memory; cross-thread access discipline is
// documented on the struct.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Maps `len` bytes of zeroed anonymous memory.
    pub(crate) fn new(len: usize) -> Result<Self> {
        // Safety: anonymous mapping, no fd, checked result below.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            // Safety: errno read after a failed libc call
            return Err(Error::Mmap(unsafe { *libc::__errno_location() }));
        }
        Ok(Self { ptr: ptr.cast(), len })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn read(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset.checked_add(buf.len()).is_some_and(|end| end <= self.len));
        // Safety: in-bounds per the struct invariant; racy reads of guest RAM
        // go through raw pointers by design.
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    #[inline]
    pub(crate) fn write(&self, offset: usize, buf: &[u8]) {
        debug_assert!(offset.checked_add(buf.len()).is_some_and(|end| end <= self.len));
        // Safety: see `read`
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.add(offset), buf.len());
        }
    }

    /// Shared view of a RAM range, used by instruction fetch and the JIT
    /// frontend. The bytes may be concurrently written by other harts; the
    /// dirty-page protocol is what makes acting on them sound.
    #[inline]
    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
        // Safety: in-bounds; lifetime tied to `self`
        unsafe { slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Atomic view of a naturally aligned word, for AMO/LR/SC.
    #[inline]
    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // Safety: aligned, in-bounds, and atomics allow mixed-thread access
        unsafe { AtomicU32::from_ptr(self.ptr.add(offset).cast()) }
    }

    /// Atomic view of a naturally aligned doubleword, for AMO/LR/SC.
    #[inline]
    pub(crate) fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len);
        // Safety: see `atomic_u32`
        unsafe { AtomicU64::from_ptr(self.ptr.add(offset).cast()) }
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        // Safety: ptr/len came from mmap and are unmapped exactly once
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
