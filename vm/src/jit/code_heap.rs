// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The executable arena, the block cache and the link registry.
//!
//! W^X discipline: one `memfd` region mapped twice, a writable view used by
//! emission and patching and an executable view used by dispatch. No mapping
//! is ever writable and executable at once.
//!
//! Locking: harts execute blocks under the read lock; installation, link
//! patching and flushes take the write lock after kicking every hart out of
//! compiled code, so no hart can be executing bytes that are being changed.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use kestrel_riscv::Privilege;
use smallvec::SmallVec;

use crate::mem::{DirtyMap, PhysAddr};
use crate::{Error, Result};

use super::backend::{self, CodeBuf, Emitter, HostEmitter};
use super::tracer::{Linkage, TraceResult};

/// Signature of the emitted dispatcher trampoline.
pub(crate) type Trampoline = unsafe extern "C" fn(*const u8, *mut crate::hart::Hart);

/// Block entries are cache-line aligned.
const ENTRY_ALIGN: usize = 64;

/// A finalized block. Immutable once installed; destroyed only by a full
/// flush.
#[derive(Clone, Copy)]
pub(crate) struct Block {
    pub entry_off: u32,
    #[allow(dead_code, reason = "recorded for diagnostics")]
    pub len: u32,
    /// Virtual PC the block was translated at; a different mapping of the
    /// same physical page must not reuse it.
    pub virt: u64,
    /// Privilege level captured at compile time.
    pub privilege: Privilege,
    pub instr_count: u32,
}

pub(crate) struct CodeHeap {
    pub(crate) inner: RwLock<HeapInner>,
}

pub(crate) struct HeapInner {
    arena: Arena,
    /// Guest physical PC -> compiled block.
    blocks: HashMap<u64, Block>,
    /// Unresolved direct-link sites keyed by the guest physical PC they
    /// wait for. Only guest-PC keys, never raw pointers, so a flush severs
    /// everything uniformly.
    pending: HashMap<u64, SmallVec<[u32; 2]>>,
    /// First usable offset, just past the trampoline.
    base_off: usize,
    trampoline: Trampoline,
    flushes: u64,
}

impl CodeHeap {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let mut arena = Arena::new(capacity)?;

        let mut buf = CodeBuf::new();
        HostEmitter::emit_trampoline(&mut buf);
        if buf.len() > capacity {
            return Err(Error::JitHeapTooSmall);
        }
        // Safety: nothing executes from the fresh arena yet
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_slice().as_ptr(), arena.rw, buf.len());
        }
        backend::flush_icache(arena.rx, buf.len());

        // Safety: the bytes at rx are the trampoline just emitted
        let trampoline: Trampoline = unsafe { std::mem::transmute(arena.rx) };
        let base_off = buf.len().next_multiple_of(ENTRY_ALIGN);
        arena.off = base_off;

        Ok(Self {
            inner: RwLock::new(HeapInner {
                arena,
                blocks: HashMap::new(),
                pending: HashMap::new(),
                base_off,
                trampoline,
                flushes: 0,
            }),
        })
    }
}

impl HeapInner {
    #[inline]
    pub(crate) fn lookup(&self, phys: PhysAddr) -> Option<Block> {
        self.blocks.get(&phys.get()).copied()
    }

    #[inline]
    pub(crate) fn entry_ptr(&self, block: &Block) -> *const u8 {
        // Safety: entry_off is inside the arena by construction
        unsafe { self.arena.rx.add(block.entry_off as usize) }
    }

    #[inline]
    pub(crate) fn trampoline(&self) -> Trampoline {
        self.trampoline
    }

    pub(crate) fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Copies a finalized trace into the arena, registers it and resolves
    /// direct links in both directions.
    ///
    /// # Errors
    ///
    /// [`Error::JitHeapTooSmall`] when the arena is out of space; the caller
    /// flushes and retries once.
    pub(crate) fn install(
        &mut self,
        result: &TraceResult,
        phys: PhysAddr,
        virt: u64,
        privilege: Privilege,
    ) -> Result<Block> {
        let len = result.buf.len();
        let entry_off = self.arena.off.next_multiple_of(ENTRY_ALIGN);
        if entry_off + len > self.arena.cap {
            return Err(Error::JitHeapTooSmall);
        }

        // Safety: the target range is past every live block and no hart
        // executes while we hold the heap exclusively
        unsafe {
            std::ptr::copy_nonoverlapping(
                result.buf.as_slice().as_ptr(),
                self.arena.rw.add(entry_off),
                len,
            );
        }
        self.arena.off = entry_off + len;

        let block = Block {
            entry_off: entry_off as u32,
            len: len as u32,
            virt,
            privilege,
            instr_count: result.instr_count,
        };

        if HostEmitter::NATIVE_LINKER && result.linkage != Linkage::None {
            // outgoing links: patch now if the target exists, else park the
            // site under the target's guest PC
            for site in &result.links {
                let site_off = entry_off + site.offset as usize;
                match self.blocks.get(&site.target) {
                    Some(target) => self.patch(site_off, target.entry_off as usize),
                    None => {
                        self.pending
                            .entry(site.target)
                            .or_default()
                            .push(site_off as u32);
                    }
                }
            }
        }

        // incoming links: every site that waited for this PC
        if let Some(waiters) = self.pending.remove(&phys.get()) {
            for site_off in waiters {
                self.patch(site_off as usize, entry_off);
            }
        }

        self.blocks.insert(phys.get(), block);
        backend::flush_icache(self.entry_ptr(&block), len);

        tracing::trace!(
            phys = %phys,
            virt = format_args!("{virt:#x}"),
            len,
            instrs = block.instr_count,
            links = result.links.len(),
            abireclaim = format_args!("{:#x}", result.abireclaim),
            "installed block"
        );
        Ok(block)
    }

    fn patch(&self, site_off: usize, target_off: usize) {
        // Safety: both offsets are inside the arena; the heap is held
        // exclusively so nothing executes the site while it changes
        unsafe {
            HostEmitter::patch_jump(
                self.arena.rw.add(site_off),
                self.arena.rx as usize + site_off,
                self.arena.rx as usize + target_off,
            );
            backend::flush_icache(self.arena.rx.add(site_off), HostEmitter::SLOT_SIZE);
        }
    }

    /// Global invalidation: resets the bump pointer, empties both maps,
    /// clears the dirty map and bumps the machine epoch. Never frees
    /// individual blocks.
    pub(crate) fn flush(&mut self, dirty: &DirtyMap, epoch: &AtomicU64) {
        tracing::debug!(
            blocks = self.blocks.len(),
            bytes = self.arena.off - self.base_off,
            "code heap flush"
        );
        self.arena.off = self.base_off;
        self.blocks.clear();
        self.pending.clear();
        dirty.clear();
        epoch.fetch_add(1, Ordering::AcqRel);
        self.flushes += 1;
    }
}

/// The doubly mapped executable region.
struct Arena {
    rw: *mut u8,
    rx: *const u8,
    cap: usize,
    off: usize,
}

// Safety: raw views of a shared mapping; all mutation is serialized by the
// heap lock above.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(cap: usize) -> Result<Self> {
        // Safety: plain libc calls, results checked
        unsafe {
            let fd = libc::memfd_create(c"kestrel-jit".as_ptr(), 0);
            if fd < 0 {
                return Err(Error::Mmap(*libc::__errno_location()));
            }
            if libc::ftruncate(fd, cap as libc::off_t) != 0 {
                let err = *libc::__errno_location();
                libc::close(fd);
                return Err(Error::Mmap(err));
            }
            let rw = libc::mmap(
                core::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            let rx = libc::mmap(
                core::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_SHARED,
                fd,
                0,
            );
            // the mappings keep the region alive
            libc::close(fd);
            if rw == libc::MAP_FAILED || rx == libc::MAP_FAILED {
                return Err(Error::Mmap(*libc::__errno_location()));
            }
            Ok(Self { rw: rw.cast(), rx: rx.cast_const().cast(), cap, off: 0 })
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: both views came from mmap with this length
        unsafe {
            libc::munmap(self.rw.cast(), self.cap);
            libc::munmap(self.rx.cast_mut().cast(), self.cap);
        }
    }
}
