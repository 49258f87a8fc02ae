// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guest physical memory: RAM, MMIO dispatch and dirty tracking.

mod addr;
mod dirty;
mod mmio;
mod phys;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64};

pub use addr::{PhysAddr, VirtAddr};
pub use dirty::DirtyMap;
pub use mmio::MmioDevice;
use phys::GuestRam;

use crate::Result;

/// An access decoded to no device and no RAM, or rejected by a device.
/// Becomes a guest load/store/fetch access fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusError;

impl core::fmt::Display for BusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("guest bus error")
    }
}

impl std::error::Error for BusError {}

/// The guest physical address space: one RAM region with dirty tracking plus
/// an ordered list of MMIO regions overlaid on it.
pub struct PhysMemory {
    ram: GuestRam,
    ram_base: u64,
    pub(crate) dirty: DirtyMap,
    mmio: mmio::MmioBus,
}

impl PhysMemory {
    pub(crate) fn new(ram_base: u64, ram_size: u64) -> Result<Self> {
        if !PhysAddr::new(ram_base).is_aligned(crate::PAGE_SIZE as u64)
            || ram_size == 0
            || ram_size % crate::PAGE_SIZE as u64 != 0
        {
            return Err(crate::Error::Misaligned);
        }
        Ok(Self {
            ram: GuestRam::new(ram_size as usize)?,
            ram_base,
            dirty: DirtyMap::new(ram_size as usize),
            mmio: mmio::MmioBus::default(),
        })
    }

    #[inline]
    pub(crate) fn ram_base(&self) -> u64 {
        self.ram_base
    }

    #[inline]
    pub(crate) fn ram_size(&self) -> u64 {
        self.ram.len() as u64
    }

    /// RAM-relative offset of `addr..addr + len`, if fully inside RAM.
    #[inline]
    pub(crate) fn ram_offset(&self, addr: PhysAddr, len: u64) -> Option<usize> {
        let offset = addr.get().checked_sub(self.ram_base)?;
        (offset.checked_add(len)? <= self.ram.len() as u64).then_some(offset as usize)
    }

    pub(crate) fn register_mmio(
        &self,
        base: u64,
        size: u64,
        dev: Arc<dyn MmioDevice>,
    ) -> Result<()> {
        self.mmio.register(base, size, dev)
    }

    pub(crate) fn unregister_mmio(&self, base: u64) -> Result<()> {
        self.mmio.unregister(base)
    }

    /// Reads `buf.len()` bytes at `addr`, dispatching to MMIO or RAM.
    ///
    /// # Errors
    ///
    /// [`BusError`] if the range is backed by neither, or a device rejects
    /// the access.
    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> core::result::Result<(), BusError> {
        if let Some(result) = self.mmio.read(addr.get(), buf) {
            return result;
        }
        let offset = self.ram_offset(addr, buf.len() as u64).ok_or(BusError)?;
        self.ram.read(offset, buf);
        Ok(())
    }

    /// Writes `buf` at `addr`. RAM writes mark the covered pages dirty.
    ///
    /// # Errors
    ///
    /// [`BusError`] if the range is backed by neither RAM nor a device, or a
    /// device rejects the access.
    pub fn write(&self, addr: PhysAddr, buf: &[u8]) -> core::result::Result<(), BusError> {
        if let Some(result) = self.mmio.write(addr.get(), buf) {
            return result;
        }
        let offset = self.ram_offset(addr, buf.len() as u64).ok_or(BusError)?;
        self.ram.write(offset, buf);
        self.dirty.mark(offset, buf.len());
        Ok(())
    }

    /// Little-endian integer read of `width` ∈ {1,2,4,8} bytes.
    pub(crate) fn read_int(
        &self,
        addr: PhysAddr,
        width: u64,
    ) -> core::result::Result<u64, BusError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf[..width as usize])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian integer write of `width` ∈ {1,2,4,8} bytes.
    pub(crate) fn write_int(
        &self,
        addr: PhysAddr,
        width: u64,
        value: u64,
    ) -> core::result::Result<(), BusError> {
        self.write(addr, &value.to_le_bytes()[..width as usize])
    }

    /// Shared view of RAM bytes for instruction fetch and the JIT frontend.
    /// `None` if the range is not plain RAM (executing from MMIO is an
    /// instruction access fault).
    #[inline]
    pub(crate) fn fetch_slice(&self, addr: PhysAddr, len: usize) -> Option<&[u8]> {
        if self.mmio.claims(addr.get()) {
            return None;
        }
        let offset = self.ram_offset(addr, len as u64)?;
        Some(self.ram.slice(offset, len))
    }

    /// Atomic word in RAM, for AMO and LR/SC. The address must be naturally
    /// aligned; callers raise the misaligned-AMO trap before coming here.
    pub(crate) fn atomic_u32(&self, addr: PhysAddr) -> core::result::Result<&AtomicU32, BusError> {
        debug_assert!(addr.is_aligned(4));
        let offset = self.ram_offset(addr, 4).ok_or(BusError)?;
        Ok(self.ram.atomic_u32(offset))
    }

    /// Atomic doubleword in RAM, for AMO and LR/SC.
    pub(crate) fn atomic_u64(&self, addr: PhysAddr) -> core::result::Result<&AtomicU64, BusError> {
        debug_assert!(addr.is_aligned(8));
        let offset = self.ram_offset(addr, 8).ok_or(BusError)?;
        Ok(self.ram.atomic_u64(offset))
    }

    /// Marks pages touched by a device DMA completion, so stale translations
    /// covering them are retired before their next dispatch.
    pub fn dma_mark_dirty(&self, addr: PhysAddr, len: u64) {
        if let Some(offset) = self.ram_offset(addr, 0) {
            let len = (len as usize).min(self.ram.len() - offset);
            self.dirty.mark(offset, len);
        }
    }

    /// Marks all of RAM dirty; `fence.i` with no better information.
    pub(crate) fn mark_all_dirty(&self) {
        self.dirty.mark(0, self.ram.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> PhysMemory {
        PhysMemory::new(0x8000_0000, 1024 * 1024).unwrap()
    }

    #[test]
    fn ram_round_trip() {
        let mem = mem();
        mem.write_int(PhysAddr::new(0x8000_0100), 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read_int(PhysAddr::new(0x8000_0100), 8).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(mem.read_int(PhysAddr::new(0x8000_0104), 4).unwrap(), 0x1122_3344);
        assert_eq!(mem.read_int(PhysAddr::new(0x8000_0107), 1).unwrap(), 0x11);
    }

    #[test]
    fn unaligned_access_spans_bytes() {
        let mem = mem();
        mem.write_int(PhysAddr::new(0x8000_0ffe), 4, 0xaabb_ccdd).unwrap();
        assert_eq!(mem.read_int(PhysAddr::new(0x8000_0ffe), 4).unwrap(), 0xaabb_ccdd);
        assert_eq!(mem.read_int(PhysAddr::new(0x8000_1000), 2).unwrap(), 0xaabb);
    }

    #[test]
    fn out_of_range_is_bus_error() {
        let mem = mem();
        assert_eq!(mem.read_int(PhysAddr::new(0x1000), 4), Err(BusError));
        assert_eq!(mem.read_int(PhysAddr::new(0x8010_0000), 4), Err(BusError));
        // straddling the end of RAM
        assert_eq!(mem.read_int(PhysAddr::new(0x800f_fffe), 4), Err(BusError));
    }

    #[test]
    fn writes_mark_dirty() {
        let mem = mem();
        assert!(!mem.dirty.is_dirty(0x2000));
        mem.write_int(PhysAddr::new(0x8000_2000), 4, 1).unwrap();
        assert!(mem.dirty.is_dirty(0x2000));
    }

    #[test]
    fn dma_marks_dirty() {
        let mem = mem();
        mem.dma_mark_dirty(PhysAddr::new(0x8000_4000), 8192);
        assert!(mem.dirty.is_dirty(0x4000));
        assert!(mem.dirty.is_dirty(0x5000));
        assert!(!mem.dirty.is_dirty(0x7000));
    }
}
