// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! MMIO region dispatch.

use std::sync::{Arc, RwLock};

use crate::mem::{BusError, PhysAddr};

/// A device model backing a range of guest physical address space.
///
/// `offset` is relative to the region base; the access width is the buffer
/// length (1, 2, 4 or 8, or an unaligned fragment the splitter produced).
/// Accesses within one region are serialized by the caller.
pub trait MmioDevice: Send + Sync {
    /// # Errors
    ///
    /// Returns [`BusError`] if the device does not decode the offset; the
    /// engine turns this into a guest access fault.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), BusError>;

    /// # Errors
    ///
    /// Returns [`BusError`] if the device does not decode the offset.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), BusError>;
}

struct Region {
    base: u64,
    size: u64,
    // MMIO accesses are fully serialized per region
    dev: Arc<dyn MmioDevice>,
    lock: std::sync::Mutex<()>,
}

/// Ordered list of `[base, base + size)` regions overlaid on the physical
/// address space. Lookups are linear; machines register a handful of devices
/// and the hot path is RAM, which never reaches this table.
#[derive(Default)]
pub(crate) struct MmioBus {
    regions: RwLock<Vec<Region>>,
}

impl MmioBus {
    pub(crate) fn register(
        &self,
        base: u64,
        size: u64,
        dev: Arc<dyn MmioDevice>,
    ) -> crate::Result<()> {
        let mut regions = self.regions.write().expect("mmio registry poisoned");
        let end = base.checked_add(size).ok_or(crate::Error::MmioOverlap(PhysAddr::new(base)))?;
        if regions.iter().any(|r| base < r.base + r.size && r.base < end) {
            return Err(crate::Error::MmioOverlap(PhysAddr::new(base)));
        }
        regions.push(Region { base, size, dev, lock: std::sync::Mutex::new(()) });
        regions.sort_by_key(|r| r.base);
        Ok(())
    }

    pub(crate) fn unregister(&self, base: u64) -> crate::Result<()> {
        let mut regions = self.regions.write().expect("mmio registry poisoned");
        let index = regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(crate::Error::MmioNotRegistered(PhysAddr::new(base)))?;
        regions.remove(index);
        Ok(())
    }

    /// Dispatches a read landing at `addr`, if some region claims it.
    ///
    /// `None` means no region; the caller falls through to RAM or raises a
    /// bus error. An access that starts inside a region but runs off its end
    /// is a bus error, not a partial success.
    pub(crate) fn read(&self, addr: u64, buf: &mut [u8]) -> Option<Result<(), BusError>> {
        let regions = self.regions.read().expect("mmio registry poisoned");
        let region = claim(&regions, addr)?;
        if addr + buf.len() as u64 > region.base + region.size {
            return Some(Err(BusError));
        }
        let _serialized = region.lock.lock().expect("mmio region lock poisoned");
        Some(region.dev.read(addr - region.base, buf))
    }

    pub(crate) fn write(&self, addr: u64, buf: &[u8]) -> Option<Result<(), BusError>> {
        let regions = self.regions.read().expect("mmio registry poisoned");
        let region = claim(&regions, addr)?;
        if addr + buf.len() as u64 > region.base + region.size {
            return Some(Err(BusError));
        }
        let _serialized = region.lock.lock().expect("mmio region lock poisoned");
        Some(region.dev.write(addr - region.base, buf))
    }

    /// Whether any region overlaps `addr`.
    pub(crate) fn claims(&self, addr: u64) -> bool {
        let regions = self.regions.read().expect("mmio registry poisoned");
        claim(&regions, addr).is_some()
    }
}

fn claim(regions: &[Region], addr: u64) -> Option<&Region> {
    // sorted by base; partition_point finds the first region past addr
    let idx = regions.partition_point(|r| r.base <= addr);
    let region = regions[..idx].last()?;
    (addr < region.base + region.size).then_some(region)
}
