// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interrupt plumbing between device models and harts.
//!
//! The controller is the core-side endpoint only: an external PLIC or ACLINT
//! model decides *which* hart and line to drive, then calls in here. Posting
//! is lock-free (an atomic OR into the target hart's pending mask) so device
//! threads never contend with the hart loop.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use kestrel_riscv::Interrupt;

use crate::hart::HartShared;

pub struct IrqController {
    harts: Vec<Arc<HartShared>>,
    /// Machine time, driven by the embedder's ACLINT model and read through
    /// the `time` CSR.
    pub(crate) mtime: AtomicU64,
}

impl IrqController {
    pub(crate) fn new(harts: Vec<Arc<HartShared>>) -> Self {
        Self { harts, mtime: AtomicU64::new(0) }
    }

    /// Raises an interrupt line towards one hart. Wakes it if it is parked
    /// in WFI and kicks it out of compiled code.
    pub fn raise(&self, hart: usize, line: Interrupt) {
        if let Some(shared) = self.harts.get(hart) {
            tracing::trace!(hart, ?line, "irq raise");
            shared.raise(line.mask());
        }
    }

    /// Lowers an interrupt line towards one hart.
    pub fn clear(&self, hart: usize, line: Interrupt) {
        if let Some(shared) = self.harts.get(hart) {
            shared.clear(line.mask());
        }
    }

    /// Timer-compare delivery from an ACLINT model: updates machine time and
    /// drives MTIP on the target hart.
    pub fn timer_event(&self, hart: usize, mtime: u64, pending: bool) {
        self.mtime.store(mtime, std::sync::atomic::Ordering::Release);
        if pending {
            self.raise(hart, Interrupt::MachineTimer);
        } else {
            self.clear(hart, Interrupt::MachineTimer);
        }
    }
}
