// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The tracing JIT: dispatch, compilation driving, and invalidation glue.

pub(crate) mod backend;
mod code_heap;
mod helpers;
mod regalloc;
mod tracer;

use kestrel_riscv::{Exception, Xlen};

pub(crate) use code_heap::{CodeHeap, HeapInner};

use crate::hart::Hart;
use crate::machine::Machine;
use crate::mem::PhysAddr;
use crate::trap::Fault;
use crate::{PAGE_SIZE, Error};

use backend::{Emitter, HostEmitter};
use tracer::TraceResult;

/// Field offsets the backends bake into emitted instructions. Computed from
/// the real layout, so they can never drift from the structs.
pub(crate) mod layout {
    use core::mem::offset_of;

    use crate::hart::{Hart, HartState};

    const STATE: usize = offset_of!(Hart, state);
    pub(crate) const PC: usize = STATE + offset_of!(HartState, pc);
    pub(crate) const EXIT_REQ_PTR: usize = STATE + offset_of!(HartState, exit_req);
    pub(crate) const TRAP_PENDING: usize = STATE + offset_of!(HartState, trap_pending);
    pub(crate) const JIT_INSTRET: usize = STATE + offset_of!(HartState, jit_instret);

    pub(crate) fn reg_offset(guest: u8) -> i32 {
        (STATE + offset_of!(HartState, regs) + usize::from(guest) * 8) as i32
    }

    static_assertions::const_assert!(JIT_INSTRET < i32::MAX as usize);
}

/// Whether translation is possible for this host/guest combination at all.
pub(crate) fn supported(xlen: Xlen) -> bool {
    HostEmitter::supports(xlen)
}

/// Tries to run the code at `phys` through the JIT. Returns `false` when the
/// caller should interpret instead: JIT disabled, cold code, or compilation
/// declined.
pub(crate) fn dispatch(hart: &mut Hart, phys: PhysAddr) -> bool {
    let machine = hart.machine_arc();
    let Some(heap) = machine.code_heap() else {
        return false;
    };

    loop {
        {
            let inner = heap.inner.read().expect("code heap poisoned");

            // a dirty starting page invalidates every translation
            if machine
                .mem
                .ram_offset(phys, 1)
                .is_some_and(|offset| machine.mem.dirty.is_dirty(offset))
            {
                drop(inner);
                machine.heap_flush();
                continue;
            }

            if let Some(block) = inner.lookup(phys) {
                if block.virt != hart.state.pc || block.privilege != hart.privilege {
                    // same physical bytes reached under a different mapping
                    // or privilege; the block's baked-in constants are wrong
                    // for it
                    return false;
                }
                let entry = inner.entry_ptr(&block);
                let trampoline = inner.trampoline();
                // Safety: entry points at a finalized block in the RX view;
                // the read guard keeps the flusher out while it runs
                unsafe {
                    trampoline(entry, core::ptr::from_mut(hart));
                }
                drop(inner);

                hart.sync_jit_counters();
                if hart.state.trap_pending != 0 {
                    hart.state.trap_pending = 0;
                    let cause = Exception::try_from(hart.state.trap_cause)
                        .unwrap_or(Exception::IllegalInstruction);
                    let fault = Fault::new(cause, hart.state.trap_tval);
                    // the block stored the faulting instruction's PC before
                    // the helper call
                    hart.take_fault(fault, hart.state.pc);
                }
                return true;
            }
        }

        // cold miss: interpret until the promotion threshold
        if !hart.note_hot(phys) {
            return false;
        }

        let Some(result) = compile(hart, &machine, phys) else {
            // untranslatable entry instruction; stop trying at this PC
            hart.reset_hot(phys);
            return false;
        };

        let installed = machine.with_heap_exclusive(|inner| {
            inner.install(&result, phys, hart.state.pc, hart.privilege).map(|_| ())
        });
        match installed {
            Ok(()) => {} // loop around to the hit path
            Err(Error::JitHeapTooSmall) => {
                // heap full: flush and retry once, then give up and interpret
                machine.heap_flush();
                let retried = machine.with_heap_exclusive(|inner| {
                    inner.install(&result, phys, hart.state.pc, hart.privilege).map(|_| ())
                });
                if retried.is_err() {
                    tracing::warn!(%phys, "block exceeds the code heap, interpreting");
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
}

fn compile(hart: &Hart, machine: &Machine, phys: PhysAddr) -> Option<TraceResult> {
    let page_remaining = PAGE_SIZE - phys.page_offset() as usize;
    let bytes = machine.mem.fetch_slice(phys, page_remaining)?;
    tracer::trace::<HostEmitter>(
        bytes,
        phys,
        hart.state.pc,
        hart.xlen,
        machine.config().jit_max_block,
    )
}
