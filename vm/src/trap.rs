// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Precise guest trap delivery.

use kestrel_riscv::csr::mstatus;
use kestrel_riscv::{Exception, Privilege, Trap};

use crate::hart::Hart;

/// A synchronous guest fault: the cause plus the value for `{m,s}tval`.
///
/// This is the pervasive "error" type of the execution paths. It is cheap,
/// `Copy`, and never escapes to the embedder; the hart loop converts it into
/// a state change of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub cause: Exception,
    pub tval: u64,
}

impl Fault {
    #[inline]
    #[must_use]
    pub fn new(cause: Exception, tval: u64) -> Self {
        Self { cause, tval }
    }
}

/// Delivers `trap` to the hart: selects the destination privilege via the
/// delegation CSRs, pushes the status stack, records cause/epc/tval and
/// vectors the PC.
///
/// `epc` is the address of the instruction that trapped (synchronous) or the
/// address of the next instruction to resume at (interrupt).
pub(crate) fn deliver(hart: &mut Hart, trap: Trap, tval: u64, epc: u64) {
    let delegated = hart.privilege <= Privilege::Supervisor
        && match trap {
            Trap::Exception(e) => hart.csr.medeleg & e.mask() != 0,
            Trap::Interrupt(i) => hart.csr.mideleg & i.mask() != 0,
        };

    let xlen_bits = hart.xlen.bits();
    let cause = trap.to_bits(xlen_bits);

    tracing::trace!(
        hart = hart.id,
        %trap,
        epc = format_args!("{epc:#x}"),
        tval = format_args!("{tval:#x}"),
        to_s = delegated,
        "trap"
    );

    if delegated {
        hart.csr.scause = cause;
        hart.csr.sepc = hart.xlen.canonicalize(epc) & !1;
        hart.csr.stval = tval;

        // push SIE -> SPIE, privilege -> SPP, clear SIE
        let mut status = hart.csr.mstatus;
        let sie = status & mstatus::SIE != 0;
        status &= !(mstatus::SPIE | mstatus::SPP | mstatus::SIE);
        if sie {
            status |= mstatus::SPIE;
        }
        if hart.privilege == Privilege::Supervisor {
            status |= mstatus::SPP;
        }
        hart.csr.mstatus = status;

        hart.privilege = Privilege::Supervisor;
        hart.state.pc = vector(hart.csr.stvec, trap, hart.xlen.bits());
    } else {
        hart.csr.mcause = cause;
        hart.csr.mepc = hart.xlen.canonicalize(epc) & !1;
        hart.csr.mtval = tval;

        // push MIE -> MPIE, privilege -> MPP, clear MIE
        let mut status = hart.csr.mstatus;
        let mie = status & mstatus::MIE != 0;
        status &= !(mstatus::MPIE | mstatus::MPP | mstatus::MIE);
        if mie {
            status |= mstatus::MPIE;
        }
        status |= (hart.privilege as u64) << mstatus::MPP_SHIFT;
        hart.csr.mstatus = status;

        hart.privilege = Privilege::Machine;
        hart.state.pc = vector(hart.csr.mtvec, trap, hart.xlen.bits());
    }

    // a trap is a context switch as far as LR/SC is concerned
    hart.reservation = None;
    // the TLB key includes the privilege level, so entries stay coherent
    // across the switch without a flush here
}

/// Computes the trap handler address from a `{m,s}tvec` value: direct mode
/// uses the base for everything, vectored mode offsets interrupts by
/// `4 * cause`.
fn vector(tvec: u64, trap: Trap, xlen_bits: u32) -> u64 {
    let base = tvec & !0b11;
    let target = match (tvec & 0b11, trap) {
        (1, Trap::Interrupt(i)) => base + 4 * i as u64,
        _ => base,
    };
    match xlen_bits {
        32 => target & 0xffff_ffff,
        _ => target,
    }
}

/// `mret`: pops the machine status stack and returns to MPP at `mepc`.
pub(crate) fn machine_return(hart: &mut Hart) {
    let status = hart.csr.mstatus;
    let mpie = status & mstatus::MPIE != 0;
    let mpp = Privilege::from_bits(status >> mstatus::MPP_SHIFT);

    let mut status = status & !(mstatus::MIE | mstatus::MPIE | mstatus::MPP);
    if mpie {
        status |= mstatus::MIE;
    }
    status |= mstatus::MPIE;
    // leaving M-mode for anything less privileged drops MPRV
    if mpp != Privilege::Machine {
        status &= !mstatus::MPRV;
    }
    hart.csr.mstatus = status;

    hart.privilege = mpp;
    hart.state.pc = hart.csr.mepc;
    hart.reservation = None;
}

/// `sret`: pops the supervisor status stack and returns to SPP at `sepc`.
pub(crate) fn supervisor_return(hart: &mut Hart) {
    let status = hart.csr.mstatus;
    let spie = status & mstatus::SPIE != 0;
    let spp = if status & mstatus::SPP != 0 { Privilege::Supervisor } else { Privilege::User };

    let mut status = status & !(mstatus::SIE | mstatus::SPIE | mstatus::SPP);
    if spie {
        status |= mstatus::SIE;
    }
    status |= mstatus::SPIE;
    status &= !mstatus::MPRV;
    hart.csr.mstatus = status;

    hart.privilege = spp;
    hart.state.pc = hart.csr.sepc;
    hart.reservation = None;
}
