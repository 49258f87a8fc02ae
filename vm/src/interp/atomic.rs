// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The A extension: LR/SC and the AMOs.
//!
//! Every operation here resolves to a host atomic on the guest RAM word, so
//! guest atomics inherit the host's cross-thread serialization. SC resolves
//! as a compare-and-swap against the value observed by LR, which also
//! detects stores from other harts without a machine-wide reservation
//! registry.

use std::sync::atomic::Ordering;

use kestrel_riscv::Exception;
use kestrel_riscv::decode::{AmoOp, Instr, MemWidth};

use crate::hart::{Hart, Reservation};
use crate::mem::VirtAddr;
use crate::mmu::{self, Access};
use crate::trap::Fault;

pub(super) fn execute(hart: &mut Hart, instr: Instr) -> Result<(), Fault> {
    match instr {
        Instr::Lr { width, rd, rs1, .. } => {
            let vaddr = hart.x(rs1);
            if vaddr % width.bytes() != 0 {
                return Err(Fault::new(Exception::LoadMisaligned, vaddr));
            }
            let phys = mmu::translate(hart, VirtAddr::new(vaddr), Access::Load)?;
            let value = match width {
                MemWidth::W => {
                    let atom = hart
                        .machine()
                        .mem
                        .atomic_u32(phys)
                        .map_err(|_| Fault::new(Exception::LoadFault, vaddr))?;
                    i64::from(atom.load(Ordering::SeqCst) as i32) as u64
                }
                _ => {
                    let atom = hart
                        .machine()
                        .mem
                        .atomic_u64(phys)
                        .map_err(|_| Fault::new(Exception::LoadFault, vaddr))?;
                    atom.load(Ordering::SeqCst)
                }
            };
            hart.reservation = Some(Reservation { addr: phys, width: width.bytes(), value });
            hart.set_x(rd, value);
        }
        Instr::Sc { width, rd, rs1, rs2, .. } => {
            let vaddr = hart.x(rs1);
            if vaddr % width.bytes() != 0 {
                return Err(Fault::new(Exception::StoreMisaligned, vaddr));
            }
            let phys = mmu::translate(hart, VirtAddr::new(vaddr), Access::Store)?;
            // sc always clears the reservation, success or not
            let reservation = hart.reservation.take();
            let matches = reservation
                .is_some_and(|r| r.addr == phys && r.width == width.bytes());
            let success = matches && {
                let expected = reservation.expect("checked above").value;
                let new = hart.x(rs2);
                match width {
                    MemWidth::W => hart
                        .machine()
                        .mem
                        .atomic_u32(phys)
                        .map_err(|_| Fault::new(Exception::StoreFault, vaddr))?
                        .compare_exchange(
                            expected as u32,
                            new as u32,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok(),
                    _ => hart
                        .machine()
                        .mem
                        .atomic_u64(phys)
                        .map_err(|_| Fault::new(Exception::StoreFault, vaddr))?
                        .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok(),
                }
            };
            if success {
                // the store really happened; keep the dirty tracking honest
                hart.machine().mem.dma_mark_dirty(phys, width.bytes());
            }
            hart.set_x(rd, u64::from(!success));
        }
        Instr::Amo { op, width, rd, rs1, rs2, .. } => {
            let vaddr = hart.x(rs1);
            if vaddr % width.bytes() != 0 {
                return Err(Fault::new(Exception::StoreMisaligned, vaddr));
            }
            let phys = mmu::translate(hart, VirtAddr::new(vaddr), Access::Store)?;
            let src = hart.x(rs2);
            let old = match width {
                MemWidth::W => {
                    let atom = hart
                        .machine()
                        .mem
                        .atomic_u32(phys)
                        .map_err(|_| Fault::new(Exception::StoreFault, vaddr))?;
                    let old = amo_u32(atom, op, src as u32);
                    i64::from(old as i32) as u64
                }
                _ => {
                    let atom = hart
                        .machine()
                        .mem
                        .atomic_u64(phys)
                        .map_err(|_| Fault::new(Exception::StoreFault, vaddr))?;
                    amo_u64(atom, op, src)
                }
            };
            hart.machine().mem.dma_mark_dirty(phys, width.bytes());
            hart.set_x(rd, old);
        }
        _ => unreachable!("non-atomic instruction routed to the A executor"),
    }
    Ok(())
}

fn amo_u32(atom: &std::sync::atomic::AtomicU32, op: AmoOp, src: u32) -> u32 {
    match op {
        AmoOp::Swap => atom.swap(src, Ordering::SeqCst),
        AmoOp::Add => atom.fetch_add(src, Ordering::SeqCst),
        AmoOp::Xor => atom.fetch_xor(src, Ordering::SeqCst),
        AmoOp::And => atom.fetch_and(src, Ordering::SeqCst),
        AmoOp::Or => atom.fetch_or(src, Ordering::SeqCst),
        AmoOp::Min => atom
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                Some(((old as i32).min(src as i32)) as u32)
            })
            .expect("fetch_update closure never fails"),
        AmoOp::Max => atom
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                Some(((old as i32).max(src as i32)) as u32)
            })
            .expect("fetch_update closure never fails"),
        AmoOp::Minu => atom.fetch_min(src, Ordering::SeqCst),
        AmoOp::Maxu => atom.fetch_max(src, Ordering::SeqCst),
    }
}

fn amo_u64(atom: &std::sync::atomic::AtomicU64, op: AmoOp, src: u64) -> u64 {
    match op {
        AmoOp::Swap => atom.swap(src, Ordering::SeqCst),
        AmoOp::Add => atom.fetch_add(src, Ordering::SeqCst),
        AmoOp::Xor => atom.fetch_xor(src, Ordering::SeqCst),
        AmoOp::And => atom.fetch_and(src, Ordering::SeqCst),
        AmoOp::Or => atom.fetch_or(src, Ordering::SeqCst),
        AmoOp::Min => atom
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                Some(((old as i64).min(src as i64)) as u64)
            })
            .expect("fetch_update closure never fails"),
        AmoOp::Max => atom
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                Some(((old as i64).max(src as i64)) as u64)
            })
            .expect("fetch_update closure never fails"),
        AmoOp::Minu => atom.fetch_min(src, Ordering::SeqCst),
        AmoOp::Maxu => atom.fetch_max(src, Ordering::SeqCst),
    }
}
