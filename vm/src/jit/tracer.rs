// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The JIT frontend: decodes a straight-line trace and drives the register
//! allocator and backend.
//!
//! A trace never crosses a guest physical page, so the guest bytes come from
//! one borrowed page slice. The caller re-checks the page's dirty bit before
//! the block's first dispatch, which is what makes compiling from bytes that
//! may be concurrently written sound.

use smallvec::SmallVec;

use kestrel_riscv::Xlen;
use kestrel_riscv::decode::{self, AluOp, Instr, MemWidth};

use crate::interp;
use crate::mem::PhysAddr;

use super::backend::{CodeBuf, Emitter};
use super::helpers;
use super::regalloc::RegAlloc;

/// Which tail the trace ended in; decides which patch sites the finalizer
/// registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Linkage {
    /// Plain exit: PC stored, return to the dispatcher.
    None,
    /// Conditional branch: two patchable slots.
    Tail,
    /// Unconditional jump: one patchable slot.
    Jmp,
}

/// A patchable direct-jump site within the emitted buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkSite {
    /// Byte offset of the slot inside the block.
    pub offset: u32,
    /// Guest physical PC the slot wants to jump to.
    pub target: u64,
}

pub(crate) struct TraceResult {
    pub buf: CodeBuf,
    pub links: SmallVec<[LinkSite; 2]>,
    pub instr_count: u32,
    pub linkage: Linkage,
    pub abireclaim: u32,
}

/// How an instruction participates in a trace.
enum Step {
    /// Straight-line, translated inline.
    Inline,
    /// Control transfer, translated as the tail.
    Transfer,
    /// Not translatable; the trace ends before it.
    Unsupported,
}

/// Decodes and translates a trace starting at `phys_pc`/`virt_pc`.
///
/// `page` holds the guest bytes from the start PC to the end of its physical
/// page. Returns `None` when nothing at all could be translated.
pub(crate) fn trace<E: Emitter>(
    page: &[u8],
    phys_pc: PhysAddr,
    virt_pc: u64,
    xlen: Xlen,
    max_instrs: usize,
) -> Option<TraceResult> {
    // decode pass: collect the straight line and the terminal
    let mut steps: Vec<(Instr, u64, u64)> = Vec::new(); // instr, pc, len
    let mut cursor = 0usize;
    let mut has_transfer = false;

    while steps.len() < max_instrs {
        let Some(word) = peek_word(page, cursor) else {
            break; // page boundary
        };
        let pc = virt_pc + cursor as u64;
        let decoded = decode::decode(word, xlen);
        if cursor + usize::from(decoded.len) > page.len() {
            break; // instruction straddles the page
        }
        match classify(decoded.instr) {
            Step::Inline => {
                steps.push((decoded.instr, pc, u64::from(decoded.len)));
                cursor += usize::from(decoded.len);
            }
            Step::Transfer => {
                steps.push((decoded.instr, pc, u64::from(decoded.len)));
                has_transfer = true;
                break;
            }
            Step::Unsupported => break,
        }
    }

    if steps.is_empty() {
        return None;
    }

    // emission pass
    let mut em = E::new(xlen);
    let mut ra = RegAlloc::new(E::POOL, E::CALLER_SAVED);
    em.emit_entry(virt_pc, steps.len() as u32);

    let body_end = if has_transfer { steps.len() - 1 } else { steps.len() };
    for &(instr, pc, _) in &steps[..body_end] {
        ra.begin_instr();
        translate(&mut em, &mut ra, instr, pc, xlen);
    }

    let mut links = SmallVec::new();
    let linkage = if has_transfer {
        let &(instr, pc, len) = steps.last().expect("transfer step exists");
        ra.begin_instr();
        translate_tail(&mut em, &mut ra, &mut links, instr, pc, len, virt_pc, phys_pc, xlen)
    } else {
        // ran off the page, hit the size cap, or stopped before an
        // uncompilable instruction: plain exit to wherever we stopped
        let resume = xlen.canonicalize(virt_pc + cursor as u64);
        ra.writeback_all(&mut em);
        em.emit_teardown();
        em.emit_store_pc_imm(resume);
        em.emit_ret();
        Linkage::None
    };

    debug_assert!(!ra.any_dirty(), "dirty register mapping after writeback");

    Some(TraceResult {
        buf: em.into_buf(),
        links,
        instr_count: steps.len() as u32,
        linkage,
        abireclaim: ra.abireclaim(),
    })
}

fn peek_word(page: &[u8], cursor: usize) -> Option<u32> {
    let rest = &page[cursor.min(page.len())..];
    match rest {
        [a, b, c, d, ..] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
        [a, b, ..] => Some(u32::from(u16::from_le_bytes([*a, *b]))),
        _ => None,
    }
}

fn classify(instr: Instr) -> Step {
    match instr {
        Instr::Lui { .. }
        | Instr::Auipc { .. }
        | Instr::OpImm { .. }
        | Instr::OpImmW { .. }
        | Instr::Op { .. }
        | Instr::OpW { .. }
        | Instr::Load { .. }
        | Instr::Store { .. } => Step::Inline,
        Instr::Branch { .. } | Instr::Jal { .. } | Instr::Jalr { .. } => Step::Transfer,
        _ => Step::Unsupported,
    }
}

#[allow(clippy::too_many_lines, reason = "flat instruction dispatch")]
fn translate<E: Emitter>(em: &mut E, ra: &mut RegAlloc, instr: Instr, pc: u64, xlen: Xlen) {
    match instr {
        Instr::Lui { rd, imm } => {
            if rd != 0 {
                ra.set_const(rd, xlen.canonicalize(imm as u64));
            }
        }
        Instr::Auipc { rd, imm } => {
            // the carried PC-relative constant; folds into later adds
            if rd != 0 {
                ra.set_const(rd, xlen.canonicalize(pc.wrapping_add(imm as u64)));
            }
        }
        Instr::OpImm { op, rd, rs1, imm } => {
            if rd == 0 {
                return;
            }
            if rs1 == 0 {
                ra.set_const(rd, interp::alu(op, 0, imm as u64, xlen));
            } else if let Some(value) = ra.const_of(rs1) {
                ra.set_const(rd, interp::alu(op, value, imm as u64, xlen));
            } else {
                let a = ra.read(em, rs1);
                let dst = ra.write(em, rd);
                em.emit_alu_imm(op, false, dst, a, imm);
            }
        }
        Instr::OpImmW { op, rd, rs1, imm } => {
            if rd == 0 {
                return;
            }
            if rs1 == 0 {
                ra.set_const(rd, interp::alu_w(op, 0, imm as u64));
            } else if let Some(value) = ra.const_of(rs1) {
                ra.set_const(rd, interp::alu_w(op, value, imm as u64));
            } else {
                let a = ra.read(em, rs1);
                let dst = ra.write(em, rd);
                em.emit_alu_imm(op, true, dst, a, imm);
            }
        }
        Instr::Op { op, rd, rs1, rs2 } => {
            if rd == 0 {
                return;
            }
            match (fold_src(ra, rs1), fold_src(ra, rs2)) {
                (Some(a), Some(b)) => ra.set_const(rd, interp::alu(op, a, b, xlen)),
                _ => {
                    let a = read_src(em, ra, rs1);
                    let b = read_src(em, ra, rs2);
                    let dst = ra.write(em, rd);
                    em.emit_alu(op, false, dst, a, b);
                }
            }
        }
        Instr::OpW { op, rd, rs1, rs2 } => {
            if rd == 0 {
                return;
            }
            match (fold_src(ra, rs1), fold_src(ra, rs2)) {
                (Some(a), Some(b)) => ra.set_const(rd, interp::alu_w(op, a, b)),
                _ => {
                    let a = read_src(em, ra, rs1);
                    let b = read_src(em, ra, rs2);
                    let dst = ra.write(em, rd);
                    em.emit_alu(op, true, dst, a, b);
                }
            }
        }
        Instr::Load { width, signed, rd, rs1, offset } => {
            let addr = address_operand(em, ra, rs1, offset, xlen);
            ra.writeback_all(em);
            em.emit_store_pc_imm(pc);
            em.emit_call_load(load_helper(width, signed), addr);
            em.emit_trap_check();
            ra.drop_caller_saved::<E>();
            if rd != 0 {
                let dst = ra.write(em, rd);
                em.emit_move_ret(dst);
            }
        }
        Instr::Store { width, rs1, rs2, offset } => {
            let addr = address_operand(em, ra, rs1, offset, xlen);
            let value = read_src(em, ra, rs2);
            ra.writeback_all(em);
            em.emit_store_pc_imm(pc);
            em.emit_call_store(store_helper(width), addr, value);
            em.emit_trap_check();
            ra.drop_caller_saved::<E>();
        }
        _ => unreachable!("non-inline instruction in trace body"),
    }
}

fn translate_tail<E: Emitter>(
    em: &mut E,
    ra: &mut RegAlloc,
    links: &mut SmallVec<[LinkSite; 2]>,
    instr: Instr,
    pc: u64,
    len: u64,
    block_virt: u64,
    block_phys: PhysAddr,
    xlen: Xlen,
) -> Linkage {
    // a same-page target's physical address is known at compile time; only
    // those are linkable
    let page_phys = block_phys.align_down_page().get();
    let target_phys = |virt: u64| -> Option<u64> {
        (virt >> crate::PAGE_SHIFT == block_virt >> crate::PAGE_SHIFT)
            .then(|| page_phys + (virt & (crate::PAGE_SIZE as u64 - 1)))
    };

    match instr {
        Instr::Branch { cond, rs1, rs2, offset } => {
            let a = read_src(em, ra, rs1);
            let b = read_src(em, ra, rs2);
            ra.writeback_all(em);
            em.emit_teardown();
            em.emit_cond_skip(cond, a, b, E::SLOT_SIZE);
            let taken = xlen.canonicalize(pc.wrapping_add(offset as u64));
            let fall = xlen.canonicalize(pc.wrapping_add(len));
            let taken_off = em.emit_exit_slot(taken);
            let fall_off = em.emit_exit_slot(fall);
            if E::NATIVE_LINKER {
                if let Some(target) = target_phys(taken) {
                    links.push(LinkSite { offset: taken_off as u32, target });
                }
                if let Some(target) = target_phys(fall) {
                    links.push(LinkSite { offset: fall_off as u32, target });
                }
            }
            Linkage::Tail
        }
        Instr::Jal { rd, offset } => {
            if rd != 0 {
                ra.set_const(rd, xlen.canonicalize(pc.wrapping_add(len)));
            }
            ra.writeback_all(em);
            em.emit_teardown();
            let target = xlen.canonicalize(pc.wrapping_add(offset as u64));
            let slot = em.emit_exit_slot(target);
            if E::NATIVE_LINKER {
                if let Some(target) = target_phys(target) {
                    links.push(LinkSite { offset: slot as u32, target });
                }
            }
            Linkage::Jmp
        }
        Instr::Jalr { rd, rs1, offset } => {
            let target = ra.temp(em);
            if rs1 == 0 {
                em.emit_imm(target, offset as u64 & !1);
            } else {
                let a = ra.read(em, rs1);
                em.emit_alu_imm(AluOp::Add, false, target, a, offset);
                em.emit_alu_imm(AluOp::And, false, target, target, -2);
            }
            if rd != 0 {
                ra.set_const(rd, xlen.canonicalize(pc.wrapping_add(len)));
            }
            ra.writeback_all(em);
            em.emit_teardown();
            em.emit_store_pc_reg(target);
            em.emit_ret();
            Linkage::None
        }
        _ => unreachable!("non-transfer instruction in trace tail"),
    }
}

/// Operand read that tolerates `x0` and materializes carried constants.
fn read_src<E: Emitter>(em: &mut E, ra: &mut RegAlloc, reg: u8) -> u8 {
    if reg == 0 { ra.read_zero(em) } else { ra.read(em, reg) }
}

fn fold_src(ra: &RegAlloc, reg: u8) -> Option<u64> {
    if reg == 0 { Some(0) } else { ra.const_of(reg) }
}

/// The effective-address operand of a load/store, with base constants
/// folded.
fn address_operand<E: Emitter>(
    em: &mut E,
    ra: &mut RegAlloc,
    rs1: u8,
    offset: i64,
    xlen: Xlen,
) -> u8 {
    match fold_src(ra, rs1) {
        Some(base) => {
            let addr = ra.temp(em);
            em.emit_imm(addr, xlen.canonicalize(base.wrapping_add(offset as u64)));
            addr
        }
        None => {
            let base = ra.read(em, rs1);
            if offset == 0 {
                base
            } else {
                let addr = ra.temp(em);
                em.emit_alu_imm(AluOp::Add, false, addr, base, offset);
                addr
            }
        }
    }
}

#[cfg(target_pointer_width = "64")]
fn load_helper(width: MemWidth, signed: bool) -> usize {
    match (width, signed) {
        (MemWidth::B, false) => helpers::load_u8 as usize,
        (MemWidth::B, true) => helpers::load_i8 as usize,
        (MemWidth::H, false) => helpers::load_u16 as usize,
        (MemWidth::H, true) => helpers::load_i16 as usize,
        (MemWidth::W, false) => helpers::load_u32 as usize,
        (MemWidth::W, true) => helpers::load_i32 as usize,
        (MemWidth::D, _) => helpers::load_u64 as usize,
    }
}

#[cfg(target_pointer_width = "64")]
fn store_helper(width: MemWidth) -> usize {
    match width {
        MemWidth::B => helpers::store_u8 as usize,
        MemWidth::H => helpers::store_u16 as usize,
        MemWidth::W => helpers::store_u32 as usize,
        MemWidth::D => helpers::store_u64 as usize,
    }
}

// the 32-bit backends only translate RV32 guests, so the doubleword and
// load-word-unsigned forms cannot reach them
#[cfg(target_pointer_width = "32")]
fn load_helper(width: MemWidth, signed: bool) -> usize {
    match (width, signed) {
        (MemWidth::B, false) => helpers::narrow::load_u8 as usize,
        (MemWidth::B, true) => helpers::narrow::load_i8 as usize,
        (MemWidth::H, false) => helpers::narrow::load_u16 as usize,
        (MemWidth::H, true) => helpers::narrow::load_i16 as usize,
        (MemWidth::W, true) => helpers::narrow::load_i32 as usize,
        _ => unreachable!("rv64-only load on a 32-bit host"),
    }
}

#[cfg(target_pointer_width = "32")]
fn store_helper(width: MemWidth) -> usize {
    match width {
        MemWidth::B => helpers::narrow::store_u8 as usize,
        MemWidth::H => helpers::narrow::store_u16 as usize,
        MemWidth::W => helpers::narrow::store_u32 as usize,
        MemWidth::D => unreachable!("rv64-only store on a 32-bit host"),
    }
}
