// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AArch64 (AAPCS64) backend.
//!
//! Register plan: `x19` pins the hart pointer; `x8`, `x16` and `x17` are
//! backend scratch; `x9`-`x15` (caller-saved) and `x20`-`x28` (callee-saved)
//! form the pool. Every instruction is a 32-bit word, which keeps the slot
//! and patch arithmetic trivial; `b imm26` reaches ±128 MiB, more than any
//! configurable heap.

use kestrel_riscv::Xlen;
use kestrel_riscv::decode::{AluOp, BranchCond};

use super::{CodeBuf, Emitter, HostReg};
use crate::jit::layout;

const HART: u8 = 19;
const SCRATCH: u8 = 8;
const SCRATCH2: u8 = 16;
const ZR: u8 = 31;

pub(crate) struct A64Emitter {
    buf: CodeBuf,
    narrow_guest: bool,
}

impl A64Emitter {
    #[inline]
    fn ins(&mut self, word: u32) {
        self.buf.push_u32(word);
    }

    /// `movz`/`movk` chain.
    fn mov_imm(&mut self, rd: u8, imm: u64) {
        self.ins(0xD280_0000 | ((imm & 0xffff) as u32) << 5 | u32::from(rd));
        for hw in 1..4u32 {
            let part = (imm >> (16 * hw)) & 0xffff;
            if part != 0 {
                self.ins(0xF280_0000 | hw << 21 | (part as u32) << 5 | u32::from(rd));
            }
        }
    }

    /// Fixed-length four-instruction immediate, for patchable slots.
    fn mov_imm_fixed(&mut self, rd: u8, imm: u64) {
        self.ins(0xD280_0000 | ((imm & 0xffff) as u32) << 5 | u32::from(rd));
        for hw in 1..4u32 {
            let part = (imm >> (16 * hw)) & 0xffff;
            self.ins(0xF280_0000 | hw << 21 | (part as u32) << 5 | u32::from(rd));
        }
    }

    fn mov_rr(&mut self, rd: u8, rm: u8) {
        if rd != rm {
            // orr rd, xzr, rm
            self.ins(0xAA00_03E0 | u32::from(rm) << 16 | u32::from(rd));
        }
    }

    /// `ldr rt, [x19, #off]`, 64-bit, `off` must be 8-aligned.
    fn ldr(&mut self, rt: u8, off: i32) {
        debug_assert!(off >= 0 && off % 8 == 0);
        self.ins(0xF940_0000 | (off as u32 / 8) << 10 | u32::from(HART) << 5 | u32::from(rt));
    }

    fn str(&mut self, rt: u8, off: i32) {
        debug_assert!(off >= 0 && off % 8 == 0);
        self.ins(0xF900_0000 | (off as u32 / 8) << 10 | u32::from(HART) << 5 | u32::from(rt));
    }

    /// `ldr wt, [rn, #off]`, 32-bit.
    fn ldr32(&mut self, rt: u8, rn: u8, off: i32) {
        debug_assert!(off >= 0 && off % 4 == 0);
        self.ins(0xB940_0000 | (off as u32 / 4) << 10 | u32::from(rn) << 5 | u32::from(rt));
    }

    /// Three-register data op, `base` already encodes size and opcode.
    fn rrr(&mut self, base: u32, rd: u8, rn: u8, rm: u8) {
        self.ins(base | u32::from(rm) << 16 | u32::from(rn) << 5 | u32::from(rd));
    }

    /// `sxtw rd, rn`
    fn sxtw(&mut self, rd: u8, rn: u8) {
        self.ins(0x9340_7C00 | u32::from(rn) << 5 | u32::from(rd));
    }

    /// `cmp rn, rm` (64-bit)
    fn cmp(&mut self, rn: u8, rm: u8) {
        self.ins(0xEB00_001F | u32::from(rm) << 16 | u32::from(rn) << 5);
    }

    /// `stp a, b, [sp, #-16]!`
    fn push_pair(&mut self, a: u8, b: u8) {
        self.ins(0xA9BF_0000 | u32::from(b) << 10 | 31 << 5 | u32::from(a));
    }

    /// `ldp a, b, [sp], #16`
    fn pop_pair(&mut self, a: u8, b: u8) {
        self.ins(0xA8C1_0000 | u32::from(b) << 10 | 31 << 5 | u32::from(a));
    }

    fn ret(&mut self) {
        self.ins(0xD65F_03C0);
    }

    /// `cbz wt, #insns`
    fn cbz32(&mut self, rt: u8, insns: u32) {
        self.ins(0x3400_0000 | (insns & 0x7ffff) << 5 | u32::from(rt));
    }

    #[inline]
    fn wide(&self, narrow: bool) -> bool {
        !(narrow || self.narrow_guest)
    }

    fn alu_scratch_imm(&mut self, imm: i64) -> u8 {
        self.mov_imm(SCRATCH2, imm as u64);
        SCRATCH2
    }
}

fn inverse_cond(cond: BranchCond) -> u32 {
    match cond {
        BranchCond::Eq => 0x1,  // ne
        BranchCond::Ne => 0x0,  // eq
        BranchCond::Lt => 0xA,  // ge
        BranchCond::Ge => 0xB,  // lt
        BranchCond::Ltu => 0x2, // hs
        BranchCond::Geu => 0x3, // lo
    }
}

impl Emitter for A64Emitter {
    // x9-x15 and x20-x28
    const POOL: u32 = 0b0111_1111 << 9 | 0b1_1111_1111 << 20;
    const CALLER_SAVED: u32 = 0b0111_1111 << 9;
    const NATIVE_LINKER: bool = true;
    const SLOT_SIZE: usize = 24;

    fn new(xlen: Xlen) -> Self {
        Self { buf: CodeBuf::new(), narrow_guest: xlen == Xlen::Rv32 }
    }

    fn supports(_xlen: Xlen) -> bool {
        true
    }

    fn buf(&self) -> &CodeBuf {
        &self.buf
    }

    fn into_buf(self) -> CodeBuf {
        self.buf
    }

    fn offset(&self) -> usize {
        self.buf.len()
    }

    fn emit_entry(&mut self, guest_pc: u64, instr_count: u32) {
        self.push_pair(29, 30);
        self.ldr(SCRATCH, layout::EXIT_REQ_PTR as i32);
        self.ldr32(SCRATCH, SCRATCH, 0);
        // over the exit path: 4 imm + 1 str + 1 ldp + 1 ret
        self.cbz32(SCRATCH, 8);
        self.mov_imm_fixed(SCRATCH, guest_pc);
        self.str(SCRATCH, layout::PC as i32);
        self.pop_pair(29, 30);
        self.ret();
        // retire counter
        self.ldr(SCRATCH, layout::JIT_INSTRET as i32);
        // add x8, x8, #count
        self.ins(0x9100_0000 | (instr_count & 0xfff) << 10 | u32::from(SCRATCH) << 5 | u32::from(SCRATCH));
        self.str(SCRATCH, layout::JIT_INSTRET as i32);
    }

    fn emit_get(&mut self, dst: HostReg, guest: u8) {
        self.ldr(dst, layout::reg_offset(guest));
    }

    fn emit_put(&mut self, src: HostReg, guest: u8) {
        self.str(src, layout::reg_offset(guest));
    }

    fn emit_put_imm(&mut self, guest: u8, imm: u64) {
        self.mov_imm(SCRATCH, imm);
        self.str(SCRATCH, layout::reg_offset(guest));
    }

    fn emit_imm(&mut self, dst: HostReg, imm: u64) {
        self.mov_imm(dst, imm);
    }

    fn emit_mov(&mut self, dst: HostReg, src: HostReg) {
        self.mov_rr(dst, src);
    }

    fn emit_alu(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, b: HostReg) {
        let wide = self.wide(narrow);
        let sf = if wide { 1u32 << 31 } else { 0 };
        match op {
            AluOp::Add => self.rrr(0x0B00_0000 | sf, dst, a, b),
            AluOp::Sub => self.rrr(0x4B00_0000 | sf, dst, a, b),
            AluOp::And => self.rrr(0x0A00_0000 | sf, dst, a, b),
            AluOp::Or => self.rrr(0x2A00_0000 | sf, dst, a, b),
            AluOp::Xor => self.rrr(0x4A00_0000 | sf, dst, a, b),
            AluOp::Sll => self.rrr(0x1AC0_2000 | sf, dst, a, b),
            AluOp::Srl => self.rrr(0x1AC0_2400 | sf, dst, a, b),
            AluOp::Sra => self.rrr(0x1AC0_2800 | sf, dst, a, b),
            AluOp::Slt | AluOp::Sltu => {
                // canonical values make the 64-bit compare exact either way
                self.cmp(a, b);
                let cond = if op == AluOp::Slt { 0xB } else { 0x3 }; // lt / lo
                // cset dst, cond  (csinc dst, xzr, xzr, !cond)
                self.ins(0x9A9F_07E0 | (cond ^ 1) << 12 | u32::from(dst));
            }
            AluOp::Mul => self.rrr(0x1B00_7C00 | sf, dst, a, b),
            AluOp::Mulh | AluOp::Mulhu | AluOp::Mulhsu => {
                if wide {
                    if op == AluOp::Mulh {
                        self.rrr(0x9B40_7C00, dst, a, b); // smulh
                    } else {
                        self.rrr(0x9BC0_7C00, dst, a, b); // umulh
                        if op == AluOp::Mulhsu {
                            // subtract b where a is negative
                            self.ins(0x9347_FC00 | u32::from(a) << 5 | u32::from(SCRATCH)); // asr x8, a, #63
                            self.rrr(0x8A00_0000, SCRATCH, SCRATCH, b); // and
                            self.rrr(0xCB00_0000, dst, dst, SCRATCH); // sub
                        }
                    }
                } else {
                    // 32-bit high halves via a full 64-bit product
                    match op {
                        AluOp::Mulh => {
                            self.sxtw(SCRATCH, a);
                            self.sxtw(SCRATCH2, b);
                        }
                        AluOp::Mulhu => {
                            self.rrr(0x2A00_03E0, SCRATCH, ZR, a); // mov w8, wa
                            self.rrr(0x2A00_03E0, SCRATCH2, ZR, b);
                        }
                        _ => {
                            self.sxtw(SCRATCH, a);
                            self.rrr(0x2A00_03E0, SCRATCH2, ZR, b);
                        }
                    }
                    self.rrr(0x9B00_7C00, dst, SCRATCH, SCRATCH2); // mul
                    // asr dst, dst, #32
                    self.ins(0x9360_FC00 | u32::from(dst) << 5 | u32::from(dst));
                }
            }
            AluOp::Div | AluOp::Divu => {
                let opc = if op == AluOp::Div { 0x1AC0_0C00 } else { 0x1AC0_0800 };
                self.rrr(opc | sf, SCRATCH, a, b);
                // hardware yields 0 for x/0; the ISA wants all ones
                self.cmp(b, ZR);
                // csinv dst, x8, xzr, ne
                self.ins(
                    0xDA80_0000
                        | u32::from(ZR) << 16
                        | 0x1 << 12
                        | u32::from(SCRATCH) << 5
                        | u32::from(dst),
                );
            }
            AluOp::Rem | AluOp::Remu => {
                let opc = if op == AluOp::Rem { 0x1AC0_0C00 } else { 0x1AC0_0800 };
                self.rrr(opc | sf, SCRATCH, a, b);
                // msub dst, x8, b, a: a - quot*b; quot is 0 for b == 0, so
                // the b == 0 case falls out as the dividend
                self.ins(
                    (0x1B00_8000 | sf)
                        | u32::from(b) << 16
                        | u32::from(a) << 10
                        | u32::from(SCRATCH) << 5
                        | u32::from(dst),
                );
            }
        }
        if !wide && !matches!(op, AluOp::Slt | AluOp::Sltu | AluOp::Mulh | AluOp::Mulhu | AluOp::Mulhsu) {
            self.sxtw(dst, dst);
        }
    }

    fn emit_alu_imm(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, imm: i64) {
        let wide = self.wide(narrow);
        let sf = if wide { 1u32 << 31 } else { 0 };
        match op {
            AluOp::Add if (0..4096).contains(&imm) => {
                self.ins(
                    (0x1100_0000 | sf)
                        | (imm as u32) << 10
                        | u32::from(a) << 5
                        | u32::from(dst),
                );
                if !wide {
                    self.sxtw(dst, dst);
                }
            }
            AluOp::Add if (-4095..0).contains(&imm) => {
                self.ins(
                    (0x5100_0000 | sf)
                        | (-imm as u32) << 10
                        | u32::from(a) << 5
                        | u32::from(dst),
                );
                if !wide {
                    self.sxtw(dst, dst);
                }
            }
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                let bits = if wide { 64 } else { 32 };
                let shift = (imm as u32) & (bits - 1);
                match op {
                    // lsl via ubfm
                    AluOp::Sll => {
                        if wide {
                            let immr = (64 - shift) & 63;
                            let imms = 63 - shift;
                            self.ins(0xD340_0000 | immr << 16 | imms << 10 | u32::from(a) << 5 | u32::from(dst));
                        } else {
                            let immr = (32 - shift) & 31;
                            let imms = 31 - shift;
                            self.ins(0x5300_0000 | immr << 16 | imms << 10 | u32::from(a) << 5 | u32::from(dst));
                        }
                    }
                    AluOp::Srl => {
                        if wide {
                            self.ins(0xD340_FC00 | shift << 16 | u32::from(a) << 5 | u32::from(dst));
                        } else {
                            self.ins(0x5300_7C00 | shift << 16 | u32::from(a) << 5 | u32::from(dst));
                        }
                    }
                    _ => {
                        if wide {
                            self.ins(0x9340_FC00 | shift << 16 | u32::from(a) << 5 | u32::from(dst));
                        } else {
                            self.ins(0x1300_7C00 | shift << 16 | u32::from(a) << 5 | u32::from(dst));
                        }
                    }
                }
                if !wide {
                    self.sxtw(dst, dst);
                }
            }
            _ => {
                // materialize and fall back to the register form
                let scratch = self.alu_scratch_imm(imm);
                self.emit_alu(op, narrow, dst, a, scratch);
            }
        }
    }

    fn emit_store_pc_imm(&mut self, pc: u64) {
        self.mov_imm(SCRATCH, pc);
        self.str(SCRATCH, layout::PC as i32);
    }

    fn emit_store_pc_reg(&mut self, src: HostReg) {
        self.str(src, layout::PC as i32);
    }

    fn emit_call_load(&mut self, helper: usize, addr: HostReg) {
        self.mov_rr(1, addr);
        self.mov_rr(0, HART);
        self.mov_imm(SCRATCH2, helper as u64);
        self.ins(0xD63F_0000 | u32::from(SCRATCH2) << 5); // blr x16
    }

    fn emit_call_store(&mut self, helper: usize, addr: HostReg, value: HostReg) {
        self.mov_rr(2, value);
        self.mov_rr(1, addr);
        self.mov_rr(0, HART);
        self.mov_imm(SCRATCH2, helper as u64);
        self.ins(0xD63F_0000 | u32::from(SCRATCH2) << 5);
    }

    fn emit_move_ret(&mut self, dst: HostReg) {
        self.mov_rr(dst, 0);
    }

    fn emit_trap_check(&mut self) {
        self.ldr32(SCRATCH, HART, layout::TRAP_PENDING as i32);
        // over the ldp + ret
        self.cbz32(SCRATCH, 3);
        self.pop_pair(29, 30);
        self.ret();
    }

    fn emit_teardown(&mut self) {
        self.pop_pair(29, 30);
    }

    fn emit_ret(&mut self) {
        self.ret();
    }

    fn emit_exit_slot(&mut self, target_pc: u64) -> usize {
        let at = self.buf.len();
        self.mov_imm_fixed(SCRATCH, target_pc);
        self.str(SCRATCH, layout::PC as i32);
        self.ret();
        debug_assert_eq!(self.buf.len() - at, Self::SLOT_SIZE);
        at
    }

    fn emit_cond_skip(&mut self, cond: BranchCond, a: HostReg, b: HostReg, skip: usize) {
        self.cmp(a, b);
        // target is the instruction after the slot
        let insns = (skip as u32 / 4) + 1;
        self.ins(0x5400_0000 | (insns & 0x7ffff) << 5 | inverse_cond(cond));
    }

    unsafe fn patch_jump(slot_rw: *mut u8, slot_rx: usize, target_rx: usize) {
        let offset = (target_rx as i64 - slot_rx as i64) / 4;
        let insn = 0x1400_0000u32 | (offset as u32 & 0x03ff_ffff);
        // Safety: caller guarantees SLOT_SIZE writable bytes; a single
        // aligned word store
        unsafe {
            slot_rw.cast::<u32>().write(insn.to_le());
        }
    }

    fn emit_trampoline(buf: &mut CodeBuf) {
        let mut em = Self { buf: CodeBuf::new(), narrow_guest: false };
        em.push_pair(29, 30);
        em.push_pair(19, 20);
        em.push_pair(21, 22);
        em.push_pair(23, 24);
        em.push_pair(25, 26);
        em.push_pair(27, 28);
        em.mov_rr(HART, 1);
        em.ins(0xD63F_0000); // blr x0
        em.pop_pair(27, 28);
        em.pop_pair(25, 26);
        em.pop_pair(23, 24);
        em.pop_pair(21, 22);
        em.pop_pair(19, 20);
        em.pop_pair(29, 30);
        em.ret();
        for &byte in em.buf.as_slice() {
            buf.push_u8(byte);
        }
    }
}
