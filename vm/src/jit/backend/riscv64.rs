// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RISC-V 64 host backend: guest RISC-V translated to host RISC-V.
//!
//! The pleasant case: guest ALU semantics map one-to-one onto host
//! instructions, including the M extension's division rules, so no fixups
//! are needed anywhere. `s1` pins the hart pointer; `t0`-`t2` are scratch;
//! `a2`-`a7` and `s2`-`s11` form the pool. Patched links use an
//! `auipc`+`jalr` pair for ±2 GiB of reach.

use kestrel_riscv::Xlen;
use kestrel_riscv::decode::{AluOp, BranchCond};

use super::{CodeBuf, Emitter, HostReg};
use crate::jit::layout;

const RA: u8 = 1;
const SP: u8 = 2;
const T0: u8 = 5;
const T1: u8 = 6;
const HART: u8 = 9; // s1
const A0: u8 = 10;
const A1: u8 = 11;
const A2: u8 = 12;

pub(crate) struct Rv64Emitter {
    buf: CodeBuf,
    narrow_guest: bool,
}

impl Rv64Emitter {
    #[inline]
    fn ins(&mut self, word: u32) {
        self.buf.push_u32(word);
    }

    fn r_type(&mut self, funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u32) {
        self.ins(
            funct7 << 25
                | u32::from(rs2) << 20
                | u32::from(rs1) << 15
                | funct3 << 12
                | u32::from(rd) << 7
                | opcode,
        );
    }

    fn i_type(&mut self, imm: i32, rs1: u8, funct3: u32, rd: u8, opcode: u32) {
        debug_assert!((-2048..2048).contains(&imm));
        self.ins(
            (imm as u32 & 0xfff) << 20
                | u32::from(rs1) << 15
                | funct3 << 12
                | u32::from(rd) << 7
                | opcode,
        );
    }

    fn s_type(&mut self, imm: i32, rs2: u8, rs1: u8, funct3: u32) {
        debug_assert!((-2048..2048).contains(&imm));
        let imm = imm as u32 & 0xfff;
        self.ins(
            (imm >> 5) << 25
                | u32::from(rs2) << 20
                | u32::from(rs1) << 15
                | funct3 << 12
                | (imm & 0x1f) << 7
                | 0b010_0011,
        );
    }

    /// Conditional branch with a byte offset relative to this instruction.
    fn b_type(&mut self, funct3: u32, rs1: u8, rs2: u8, offset: i32) {
        let imm = offset as u32;
        self.ins(
            (imm >> 12 & 1) << 31
                | (imm >> 5 & 0x3f) << 25
                | u32::from(rs2) << 20
                | u32::from(rs1) << 15
                | funct3 << 12
                | (imm >> 1 & 0xf) << 8
                | (imm >> 11 & 1) << 7
                | 0b110_0011,
        );
    }

    fn addi(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.i_type(imm, rs1, 0b000, rd, 0b001_0011);
    }

    fn mv(&mut self, rd: u8, rs1: u8) {
        if rd != rs1 {
            self.addi(rd, rs1, 0);
        }
    }

    fn ld(&mut self, rd: u8, rs1: u8, off: i32) {
        self.i_type(off, rs1, 0b011, rd, 0b000_0011);
    }

    fn lw(&mut self, rd: u8, rs1: u8, off: i32) {
        self.i_type(off, rs1, 0b010, rd, 0b000_0011);
    }

    fn sd(&mut self, rs2: u8, rs1: u8, off: i32) {
        self.s_type(off, rs2, rs1, 0b011);
    }

    /// `jalr rd, 0(rs1)`
    fn jalr(&mut self, rd: u8, rs1: u8) {
        self.i_type(0, rs1, 0b000, rd, 0b110_0111);
    }

    fn ret(&mut self) {
        self.jalr(0, RA);
    }

    /// Shortest-form constant materialization.
    fn li(&mut self, rd: u8, imm: u64) {
        let value = imm as i64;
        if (-2048..2048).contains(&value) {
            self.addi(rd, 0, value as i32);
        } else if value == i64::from(value as i32) {
            // lui + addiw
            let hi = ((value as i32 as u32).wrapping_add(0x800)) & 0xffff_f000;
            self.ins(hi | u32::from(rd) << 7 | 0b011_0111);
            let lo = (value as i32).wrapping_sub(hi as i32);
            self.i_type(lo, rd, 0b000, rd, 0b001_1011); // addiw
        } else {
            self.li_fixed(rd, imm);
        }
    }

    /// Fixed-length materialization: a 9-bit head then five `slli`+`ori`
    /// 11-bit chunks. Eleven instructions, always.
    fn li_fixed(&mut self, rd: u8, imm: u64) {
        self.addi(rd, 0, ((imm >> 55) & 0x1ff) as i32);
        for chunk in (0..5).rev() {
            let part = ((imm >> (11 * chunk)) & 0x7ff) as i32;
            self.i_type(11, rd, 0b001, rd, 0b001_0011); // slli rd, rd, 11
            self.i_type(part, rd, 0b110, rd, 0b001_0011); // ori
        }
    }

    #[inline]
    fn narrow(&self, narrow: bool) -> bool {
        narrow || self.narrow_guest
    }
}

fn branch_funct3(cond: BranchCond) -> u32 {
    match cond {
        BranchCond::Eq => 0b000,
        BranchCond::Ne => 0b001,
        BranchCond::Lt => 0b100,
        BranchCond::Ge => 0b101,
        BranchCond::Ltu => 0b110,
        BranchCond::Geu => 0b111,
    }
}

/// Inverted condition, for skip-style branches.
fn inverse(cond: BranchCond) -> BranchCond {
    match cond {
        BranchCond::Eq => BranchCond::Ne,
        BranchCond::Ne => BranchCond::Eq,
        BranchCond::Lt => BranchCond::Ge,
        BranchCond::Ge => BranchCond::Lt,
        BranchCond::Ltu => BranchCond::Geu,
        BranchCond::Geu => BranchCond::Ltu,
    }
}

impl Emitter for Rv64Emitter {
    // a2-a7, s2-s11
    const POOL: u32 = 0b11_1111 << 12 | 0b11_1111_1111 << 18;
    const CALLER_SAVED: u32 = 0b11_1111 << 12;
    const NATIVE_LINKER: bool = true;
    const SLOT_SIZE: usize = 52;

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
        self.addi(SP, SP, -16);
        self.sd(RA, SP, 8);
        self.ld(T0, HART, layout::EXIT_REQ_PTR as i32);
        self.lw(T0, T0, 0);
        // over the exit path: 11 li + sd + ld + addi + jalr = 15 insns
        self.b_type(0b000, T0, 0, 16 * 4);
        self.li_fixed(T0, guest_pc);
        self.sd(T0, HART, layout::PC as i32);
        self.ld(RA, SP, 8);
        self.addi(SP, SP, 16);
        self.ret();
        // retire counter
        self.ld(T0, HART, layout::JIT_INSTRET as i32);
        self.addi(T0, T0, instr_count as i32);
        self.sd(T0, HART, layout::JIT_INSTRET as i32);
    }

    fn emit_get(&mut self, dst: HostReg, guest: u8) {
        self.ld(dst, HART, layout::reg_offset(guest));
    }

    fn emit_put(&mut self, src: HostReg, guest: u8) {
        self.sd(src, HART, layout::reg_offset(guest));
    }

    fn emit_put_imm(&mut self, guest: u8, imm: u64) {
        self.li(T0, imm);
        self.sd(T0, HART, layout::reg_offset(guest));
    }

    fn emit_imm(&mut self, dst: HostReg, imm: u64) {
        self.li(dst, imm);
    }

    fn emit_mov(&mut self, dst: HostReg, src: HostReg) {
        self.mv(dst, src);
    }

    fn emit_alu(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, b: HostReg) {
        let narrow = self.narrow(narrow);
        // (funct7, funct3) in the OP/OP-32 space
        let (funct7, funct3, has_w) = match op {
            AluOp::Add => (0b000_0000, 0b000, true),
            AluOp::Sub => (0b010_0000, 0b000, true),
            AluOp::Sll => (0b000_0000, 0b001, true),
            AluOp::Slt => (0b000_0000, 0b010, false),
            AluOp::Sltu => (0b000_0000, 0b011, false),
            AluOp::Xor => (0b000_0000, 0b100, false),
            AluOp::Srl => (0b000_0000, 0b101, true),
            AluOp::Sra => (0b010_0000, 0b101, true),
            AluOp::Or => (0b000_0000, 0b110, false),
            AluOp::And => (0b000_0000, 0b111, false),
            AluOp::Mul => (0b000_0001, 0b000, true),
            AluOp::Mulh | AluOp::Mulhsu | AluOp::Mulhu => {
                if narrow {
                    // widen to a 64-bit product, take the high word
                    match op {
                        AluOp::Mulh => {
                            self.mv(T0, a);
                            self.mv(T1, b);
                        }
                        AluOp::Mulhu => {
                            // zero-extend both
                            self.i_type(32, a, 0b001, T0, 0b001_0011);
                            self.i_type(32, T0, 0b101, T0, 0b001_0011);
                            self.i_type(32, b, 0b001, T1, 0b001_0011);
                            self.i_type(32, T1, 0b101, T1, 0b001_0011);
                        }
                        _ => {
                            self.mv(T0, a);
                            self.i_type(32, b, 0b001, T1, 0b001_0011);
                            self.i_type(32, T1, 0b101, T1, 0b001_0011);
                        }
                    }
                    self.r_type(0b000_0001, T1, T0, 0b000, dst, 0b011_0011); // mul
                    // srai dst, dst, 32
                    self.ins(
                        0b010_0000u32 << 25
                            | 32 << 20
                            | u32::from(dst) << 15
                            | 0b101 << 12
                            | u32::from(dst) << 7
                            | 0b001_0011,
                    );
                    return;
                }
                let funct3 = match op {
                    AluOp::Mulh => 0b001,
                    AluOp::Mulhsu => 0b010,
                    _ => 0b011,
                };
                self.r_type(0b000_0001, b, a, funct3, dst, 0b011_0011);
                return;
            }
            AluOp::Div => (0b000_0001, 0b100, true),
            AluOp::Divu => (0b000_0001, 0b101, true),
            AluOp::Rem => (0b000_0001, 0b110, true),
            AluOp::Remu => (0b000_0001, 0b111, true),
        };
        let opcode = if narrow && has_w { 0b011_1011 } else { 0b011_0011 };
        self.r_type(funct7, b, a, funct3, dst, opcode);
    }

    fn emit_alu_imm(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, imm: i64) {
        let narrow = self.narrow(narrow);
        let shamt_mask = if narrow { 0x1f } else { 0x3f };
        match op {
            AluOp::Add | AluOp::Slt | AluOp::Sltu | AluOp::Xor | AluOp::Or | AluOp::And
                if (-2048..2048).contains(&imm) =>
            {
                let funct3 = match op {
                    AluOp::Add => 0b000,
                    AluOp::Slt => 0b010,
                    AluOp::Sltu => 0b011,
                    AluOp::Xor => 0b100,
                    AluOp::Or => 0b110,
                    _ => 0b111,
                };
                let opcode = if narrow && op == AluOp::Add { 0b001_1011 } else { 0b001_0011 };
                self.i_type(imm as i32, a, funct3, dst, opcode);
            }
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                let shamt = (imm & shamt_mask) as u32;
                let funct7: u32 = if op == AluOp::Sra { 0b010_0000 } else { 0 };
                let funct3 = if op == AluOp::Sll { 0b001 } else { 0b101 };
                let opcode = if narrow { 0b001_1011 } else { 0b001_0011 };
                self.ins(
                    funct7 << 25
                        | shamt << 20
                        | u32::from(a) << 15
                        | funct3 << 12
                        | u32::from(dst) << 7
                        | opcode,
                );
            }
            AluOp::Sub if (-2047..=2048).contains(&imm) => {
                let opcode = if narrow { 0b001_1011 } else { 0b001_0011 };
                self.i_type(-imm as i32, a, 0b000, dst, opcode);
            }
            _ => {
                self.li(T1, imm as u64);
                self.emit_alu(op, narrow, dst, a, T1);
            }
        }
    }

    fn emit_store_pc_imm(&mut self, pc: u64) {
        self.li(T0, pc);
        self.sd(T0, HART, layout::PC as i32);
    }

    fn emit_store_pc_reg(&mut self, src: HostReg) {
        self.sd(src, HART, layout::PC as i32);
    }

    fn emit_call_load(&mut self, helper: usize, addr: HostReg) {
        self.mv(A1, addr);
        self.mv(A0, HART);
        self.li(T0, helper as u64);
        self.jalr(RA, T0);
    }

    fn emit_call_store(&mut self, helper: usize, addr: HostReg, value: HostReg) {
        self.mv(A2, value);
        self.mv(A1, addr);
        self.mv(A0, HART);
        self.li(T0, helper as u64);
        self.jalr(RA, T0);
    }

    fn emit_move_ret(&mut self, dst: HostReg) {
        self.mv(dst, A0);
    }

    fn emit_trap_check(&mut self) {
        self.lw(T0, HART, layout::TRAP_PENDING as i32);
        // over ld + addi + jalr
        self.b_type(0b000, T0, 0, 4 * 4);
        self.ld(RA, SP, 8);
        self.addi(SP, SP, 16);
        self.ret();
    }

    fn emit_teardown(&mut self) {
        self.ld(RA, SP, 8);
        self.addi(SP, SP, 16);
    }

    fn emit_ret(&mut self) {
        self.ret();
    }

    fn emit_exit_slot(&mut self, target_pc: u64) -> usize {
        let at = self.buf.len();
        self.li_fixed(T0, target_pc);
        self.sd(T0, HART, layout::PC as i32);
        self.ret();
        debug_assert_eq!(self.buf.len() - at, Self::SLOT_SIZE);
        at
    }

    fn emit_cond_skip(&mut self, cond: BranchCond, a: HostReg, b: HostReg, skip: usize) {
        self.b_type(branch_funct3(inverse(cond)), a, b, skip as i32 + 4);
    }

    unsafe fn patch_jump(slot_rw: *mut u8, slot_rx: usize, target_rx: usize) {
        let offset = target_rx as i64 - slot_rx as i64;
        let hi = ((offset as u32).wrapping_add(0x800)) & 0xffff_f000;
        let lo = (offset as i32).wrapping_sub(hi as i32);
        // auipc t0, hi ; jalr x0, lo(t0)
        let auipc = hi | u32::from(T0) << 7 | 0b001_0111;
        let jalr = (lo as u32 & 0xfff) << 20 | u32::from(T0) << 15 | 0b110_0111;
        // Safety: caller guarantees SLOT_SIZE writable bytes
        unsafe {
            let p = slot_rw.cast::<u32>();
            p.write(auipc.to_le());
            p.add(1).write(jalr.to_le());
        }
    }

    fn emit_trampoline(buf: &mut CodeBuf) {
        let mut em = Self { buf: CodeBuf::new(), narrow_guest: false };
        em.addi(SP, SP, -112);
        em.sd(RA, SP, 0);
        em.sd(HART, SP, 8);
        for (i, s) in (18..28).enumerate() {
            em.sd(s, SP, 16 + 8 * i as i32);
        }
        em.mv(HART, A1);
        em.jalr(RA, A0);
        em.ld(RA, SP, 0);
        em.ld(HART, SP, 8);
        for (i, s) in (18..28).enumerate() {
            em.ld(s, SP, 16 + 8 * i as i32);
        }
        em.addi(SP, SP, 112);
        em.ret();
        for &byte in em.buf.as_slice() {
            buf.push_u8(byte);
        }
    }
}
