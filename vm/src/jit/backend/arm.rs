// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ARMv7-A (AAPCS) backend. RV32 guests only; requires the `sdiv`/`udiv` of
//! the virtualization-era cores this engine would actually run on.
//!
//! `r4` pins the hart pointer; `r0`-`r3` and `r12` are scratch; `r5`-`r8`
//! form the pool. Guest registers store canonical sign-extended doublewords,
//! so a register write is a low-word store plus a sign-word store. No
//! native linker: the patchable `b` only reaches ±32 MiB, less than a
//! default heap, so exits always return to the dispatcher.

use kestrel_riscv::Xlen;
use kestrel_riscv::decode::{AluOp, BranchCond};

use super::{CodeBuf, Emitter, HostReg};
use crate::jit::layout;

const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const HART: u8 = 4;
const R11: u8 = 11;
const SCRATCH: u8 = 12;
const LR: u8 = 14;

/// Condition field: always.
const AL: u32 = 0xE << 28;

pub(crate) struct A32Emitter {
    buf: CodeBuf,
}

impl A32Emitter {
    #[inline]
    fn ins(&mut self, word: u32) {
        self.buf.push_u32(word);
    }

    /// `movw` (low 16) + `movt` (high 16)
    fn mov_imm(&mut self, rd: u8, imm: u32) {
        let lo = imm & 0xffff;
        self.ins(AL | 0x0300_0000 | (lo >> 12) << 16 | u32::from(rd) << 12 | (lo & 0xfff));
        let hi = imm >> 16;
        self.ins(AL | 0x0340_0000 | (hi >> 12) << 16 | u32::from(rd) << 12 | (hi & 0xfff));
    }

    fn mov_rr(&mut self, rd: u8, rm: u8) {
        if rd != rm {
            self.ins(AL | 0x01A0_0000 | u32::from(rd) << 12 | u32::from(rm));
        }
    }

    /// `ldr rt, [r4, #off]`
    fn ldr(&mut self, rt: u8, rn: u8, off: i32) {
        debug_assert!((0..4096).contains(&off));
        self.ins(AL | 0x0590_0000 | u32::from(rn) << 16 | u32::from(rt) << 12 | off as u32);
    }

    fn str(&mut self, rt: u8, rn: u8, off: i32) {
        debug_assert!((0..4096).contains(&off));
        self.ins(AL | 0x0580_0000 | u32::from(rn) << 16 | u32::from(rt) << 12 | off as u32);
    }

    /// Data-processing register form; `opcode` is the 4-bit DP opcode.
    fn dp(&mut self, opcode: u32, rd: u8, rn: u8, rm: u8) {
        self.ins(AL | opcode << 21 | u32::from(rn) << 16 | u32::from(rd) << 12 | u32::from(rm));
    }

    /// `cmp rn, rm`
    fn cmp(&mut self, rn: u8, rm: u8) {
        self.ins(AL | 0x0150_0000 | u32::from(rn) << 16 | u32::from(rm));
    }

    /// `asr rd, rm, #imm`
    fn asr_imm(&mut self, rd: u8, rm: u8, imm: u32) {
        self.ins(AL | 0x01A0_0040 | u32::from(rd) << 12 | imm << 7 | u32::from(rm));
    }

    /// Register-shift form: `mov rd, rm, <type> rs`
    fn shift_reg(&mut self, stype: u32, rd: u8, rm: u8, rs: u8) {
        self.ins(
            AL | 0x01A0_0010
                | u32::from(rd) << 12
                | u32::from(rs) << 8
                | stype << 5
                | u32::from(rm),
        );
    }

    fn push_pair(&mut self) {
        // push {r11, lr}
        self.ins(AL | 0x092D_0000 | 1 << u32::from(R11) | 1 << u32::from(LR));
    }

    fn pop_pair(&mut self) {
        // pop {r11, lr}
        self.ins(AL | 0x08BD_0000 | 1 << u32::from(R11) | 1 << u32::from(LR));
    }

    fn bx_lr(&mut self) {
        self.ins(AL | 0x012F_FF10 | u32::from(LR));
    }

    /// Conditional forward branch over `insns` instructions.
    fn b_over(&mut self, cond: u32, insns: u32) {
        // branch offset counts from pc (this instruction + 8)
        self.ins(cond << 28 | 0x0A00_0000 | (insns.wrapping_sub(1) & 0x00ff_ffff));
    }

    fn put_canonical(&mut self, src: u8, disp: i32) {
        self.str(src, HART, disp);
        self.asr_imm(SCRATCH, src, 31);
        self.str(SCRATCH, HART, disp + 4);
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

impl Emitter for A32Emitter {
    // r5-r8
    const POOL: u32 = 0b1111 << 5;
    const CALLER_SAVED: u32 = 0;
    const NATIVE_LINKER: bool = false;
    const SLOT_SIZE: usize = 28;

    fn new(_xlen: Xlen) -> Self {
        Self { buf: CodeBuf::new() }
    }

    fn supports(xlen: Xlen) -> bool {
        xlen == Xlen::Rv32
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
        self.push_pair();
        self.ldr(SCRATCH, HART, layout::EXIT_REQ_PTR as i32);
        self.ldr(SCRATCH, SCRATCH, 0);
        self.ins(AL | 0x0350_0000 | u32::from(SCRATCH) << 16); // cmp r12, #0
        // over the exit path: two 2-insn immediates, two stores, pop, bx
        self.b_over(0x0, 8); // beq body
        self.mov_imm(SCRATCH, guest_pc as u32);
        self.str(SCRATCH, HART, layout::PC as i32);
        // the sign word of an RV32 PC
        self.mov_imm(SCRATCH, (guest_pc as i64 >> 32) as u32);
        self.str(SCRATCH, HART, layout::PC as i32 + 4);
        self.pop_pair();
        self.bx_lr();
        // retire counter, low word only
        self.ldr(SCRATCH, HART, layout::JIT_INSTRET as i32);
        self.mov_imm(R0, instr_count);
        self.dp(0x4, SCRATCH, SCRATCH, R0); // add
        self.str(SCRATCH, HART, layout::JIT_INSTRET as i32);
    }

    fn emit_get(&mut self, dst: HostReg, guest: u8) {
        self.ldr(dst, HART, layout::reg_offset(guest));
    }

    fn emit_put(&mut self, src: HostReg, guest: u8) {
        self.put_canonical(src, layout::reg_offset(guest));
    }

    fn emit_put_imm(&mut self, guest: u8, imm: u64) {
        let disp = layout::reg_offset(guest);
        self.mov_imm(SCRATCH, imm as u32);
        self.str(SCRATCH, HART, disp);
        self.mov_imm(SCRATCH, (imm >> 32) as u32);
        self.str(SCRATCH, HART, disp + 4);
    }

    fn emit_imm(&mut self, dst: HostReg, imm: u64) {
        self.mov_imm(dst, imm as u32);
    }

    fn emit_mov(&mut self, dst: HostReg, src: HostReg) {
        self.mov_rr(dst, src);
    }

    fn emit_alu(&mut self, op: AluOp, _narrow: bool, dst: HostReg, a: HostReg, b: HostReg) {
        match op {
            AluOp::Add => self.dp(0x4, dst, a, b),
            AluOp::Sub => self.dp(0x2, dst, a, b),
            AluOp::And => self.dp(0x0, dst, a, b),
            AluOp::Or => self.dp(0xC, dst, a, b),
            AluOp::Xor => self.dp(0x1, dst, a, b),
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                // and r12, b, #31: the count masking the guest ISA requires
                self.ins(AL | 0x0200_0000 | u32::from(b) << 16 | u32::from(SCRATCH) << 12 | 31);
                let stype = match op {
                    AluOp::Sll => 0b00,
                    AluOp::Srl => 0b01,
                    _ => 0b10,
                };
                self.shift_reg(stype, dst, a, SCRATCH);
            }
            AluOp::Slt | AluOp::Sltu => {
                self.cmp(a, b);
                // mov dst, #0 ; mov<cond> dst, #1
                self.ins(AL | 0x03A0_0000 | u32::from(dst) << 12);
                let cond = if op == AluOp::Slt { 0xBu32 } else { 0x3 }; // lt / lo
                self.ins(cond << 28 | 0x03A0_0000 | u32::from(dst) << 12 | 1);
            }
            AluOp::Mul => {
                // mul dst, a, b
                self.ins(AL | 0x0000_0090 | u32::from(dst) << 16 | u32::from(b) << 8 | u32::from(a));
            }
            AluOp::Mulh | AluOp::Mulhu | AluOp::Mulhsu => {
                // smull/umull r12, dst, a, b
                let opcode = if op == AluOp::Mulh { 0x00C0_0090 } else { 0x0080_0090 };
                self.ins(
                    AL | opcode
                        | u32::from(dst) << 16
                        | u32::from(SCRATCH) << 12
                        | u32::from(b) << 8
                        | u32::from(a),
                );
                if op == AluOp::Mulhsu {
                    // mulhsu = mulhu - (a < 0 ? b : 0)
                    self.asr_imm(SCRATCH, a, 31);
                    self.dp(0x0, SCRATCH, SCRATCH, b);
                    self.dp(0x2, dst, dst, SCRATCH);
                }
            }
            AluOp::Div | AluOp::Divu => {
                let base = if op == AluOp::Div { 0x0710_F010 } else { 0x0730_F010 };
                // sdiv/udiv r12, a, b
                self.ins(AL | base | u32::from(SCRATCH) << 16 | u32::from(b) << 8 | u32::from(a));
                // hardware yields 0 for x/0; the guest wants all ones
                self.ins(AL | 0x0350_0000 | u32::from(b) << 16); // cmp b, #0
                self.ins(0x0 << 28 | 0x03E0_0000 | u32::from(SCRATCH) << 12); // mvneq r12, #0
                self.mov_rr(dst, SCRATCH);
            }
            AluOp::Rem | AluOp::Remu => {
                let base = if op == AluOp::Rem { 0x0710_F010 } else { 0x0730_F010 };
                self.ins(AL | base | u32::from(SCRATCH) << 16 | u32::from(b) << 8 | u32::from(a));
                // mls dst, r12, b, a: quotient 0 for b == 0 leaves the
                // dividend, as required
                self.ins(
                    AL | 0x0060_0090
                        | u32::from(dst) << 16
                        | u32::from(a) << 12
                        | u32::from(b) << 8
                        | u32::from(SCRATCH),
                );
            }
        }
    }

    fn emit_alu_imm(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, imm: i64) {
        // materialize and use the register form; ARM's rotated-immediate
        // encoding buys little for RISC-V's immediates
        self.mov_imm(R1, imm as u32);
        self.emit_alu(op, narrow, dst, a, R1);
    }

    fn emit_store_pc_imm(&mut self, pc: u64) {
        self.mov_imm(SCRATCH, pc as u32);
        self.str(SCRATCH, HART, layout::PC as i32);
        self.mov_imm(SCRATCH, (pc as i64 >> 32) as u32);
        self.str(SCRATCH, HART, layout::PC as i32 + 4);
    }

    fn emit_store_pc_reg(&mut self, src: HostReg) {
        self.put_canonical(src, layout::PC as i32);
    }

    fn emit_call_load(&mut self, helper: usize, addr: HostReg) {
        self.mov_rr(R1, addr);
        self.mov_rr(R0, HART);
        self.mov_imm(SCRATCH, helper as u32);
        self.ins(AL | 0x012F_FF30 | u32::from(SCRATCH)); // blx r12
    }

    fn emit_call_store(&mut self, helper: usize, addr: HostReg, value: HostReg) {
        self.mov_rr(R2, value);
        self.mov_rr(R1, addr);
        self.mov_rr(R0, HART);
        self.mov_imm(SCRATCH, helper as u32);
        self.ins(AL | 0x012F_FF30 | u32::from(SCRATCH));
    }

    fn emit_move_ret(&mut self, dst: HostReg) {
        self.mov_rr(dst, R0);
    }

    fn emit_trap_check(&mut self) {
        self.ldr(SCRATCH, HART, layout::TRAP_PENDING as i32);
        self.ins(AL | 0x0350_0000 | u32::from(SCRATCH) << 16); // cmp r12, #0
        self.b_over(0x0, 2); // beq over pop + bx
        self.pop_pair();
        self.bx_lr();
    }

    fn emit_teardown(&mut self) {
        self.pop_pair();
    }

    fn emit_ret(&mut self) {
        self.bx_lr();
    }

    fn emit_exit_slot(&mut self, target_pc: u64) -> usize {
        let at = self.buf.len();
        self.mov_imm(SCRATCH, target_pc as u32); // 8
        self.str(SCRATCH, HART, layout::PC as i32); // 4
        self.mov_imm(SCRATCH, (target_pc as i64 >> 32) as u32); // 8
        self.str(SCRATCH, HART, layout::PC as i32 + 4); // 4
        self.bx_lr(); // 4
        debug_assert_eq!(self.buf.len() - at, Self::SLOT_SIZE);
        at
    }

    fn emit_cond_skip(&mut self, cond: BranchCond, a: HostReg, b: HostReg, skip: usize) {
        self.cmp(a, b);
        self.b_over(inverse_cond(cond), skip as u32 / 4);
    }

    unsafe fn patch_jump(_slot_rw: *mut u8, _slot_rx: usize, _target_rx: usize) {
        unreachable!("arm has no native linker")
    }

    fn emit_trampoline(buf: &mut CodeBuf) {
        let mut em = Self { buf: CodeBuf::new() };
        // push {r4-r8, r11, lr} (odd count plus r11 keeps sp 8-aligned)
        em.ins(AL | 0x092D_0000 | 0b1_1111 << 4 | 1 << 11 | 1 << 14);
        em.mov_rr(HART, R1);
        em.ins(AL | 0x012F_FF30); // blx r0
        em.ins(AL | 0x08BD_0000 | 0b1_1111 << 4 | 1 << 11 | 1 << 14);
        em.bx_lr();
        for &byte in em.buf.as_slice() {
            buf.push_u8(byte);
        }
    }
}
