// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86_64 (SysV) backend.
//!
//! Register plan: `rbx` pins the hart pointer for the whole block;
//! `rax`/`rcx`/`rdx` are backend scratch (shift counts, mul/div operands,
//! helper returns); everything else is the allocator's pool. Guest state is
//! addressed as `[rbx + disp32]`.

use kestrel_riscv::Xlen;
use kestrel_riscv::decode::{AluOp, BranchCond};

use super::{CodeBuf, Emitter, HostReg};
use crate::jit::layout;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;

pub(crate) struct X64Emitter {
    buf: CodeBuf,
    narrow_guest: bool,
}

impl X64Emitter {
    /// REX prefix, omitted when no bit is needed.
    fn rex(&mut self, wide: bool, reg: u8, rm: u8) {
        let rex = 0x40u8 | u8::from(wide) << 3 | (reg >> 3) << 2 | rm >> 3;
        if rex != 0x40 {
            self.buf.push_u8(rex);
        }
    }

    fn rex_always(&mut self, wide: bool, reg: u8, rm: u8) {
        self.buf.push_u8(0x40 | u8::from(wide) << 3 | (reg >> 3) << 2 | rm >> 3);
    }

    #[inline]
    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buf.push_u8(0xC0 | (reg & 7) << 3 | rm & 7);
    }

    /// ModRM for `[rbx + disp32]`.
    #[inline]
    fn modrm_rbx(&mut self, reg: u8, disp: i32) {
        self.buf.push_u8(0x80 | (reg & 7) << 3 | RBX);
        self.buf.push_u32(disp as u32);
    }

    /// `mov dst, src` (64-bit)
    fn mov_rr(&mut self, dst: u8, src: u8) {
        if dst != src {
            self.rex_always(true, src, dst);
            self.buf.push_u8(0x89);
            self.modrm_reg(src, dst);
        }
    }

    fn mov_ri(&mut self, dst: u8, imm: u64) {
        if imm <= u64::from(u32::MAX) {
            // 32-bit move zero-extends
            self.rex(false, 0, dst);
            self.buf.push_u8(0xB8 + (dst & 7));
            self.buf.push_u32(imm as u32);
        } else if imm as i64 >= i64::from(i32::MIN) && (imm as i64) < 0 {
            // sign-extended imm32
            self.rex_always(true, 0, dst);
            self.buf.push_u8(0xC7);
            self.modrm_reg(0, dst);
            self.buf.push_u32(imm as u32);
        } else {
            self.rex_always(true, 0, dst);
            self.buf.push_u8(0xB8 + (dst & 7));
            self.buf.push_u64(imm);
        }
    }

    /// Fixed ten-byte `mov dst, imm64`, for patchable slots.
    fn mov_ri_fixed(&mut self, dst: u8, imm: u64) {
        self.rex_always(true, 0, dst);
        self.buf.push_u8(0xB8 + (dst & 7));
        self.buf.push_u64(imm);
    }

    /// `mov dst, [rbx + disp]` (64-bit)
    fn load64(&mut self, dst: u8, disp: i32) {
        self.rex_always(true, dst, RBX);
        self.buf.push_u8(0x8B);
        self.modrm_rbx(dst, disp);
    }

    /// `mov [rbx + disp], src` (64-bit)
    fn store64(&mut self, src: u8, disp: i32) {
        self.rex_always(true, src, RBX);
        self.buf.push_u8(0x89);
        self.modrm_rbx(src, disp);
    }

    /// `mov dst32, [rbx + disp]`
    fn load32(&mut self, dst: u8, disp: i32) {
        self.rex(false, dst, RBX);
        self.buf.push_u8(0x8B);
        self.modrm_rbx(dst, disp);
    }

    /// Two-operand ALU, opcode is the `r/m, r` form (01 add, 29 sub, ...).
    fn alu_rr(&mut self, opcode: u8, wide: bool, rm: u8, reg: u8) {
        if wide {
            self.rex_always(true, reg, rm);
        } else {
            self.rex(false, reg, rm);
        }
        self.buf.push_u8(opcode);
        self.modrm_reg(reg, rm);
    }

    /// Immediate-operand ALU group 0x81, `ext` selects the operation.
    fn alu_ri(&mut self, ext: u8, wide: bool, rm: u8, imm: i32) {
        if wide {
            self.rex_always(true, 0, rm);
        } else {
            self.rex(false, 0, rm);
        }
        self.buf.push_u8(0x81);
        self.modrm_reg(ext, rm);
        self.buf.push_u32(imm as u32);
    }

    /// `movsxd dst, dst32`: canonicalize a 32-bit result.
    fn sext32(&mut self, dst: u8) {
        self.rex_always(true, dst, dst);
        self.buf.push_u8(0x63);
        self.modrm_reg(dst, dst);
    }

    /// One-operand F7 group (mul /4, imul /5, div /6, idiv /7).
    fn f7(&mut self, ext: u8, wide: bool, rm: u8) {
        if wide {
            self.rex_always(true, 0, rm);
        } else {
            self.rex(false, 0, rm);
        }
        self.buf.push_u8(0xF7);
        self.modrm_reg(ext, rm);
    }

    /// Shift by `cl` (shl /4, shr /5, sar /7).
    fn shift_cl(&mut self, ext: u8, wide: bool, rm: u8) {
        if wide {
            self.rex_always(true, 0, rm);
        } else {
            self.rex(false, 0, rm);
        }
        self.buf.push_u8(0xD3);
        self.modrm_reg(ext, rm);
    }

    fn shift_imm(&mut self, ext: u8, wide: bool, rm: u8, imm: u8) {
        if wide {
            self.rex_always(true, 0, rm);
        } else {
            self.rex(false, 0, rm);
        }
        self.buf.push_u8(0xC1);
        self.modrm_reg(ext, rm);
        self.buf.push_u8(imm);
    }

    /// `setcc dst8` + zero extension into the full register.
    fn setcc(&mut self, cc: u8, dst: u8) {
        // REX so the low byte of rsi/rdi/rbp encodes as sil/dil/bpl
        self.rex_always(false, 0, dst);
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x90 + cc);
        self.modrm_reg(0, dst);
        // movzx dst, dst8
        self.rex_always(true, dst, dst);
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0xB6);
        self.modrm_reg(dst, dst);
    }

    /// Forward `jcc rel32`; returns the patch position for [`Self::bind`].
    fn jcc_fwd(&mut self, cc: u8) -> usize {
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x80 + cc);
        let at = self.buf.len();
        self.buf.push_u32(0);
        at
    }

    fn jmp_fwd(&mut self) -> usize {
        self.buf.push_u8(0xE9);
        let at = self.buf.len();
        self.buf.push_u32(0);
        at
    }

    fn bind(&mut self, at: usize) {
        let rel = (self.buf.len() - (at + 4)) as u32;
        self.buf.patch_u32(at, rel);
    }

    fn test_rr(&mut self, wide: bool, a: u8, b: u8) {
        self.alu_rr(0x85, wide, a, b);
    }

    /// `add rsp, 8` / `sub rsp, 8`
    fn adjust_rsp(&mut self, grow: bool) {
        self.buf.push_u8(0x48);
        self.buf.push_u8(0x83);
        self.buf.push_u8(if grow { 0xEC } else { 0xC4 });
        self.buf.push_u8(0x08);
    }

    fn call_rax(&mut self) {
        self.buf.push_u8(0xFF);
        self.buf.push_u8(0xD0);
    }

    fn ret(&mut self) {
        self.buf.push_u8(0xC3);
    }

    /// The wide flag for the guest's natural width.
    #[inline]
    fn wide(&self, narrow: bool) -> bool {
        !(narrow || self.narrow_guest)
    }

    fn emit_mul_div(&mut self, op: AluOp, wide: bool, dst: u8, a: u8, b: u8) {
        match op {
            AluOp::Mul => {
                self.mov_rr(RAX, a);
                // imul rax, b
                self.rex_always(true, RAX, b);
                self.buf.push_u8(0x0F);
                self.buf.push_u8(0xAF);
                self.modrm_reg(RAX, b);
                self.mov_rr(dst, RAX);
                if !wide {
                    self.sext32(dst);
                }
            }
            AluOp::Mulh | AluOp::Mulhu | AluOp::Mulhsu => {
                self.mov_rr(RAX, a);
                self.mov_rr(RCX, b);
                if op == AluOp::Mulh {
                    self.f7(5, wide, RCX);
                } else {
                    self.f7(4, wide, RCX);
                }
                if op == AluOp::Mulhsu {
                    // mulhsu = mulhu - (a < 0 ? b : 0)
                    self.mov_rr(RCX, a);
                    self.shift_imm(7, true, RCX, 63); // sar rcx, 63
                    self.alu_rr(0x21, true, RCX, b); // and rcx, b
                    self.alu_rr(0x29, true, RDX, RCX); // sub rdx, rcx
                }
                self.mov_rr(dst, RDX);
                if !wide {
                    self.sext32(dst);
                }
            }
            AluOp::Div | AluOp::Divu | AluOp::Rem | AluOp::Remu => {
                let signed = matches!(op, AluOp::Div | AluOp::Rem);
                let quotient = matches!(op, AluOp::Div | AluOp::Divu);

                self.mov_rr(RAX, a);
                self.mov_rr(RCX, b);
                // divisor == 0?
                self.test_rr(wide, RCX, RCX);
                let by_zero = self.jcc_fwd(0x4); // je
                let mut overflow = None;
                if signed {
                    // MIN / -1 overflows the hardware divide
                    self.alu_ri(7, wide, RCX, -1); // cmp rcx, -1
                    let not_minus_one = self.jcc_fwd(0x5); // jne
                    if wide {
                        self.mov_ri(RDX, i64::MIN as u64);
                        self.alu_rr(0x39, true, RAX, RDX); // cmp rax, rdx
                    } else {
                        self.alu_ri(7, false, RAX, i32::MIN); // cmp eax, imm
                    }
                    overflow = Some(self.jcc_fwd(0x4)); // je
                    self.bind(not_minus_one);
                }
                if signed {
                    // cqo / cdq
                    if wide {
                        self.buf.push_u8(0x48);
                    }
                    self.buf.push_u8(0x99);
                    self.f7(7, wide, RCX);
                } else {
                    // zero the high half
                    self.alu_rr(0x31, true, RDX, RDX); // xor rdx, rdx
                    self.f7(6, wide, RCX);
                }
                self.mov_rr(dst, if quotient { RAX } else { RDX });
                let done = self.jmp_fwd();

                self.bind(by_zero);
                if quotient {
                    self.mov_ri(dst, u64::MAX);
                } else {
                    self.mov_rr(dst, a);
                }
                if let Some(overflow) = overflow {
                    let done2 = self.jmp_fwd();
                    self.bind(overflow);
                    if quotient {
                        // MIN / -1 = MIN
                        self.mov_rr(dst, a);
                    } else {
                        self.mov_ri(dst, 0);
                    }
                    self.bind(done2);
                }
                self.bind(done);
                if !wide {
                    self.sext32(dst);
                }
            }
            _ => unreachable!("not a mul/div op"),
        }
    }
}

fn cc_of_inverse(cond: BranchCond) -> u8 {
    // condition code that jumps when `cond` does NOT hold
    match cond {
        BranchCond::Eq => 0x5,  // jne
        BranchCond::Ne => 0x4,  // je
        BranchCond::Lt => 0xD,  // jge
        BranchCond::Ge => 0xC,  // jl
        BranchCond::Ltu => 0x3, // jae
        BranchCond::Geu => 0x2, // jb
    }
}

impl Emitter for X64Emitter {
    // rbp, rsi, rdi, r8-r15
    const POOL: u32 = 1 << RBP | 1 << RSI | 1 << RDI | 0xFF00;
    const CALLER_SAVED: u32 = 1 << RSI | 1 << RDI | 1 << 8 | 1 << 9 | 1 << 10 | 1 << 11;
    const NATIVE_LINKER: bool = true;
    const SLOT_SIZE: usize = 20;

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
        self.adjust_rsp(true);
        // rax = *hart.exit_req
        self.load64(RAX, layout::EXIT_REQ_PTR as i32);
        self.buf.push_u8(0x8B); // mov eax, [rax]
        self.buf.push_u8(0x00);
        self.test_rr(false, RAX, RAX);
        let body = self.jcc_fwd(0x4); // je
        self.mov_ri(RAX, guest_pc);
        self.store64(RAX, layout::PC as i32);
        self.adjust_rsp(false);
        self.ret();
        self.bind(body);
        // add qword [rbx + jit_instret], count
        self.rex_always(true, 0, RBX);
        self.buf.push_u8(0x81);
        self.modrm_rbx(0, layout::JIT_INSTRET as i32);
        self.buf.push_u32(instr_count);
    }

    fn emit_get(&mut self, dst: HostReg, guest: u8) {
        self.load64(dst, layout::reg_offset(guest));
    }

    fn emit_put(&mut self, src: HostReg, guest: u8) {
        self.store64(src, layout::reg_offset(guest));
    }

    fn emit_put_imm(&mut self, guest: u8, imm: u64) {
        self.mov_ri(RAX, imm);
        self.store64(RAX, layout::reg_offset(guest));
    }

    fn emit_imm(&mut self, dst: HostReg, imm: u64) {
        self.mov_ri(dst, imm);
    }

    fn emit_mov(&mut self, dst: HostReg, src: HostReg) {
        self.mov_rr(dst, src);
    }

    fn emit_alu(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, b: HostReg) {
        let wide = self.wide(narrow);
        match op {
            AluOp::Add | AluOp::And | AluOp::Or | AluOp::Xor | AluOp::Sub => {
                let opcode = match op {
                    AluOp::Add => 0x01,
                    AluOp::Sub => 0x29,
                    AluOp::And => 0x21,
                    AluOp::Or => 0x09,
                    _ => 0x31,
                };
                if dst == a {
                    self.alu_rr(opcode, wide, dst, b);
                } else if dst == b && op != AluOp::Sub {
                    self.alu_rr(opcode, wide, dst, a);
                } else {
                    self.mov_rr(RAX, a);
                    self.alu_rr(opcode, wide, RAX, b);
                    self.mov_rr(dst, RAX);
                }
                if !wide {
                    self.sext32(dst);
                }
            }
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                let ext = match op {
                    AluOp::Sll => 4,
                    AluOp::Srl => 5,
                    _ => 7,
                };
                self.mov_rr(RCX, b);
                self.mov_rr(RAX, a);
                // hardware masks the count by 63/31, matching the ISA
                self.shift_cl(ext, wide, RAX);
                self.mov_rr(dst, RAX);
                if !wide {
                    self.sext32(dst);
                }
            }
            AluOp::Slt | AluOp::Sltu => {
                // operands are canonical, a 64-bit compare is exact for both
                // widths
                self.alu_rr(0x39, true, a, b);
                let cc = if op == AluOp::Slt { 0xC } else { 0x2 }; // setl / setb
                if dst == a || dst == b {
                    self.setcc(cc, RAX);
                    self.mov_rr(dst, RAX);
                } else {
                    self.setcc(cc, dst);
                }
            }
            _ => self.emit_mul_div(op, wide, dst, a, b),
        }
    }

    fn emit_alu_imm(&mut self, op: AluOp, narrow: bool, dst: HostReg, a: HostReg, imm: i64) {
        let wide = self.wide(narrow);
        match op {
            AluOp::Add | AluOp::And | AluOp::Or | AluOp::Xor | AluOp::Sub => {
                let ext = match op {
                    AluOp::Add => 0,
                    AluOp::Or => 1,
                    AluOp::And => 4,
                    AluOp::Sub => 5,
                    _ => 6,
                };
                let imm32 = i32::try_from(imm).expect("riscv immediates fit i32");
                self.mov_rr(dst, a);
                self.alu_ri(ext, wide, dst, imm32);
                if !wide {
                    self.sext32(dst);
                }
            }
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                let ext = match op {
                    AluOp::Sll => 4,
                    AluOp::Srl => 5,
                    _ => 7,
                };
                self.mov_rr(dst, a);
                self.shift_imm(ext, wide, dst, imm as u8);
                if !wide {
                    self.sext32(dst);
                }
            }
            AluOp::Slt | AluOp::Sltu => {
                let imm32 = i32::try_from(imm).expect("riscv immediates fit i32");
                self.alu_ri(7, true, a, imm32); // cmp
                let cc = if op == AluOp::Slt { 0xC } else { 0x2 };
                if dst == a {
                    self.setcc(cc, RAX);
                    self.mov_rr(dst, RAX);
                } else {
                    self.setcc(cc, dst);
                }
            }
            _ => unreachable!("no immediate form of {op:?}"),
        }
    }

    fn emit_store_pc_imm(&mut self, pc: u64) {
        self.mov_ri(RAX, pc);
        self.store64(RAX, layout::PC as i32);
    }

    fn emit_store_pc_reg(&mut self, src: HostReg) {
        self.store64(src, layout::PC as i32);
    }

    fn emit_call_load(&mut self, helper: usize, addr: HostReg) {
        self.mov_rr(RSI, addr);
        self.mov_rr(RDI, RBX);
        self.mov_ri(RAX, helper as u64);
        self.call_rax();
    }

    fn emit_call_store(&mut self, helper: usize, addr: HostReg, value: HostReg) {
        // rdx is scratch, so `value`/`addr` can never alias it
        self.mov_rr(RDX, value);
        self.mov_rr(RSI, addr);
        self.mov_rr(RDI, RBX);
        self.mov_ri(RAX, helper as u64);
        self.call_rax();
    }

    fn emit_move_ret(&mut self, dst: HostReg) {
        self.mov_rr(dst, RAX);
    }

    fn emit_trap_check(&mut self) {
        self.load32(RAX, layout::TRAP_PENDING as i32);
        self.test_rr(false, RAX, RAX);
        let ok = self.jcc_fwd(0x4); // je
        self.adjust_rsp(false);
        self.ret();
        self.bind(ok);
    }

    fn emit_teardown(&mut self) {
        self.adjust_rsp(false);
    }

    fn emit_ret(&mut self) {
        self.ret();
    }

    fn emit_exit_slot(&mut self, target_pc: u64) -> usize {
        let at = self.buf.len();
        self.mov_ri_fixed(RAX, target_pc); // 10 bytes
        self.store64(RAX, layout::PC as i32); // 7 bytes
        self.ret(); // 1 byte
        while self.buf.len() - at < Self::SLOT_SIZE {
            self.buf.push_u8(0x90);
        }
        at
    }

    fn emit_cond_skip(&mut self, cond: BranchCond, a: HostReg, b: HostReg, skip: usize) {
        self.alu_rr(0x39, true, a, b); // cmp a, b
        self.buf.push_u8(0x0F);
        self.buf.push_u8(0x80 + cc_of_inverse(cond));
        self.buf.push_u32(skip as u32);
    }

    unsafe fn patch_jump(slot_rw: *mut u8, slot_rx: usize, target_rx: usize) {
        let rel = (target_rx as i64 - (slot_rx as i64 + 5)) as i32;
        // Safety: caller guarantees SLOT_SIZE writable bytes
        unsafe {
            slot_rw.write(0xE9);
            slot_rw.add(1).cast::<i32>().write_unaligned(rel);
        }
    }

    fn emit_trampoline(buf: &mut CodeBuf) {
        // extern "C" fn(entry: rdi, hart: rsi)
        for reg in [RBX, RBP, 12u8, 13, 14, 15] {
            if reg >= 8 {
                buf.push_u8(0x41);
            }
            buf.push_u8(0x50 + (reg & 7));
        }
        // sub rsp, 8 (alignment)
        buf.push_u8(0x48);
        buf.push_u8(0x83);
        buf.push_u8(0xEC);
        buf.push_u8(0x08);
        // mov rbx, rsi
        buf.push_u8(0x48);
        buf.push_u8(0x89);
        buf.push_u8(0xF3);
        // mov rax, rdi ; call rax
        buf.push_u8(0x48);
        buf.push_u8(0x89);
        buf.push_u8(0xF8);
        buf.push_u8(0xFF);
        buf.push_u8(0xD0);
        // add rsp, 8
        buf.push_u8(0x48);
        buf.push_u8(0x83);
        buf.push_u8(0xC4);
        buf.push_u8(0x08);
        for reg in [15u8, 14, 13, 12, RBP, RBX] {
            if reg >= 8 {
                buf.push_u8(0x41);
            }
            buf.push_u8(0x58 + (reg & 7));
        }
        buf.push_u8(0xC3);
    }
}
