// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared harness: a word-level assembler for the handful of instructions
//! the scenarios need, plus machine construction helpers.
//!
//! Guest images live at a lui-formable RAM base so test programs can build
//! absolute addresses without pc-relative gymnastics.

#![allow(dead_code, reason = "not every test file uses every encoder")]

use std::sync::Arc;

use kestrel_vm::hart::RunState;
use kestrel_vm::{Hart, Machine, MachineConfig};

pub const RAM_BASE: u64 = 0x1000_0000;
pub const RAM_SIZE: u64 = 4 * 1024 * 1024;

/// Opt-in engine tracing while debugging a failing scenario:
/// `KESTREL_LOG=kestrel_vm=trace cargo test ...`
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("KESTREL_LOG"))
        .try_init();
}

pub fn config(jit: bool) -> MachineConfig {
    init_tracing();
    MachineConfig {
        ram_base: RAM_BASE,
        ram_size: RAM_SIZE,
        reset_vector: RAM_BASE,
        jit,
        // promote on the first visit so every test exercises compiled code
        jit_threshold: 1,
        ..MachineConfig::default()
    }
}

pub fn machine_with(cfg: MachineConfig, code: &[u32]) -> (Arc<Machine>, Hart) {
    let machine = Machine::new(cfg).expect("machine construction");
    write_words(&machine, RAM_BASE, code);
    let hart = machine.take_hart(0).expect("hart 0");
    (machine, hart)
}

pub fn machine(jit: bool, code: &[u32]) -> (Arc<Machine>, Hart) {
    machine_with(config(jit), code)
}

pub fn write_words(machine: &Machine, addr: u64, words: &[u32]) {
    for (i, word) in words.iter().enumerate() {
        machine
            .ram_write(addr + 4 * i as u64, &word.to_le_bytes())
            .expect("writing guest code");
    }
}

/// Steps until the hart parks in WFI (the tests' halt convention).
///
/// # Panics
///
/// Panics when the hart has not halted after `max` steps.
pub fn run_to_wfi(hart: &mut Hart, max: usize) {
    for _ in 0..max {
        if hart.run_state() == RunState::WaitingForInterrupt {
            return;
        }
        hart.step();
    }
    panic!("hart did not reach wfi within {max} steps (pc = {:#x})", hart.pc());
}

// ---- encoders ----

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    assert!((-2048..2048).contains(&imm), "i-imm out of range: {imm}");
    (imm as u32 & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    assert!((-2048..2048).contains(&imm));
    let imm = imm as u32 & 0xfff;
    (imm >> 5) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1f) << 7 | 0b010_0011
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    assert!((-4096..4096).contains(&imm) && imm % 2 == 0);
    let imm = imm as u32 & 0x1fff;
    (imm >> 12) << 31
        | (imm >> 5 & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | 0b110_0011
}

pub fn lui(rd: u32, imm20: u32) -> u32 {
    imm20 << 12 | rd << 7 | 0b011_0111
}

pub fn auipc(rd: u32, imm20: u32) -> u32 {
    imm20 << 12 | rd << 7 | 0b001_0111
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b000, rd, 0b001_0011)
}

pub fn ori(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b110, rd, 0b001_0011)
}

pub fn slli(rd: u32, rs1: u32, shamt: u32) -> u32 {
    shamt << 20 | rs1 << 15 | 0b001 << 12 | rd << 7 | 0b001_0011
}

pub fn srli(rd: u32, rs1: u32, shamt: u32) -> u32 {
    shamt << 20 | rs1 << 15 | 0b101 << 12 | rd << 7 | 0b001_0011
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 0b000, rd, 0b011_0011)
}

pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0b010_0000, rs2, rs1, 0b000, rd, 0b011_0011)
}

pub fn or(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 0b110, rd, 0b011_0011)
}

pub fn mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 0b000, rd, 0b011_0011)
}

pub fn div(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 0b100, rd, 0b011_0011)
}

pub fn rem(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 0b110, rd, 0b011_0011)
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b010, rd, 0b000_0011)
}

pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b100, rd, 0b000_0011)
}

pub fn lhu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b101, rd, 0b000_0011)
}

pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b011, rd, 0b000_0011)
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0b010)
}

pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0b011)
}

pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 0b000)
}

pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 0b001)
}

pub fn blt(rs1: u32, rs2: u32, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 0b100)
}

pub fn jal(rd: u32, offset: i32) -> u32 {
    assert!(offset % 2 == 0);
    let imm = offset as u32 & 0x1f_ffff;
    (imm >> 20) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xff) << 12
        | rd << 7
        | 0b110_1111
}

pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b000, rd, 0b110_0111)
}

pub fn ecall() -> u32 {
    0x0000_0073
}

pub fn ebreak() -> u32 {
    0x0010_0073
}

pub fn wfi() -> u32 {
    0x1050_0073
}

pub fn mret() -> u32 {
    0x3020_0073
}

pub fn fence_i() -> u32 {
    0x0000_100F
}

pub fn sfence_vma(rs1: u32, rs2: u32) -> u32 {
    0b000_1001 << 25 | rs2 << 20 | rs1 << 15 | 0b111_0011
}

pub fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    csr << 20 | rs1 << 15 | 0b001 << 12 | rd << 7 | 0b111_0011
}

pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    csr << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0b111_0011
}

pub fn csrrc(rd: u32, csr: u32, rs1: u32) -> u32 {
    csr << 20 | rs1 << 15 | 0b011 << 12 | rd << 7 | 0b111_0011
}

pub fn lr_w(rd: u32, rs1: u32) -> u32 {
    0b00010 << 27 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0b010_1111
}

pub fn sc_w(rd: u32, rs1: u32, rs2: u32) -> u32 {
    0b00011 << 27 | rs2 << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0b010_1111
}

pub fn amoadd_w(rd: u32, rs1: u32, rs2: u32) -> u32 {
    rs2 << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0b010_1111
}

pub fn amoswap_w(rd: u32, rs1: u32, rs2: u32) -> u32 {
    0b00001 << 27 | rs2 << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0b010_1111
}
