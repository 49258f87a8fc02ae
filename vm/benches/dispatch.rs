// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dispatch-loop throughput: interpreter vs JIT on a hot integer loop.

use criterion::{Criterion, criterion_group, criterion_main};
use kestrel_vm::{Hart, Machine, MachineConfig};

const RAM_BASE: u64 = 0x1000_0000;

/// An endless add/sub/branch loop; every iteration of the benchmark steps
/// the dispatch loop a fixed number of times.
fn guest_loop() -> [u32; 6] {
    fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (imm as u32 & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
    }
    let addi = |rd, rs1, imm| i_type(imm, rs1, 0b000, rd, 0b001_0011);
    let add = |rd: u32, rs1: u32, rs2: u32| rs2 << 20 | rs1 << 15 | rd << 7 | 0b011_0011;
    let bne = |rs1: u32, rs2: u32, offset: i32| {
        let imm = offset as u32 & 0x1fff;
        (imm >> 12) << 31
            | (imm >> 5 & 0x3f) << 25
            | rs2 << 20
            | rs1 << 15
            | 0b001 << 12
            | (imm >> 1 & 0xf) << 8
            | (imm >> 11 & 1) << 7
            | 0b110_0011
    };
    let jal_back = 0xFF1F_F06F; // jal x0, -16
    [
        addi(6, 0, 1024),
        add(5, 5, 6),
        addi(6, 6, -1),
        bne(6, 0, -8),
        jal_back,
        0,
    ]
}

fn hart(jit: bool) -> Hart {
    let machine = Machine::new(MachineConfig {
        ram_base: RAM_BASE,
        ram_size: 1024 * 1024,
        reset_vector: RAM_BASE,
        jit,
        jit_threshold: 1,
        ..MachineConfig::default()
    })
    .expect("machine");
    for (i, word) in guest_loop().iter().enumerate() {
        machine.ram_write(RAM_BASE + 4 * i as u64, &word.to_le_bytes()).expect("load");
    }
    machine.take_hart(0).expect("hart 0")
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let mut interp = hart(false);
    group.bench_function("interpreter", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                interp.step();
            }
        });
    });

    let mut jitted = hart(true);
    group.bench_function("jit", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                jitted.step();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
