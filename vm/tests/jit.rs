// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interpreter ≡ JIT equivalence and the invalidation protocol.
//!
//! Everything here is gated on hosts with a backend; on anything else the
//! machine silently runs interpreted and these tests would only compare the
//! interpreter against itself.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]

mod common;

use common::*;
use proptest::prelude::*;

/// Runs `code` twice, once interpreted and once through the JIT with an
/// immediate promotion threshold, and asserts identical integer state.
fn assert_equivalent(code: &[u32], max_steps: usize) {
    let (_mi, mut interp) = machine(false, code);
    let (_mj, mut jitted) = machine(true, code);
    run_to_wfi(&mut interp, max_steps);
    run_to_wfi(&mut jitted, max_steps);
    for reg in 1..32 {
        assert_eq!(
            interp.x(reg),
            jitted.x(reg),
            "x{reg} diverged: interp {:#x}, jit {:#x}",
            interp.x(reg),
            jitted.x(reg),
        );
    }
    assert_eq!(interp.pc(), jitted.pc());
}

#[test]
fn hot_loop_matches_interpreter() {
    // sum 1..=100 then a few dependent ops; the loop body compiles and
    // self-links
    let code = [
        addi(5, 0, 0),
        addi(6, 0, 100),
        add(5, 5, 6),
        addi(6, 6, -1),
        bne(6, 0, -8),
        mul(7, 5, 5),
        div(8, 7, 5),
        rem(9, 7, 6),
        wfi(),
    ];
    assert_equivalent(&code, 5000);
}

#[test]
fn memory_traffic_matches_interpreter() {
    let code = [
        lui(5, 0x10010),
        addi(6, 0, 0),
        addi(7, 0, 64),
        // store i*i to [x5 + i*8], reload and accumulate
        mul(8, 6, 6),
        sd(8, 5, 0),
        ld(9, 5, 0),
        add(10, 10, 9),
        addi(5, 5, 8),
        addi(6, 6, 1),
        bne(6, 7, -24),
        wfi(),
    ];
    assert_equivalent(&code, 5000);
}

#[test]
fn jalr_returns_match() {
    // call/return via jalr, the dynamic-exit tail
    let code = [
        /* 0 */ addi(5, 0, 0),
        /* 1 */ addi(6, 0, 10),
        // loop: call leaf
        /* 2 */ auipc(1, 0),
        /* 3 */ addi(1, 1, 12), // return address = instruction 5
        /* 4 */ jal(0, (8 - 4) * 4), // -> leaf
        /* 5 */ addi(6, 6, -1),
        /* 6 */ bne(6, 0, -16),
        /* 7 */ wfi(),
        // leaf: x5 += 3; ret
        /* 8 */ addi(5, 5, 3),
        /* 9 */ jalr(0, 1, 0),
    ];
    assert_equivalent(&code, 2000);
}

#[test]
fn self_modifying_code_retranslates() {
    // pass 1 executes the target as assembled (x10 = 99), then the program
    // rewrites the target instruction in place, fences, and re-executes
    // (x10 = 55); the heap must flush in between
    let target_word = addi(10, 0, 55);
    let code = [
        /*  0 */ auipc(6, 0), // x6 = image base
        /*  1 */ addi(28, 28, 1),
        /*  2 */ jal(0, (13 - 2) * 4), // -> target
        // check: (target returns here)
        /*  3 */ addi(29, 0, 2),
        /*  4 */ beq(28, 29, (12 - 4) * 4), // second pass -> done
        /*  5 */ add(20, 10, 0), // save first result
        /*  6 */ lui(5, target_word >> 12),
        /*  7 */ addi(5, 5, (target_word & 0xfff) as i32),
        /*  8 */ sw(5, 6, 13 * 4), // rewrite the target instruction
        /*  9 */ fence_i(),
        /* 10 */ addi(28, 28, 1),
        /* 11 */ jal(0, (13 - 11) * 4), // -> target again
        /* 12 */ wfi(), // done
        // target:
        /* 13 */ addi(10, 0, 99),
        /* 14 */ jal(0, (3 - 14) * 4), // back to check
    ];
    let (machine, mut hart) = machine(true, &code);
    run_to_wfi(&mut hart, 2000);

    assert_eq!(hart.x(20), 99, "first invocation");
    assert_eq!(hart.x(10), 55, "second invocation after rewrite");
    assert!(machine.jit_flushes() >= 1, "rewriting live code must flush");
}

#[test]
fn external_rewrite_retranslates() {
    // the DMA path: the embedder rewrites guest code bytes between runs
    let code = [addi(10, 0, 111), wfi()];
    let (machine, mut hart) = machine(true, &code);
    run_to_wfi(&mut hart, 200);
    assert_eq!(hart.x(10), 111);

    write_words(&machine, RAM_BASE, &[addi(10, 0, 222), wfi()]);
    hart.wake();
    hart.set_pc(RAM_BASE);
    // the dirty page forces a flush + retranslation on re-entry
    run_to_wfi(&mut hart, 200);
    assert_eq!(hart.x(10), 222);
    assert!(machine.jit_flushes() >= 1);
}

/// One random straight-line ALU instruction, never touching x5 (the memory
/// base) and never a control transfer.
fn arb_alu_op() -> impl Strategy<Value = u32> {
    let rd = 6u32..31;
    let rs = 1u32..31;
    prop_oneof![
        (rd.clone(), 0u32..(1 << 20)).prop_map(|(rd, imm)| lui(rd, imm)),
        (rd.clone(), rs.clone(), -2048i32..2048).prop_map(|(rd, rs1, imm)| addi(rd, rs1, imm)),
        (rd.clone(), rs.clone(), rs.clone()).prop_map(|(rd, a, b)| add(rd, a, b)),
        (rd.clone(), rs.clone(), rs.clone()).prop_map(|(rd, a, b)| sub(rd, a, b)),
        (rd.clone(), rs.clone(), rs.clone()).prop_map(|(rd, a, b)| or(rd, a, b)),
        (rd.clone(), rs.clone(), rs.clone()).prop_map(|(rd, a, b)| mul(rd, a, b)),
        (rd.clone(), rs.clone(), rs.clone()).prop_map(|(rd, a, b)| div(rd, a, b)),
        (rd.clone(), rs.clone(), rs.clone()).prop_map(|(rd, a, b)| rem(rd, a, b)),
        (rd.clone(), rs.clone(), 0u32..64).prop_map(|(rd, rs1, sh)| slli(rd, rs1, sh)),
        (rd.clone(), rs.clone(), 0u32..64).prop_map(|(rd, rs1, sh)| srli(rd, rs1, sh)),
        // loads and stores against the fixed buffer in x5
        (rd, 0i32..32).prop_map(|(rd, slot)| ld(rd, 5, slot * 8)),
        (rs, 0i32..32).prop_map(|(rs2, slot)| sd(rs2, 5, slot * 8)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn straight_line_equivalence(ops in prop::collection::vec(arb_alu_op(), 1..100)) {
        let mut code = vec![lui(5, 0x10010)];
        code.extend(&ops);
        code.push(wfi());
        assert_equivalent(&code, ops.len() * 4 + 50);
    }
}
