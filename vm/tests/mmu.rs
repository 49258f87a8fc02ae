// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! SV39 translation driven end-to-end: an M-mode setup stub builds a paged
//! world, drops to S-mode through it, and faults precisely.

mod common;

use common::*;
use kestrel_riscv::Privilege;
use kestrel_riscv::csr;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

/// Page-table layout, RAM-relative: root at +0x1000, mid level at +0x2000,
/// leaf level at +0x3000, a read-only data page at +0x6000.
fn build_page_tables(machine: &kestrel_vm::Machine) {
    let ppn = |offset: u64| (RAM_BASE + offset) >> 12;

    // root[0] -> mid table (VPN2 0 covers both 0x1000_0000 and 0x2000_0000)
    let root0 = ppn(0x2000) << 10 | PTE_V;
    machine.ram_write(RAM_BASE + 0x1000, &root0.to_le_bytes()).unwrap();

    // mid[128]: 2 MiB identity leaf over the code at 0x1000_0000, RWX
    let mid128 = ppn(0) << 10 | PTE_V | PTE_R | PTE_W | PTE_X | PTE_A | PTE_D;
    machine.ram_write(RAM_BASE + 0x2000 + 128 * 8, &mid128.to_le_bytes()).unwrap();

    // mid[256] -> leaf table (covers VA 0x2000_0000)
    let mid256 = ppn(0x3000) << 10 | PTE_V;
    machine.ram_write(RAM_BASE + 0x2000 + 256 * 8, &mid256.to_le_bytes()).unwrap();

    // leaf[0]: the read-only page
    let leaf0 = ppn(0x6000) << 10 | PTE_V | PTE_R | PTE_A;
    machine.ram_write(RAM_BASE + 0x3000, &leaf0.to_le_bytes()).unwrap();

    // data the S-mode code will read through the mapping
    machine.ram_write(RAM_BASE + 0x6000, &0x1234u32.to_le_bytes()).unwrap();
}

fn setup_code() -> Vec<u32> {
    let mut code = vec![
        // delegate store page faults to S-mode
        lui(5, 8), // 1 << 15
        csrrs(0, csr::MEDELEG as u32, 5),
        // stvec (patched below)
        lui(6, 0x10000),
        addi(6, 6, 0),
        csrrw(0, csr::STVEC as u32, 6),
        // satp = SV39 | root ppn (root at RAM_BASE + 0x1000)
        addi(7, 0, 1),
        slli(7, 7, 63),
        lui(28, 0x10),
        addi(28, 28, 1),
        or(7, 7, 28),
        csrrw(0, csr::SATP as u32, 7),
        sfence_vma(0, 0),
        // mstatus.MPP = Supervisor
        addi(29, 0, 3),
        slli(29, 29, 11),
        csrrc(0, csr::MSTATUS as u32, 29),
        addi(30, 0, 1),
        slli(30, 30, 11),
        csrrs(0, csr::MSTATUS as u32, 30),
        // mepc = S-mode entry (patched below)
        lui(31, 0x10000),
        addi(31, 31, 0),
        csrrw(0, csr::MEPC as u32, 31),
        mret(),
    ];

    let s_entry = code.len() as i32 * 4;
    code.extend([
        lui(10, 0x20000), // VA of the read-only page
        lw(11, 10, 0),    // read succeeds
        sw(0, 10, 0),     // store faults
        wfi(),            // never reached
    ]);
    let handler = code.len() as i32 * 4;
    code.push(wfi());

    code[3] = addi(6, 6, handler);
    code[19] = addi(31, 31, s_entry);
    code
}

#[test]
fn store_page_fault_is_precise() {
    let code = setup_code();
    let (machine, mut hart) = machine(false, &code);
    build_page_tables(&machine);

    run_to_wfi(&mut hart, 1000);

    // the load through the RO mapping worked
    assert_eq!(hart.x(11), 0x1234);
    // the store trapped into S-mode with the architectural triple
    assert_eq!(hart.peek_csr(csr::SCAUSE), Some(15));
    assert_eq!(hart.peek_csr(csr::STVAL), Some(0x2000_0000));
    let s_entry = RAM_BASE + (setup_code().len() as u64 - 5) * 4;
    assert_eq!(hart.peek_csr(csr::SEPC), Some(s_entry + 8));
    assert_eq!(hart.privilege(), Privilege::Supervisor);
}

#[test]
fn sfence_refreshes_translation() {
    // same world, but the S code upgrades the RO page to RW in the PTE,
    // fences, and stores through it
    let mut code = vec![
        // satp
        addi(7, 0, 1),
        slli(7, 7, 63),
        lui(28, 0x10),
        addi(28, 28, 1),
        or(7, 7, 28),
        csrrw(0, csr::SATP as u32, 7),
        // MPP = S
        addi(29, 0, 3),
        slli(29, 29, 11),
        csrrc(0, csr::MSTATUS as u32, 29),
        addi(30, 0, 1),
        slli(30, 30, 11),
        csrrs(0, csr::MSTATUS as u32, 30),
        lui(31, 0x10000),
        addi(31, 31, 0), // patched
        csrrw(0, csr::MEPC as u32, 31),
        mret(),
    ];
    let s_entry = code.len() as i32 * 4;
    code.extend([
        lui(10, 0x20000),
        lw(11, 10, 0), // warm the TLB through the RO mapping
        // leaf[0] |= W|D, through the identity mapping of RAM
        lui(12, 0x10003),
        ld(13, 12, 0),
        addi(14, 0, (PTE_W | PTE_D) as i32),
        or(13, 13, 14),
        sd(13, 12, 0),
        sfence_vma(0, 0),
        addi(15, 0, 77),
        sw(15, 10, 0), // now legal
        lw(16, 10, 0),
        wfi(),
    ]);
    code[13] = addi(31, 31, s_entry);

    let (machine, mut hart) = machine(false, &code);
    build_page_tables(&machine);

    run_to_wfi(&mut hart, 1000);
    assert_eq!(hart.x(11), 0x1234);
    assert_eq!(hart.x(16), 77);
    assert_eq!(hart.privilege(), Privilege::Supervisor);
}

#[test]
fn fetch_straddling_page_boundary_faults_on_second_half() {
    // a 4-byte instruction whose second half lies on an unmapped page:
    // place a 32-bit instruction at the last halfword of the mapped code
    // megapage... too big to arrange here with one megapage, so arrange it
    // with the RO page instead: jump to (ro_page_end - 2) where a 32-bit
    // encoding begins, its second half unmapped.
    let mut code = vec![
        lui(5, 8),
        csrrs(0, csr::MEDELEG as u32, 5), // delegate store pf (unused)
        // delegate instruction page faults (bit 12)
        lui(5, 1),
        csrrs(0, csr::MEDELEG as u32, 5),
        lui(6, 0x10000),
        addi(6, 6, 0), // patched: stvec
        csrrw(0, csr::STVEC as u32, 6),
        addi(7, 0, 1),
        slli(7, 7, 63),
        lui(28, 0x10),
        addi(28, 28, 1),
        or(7, 7, 28),
        csrrw(0, csr::SATP as u32, 7),
        addi(29, 0, 3),
        slli(29, 29, 11),
        csrrc(0, csr::MSTATUS as u32, 29),
        addi(30, 0, 1),
        slli(30, 30, 11),
        csrrs(0, csr::MSTATUS as u32, 30),
        lui(31, 0x10000),
        addi(31, 31, 0), // patched: mepc
        csrrw(0, csr::MEPC as u32, 31),
        mret(),
    ];
    let s_entry = code.len() as i32 * 4;
    code.extend([
        // jump to the last halfword of the executable RO page
        lui(10, 0x20001),
        addi(10, 10, -2),
        jalr(0, 10, 0),
    ]);
    let handler = code.len() as i32 * 4;
    code.push(wfi());
    code[5] = addi(6, 6, handler);
    code[20] = addi(31, 31, s_entry);

    let (machine, mut hart) = machine(false, &code);
    build_page_tables(&machine);
    // make the RO page executable too
    let leaf0: u64 = ((RAM_BASE + 0x6000) >> 12) << 10 | PTE_V | PTE_R | PTE_X | PTE_A;
    machine.ram_write(RAM_BASE + 0x3000, &leaf0.to_le_bytes()).unwrap();
    // plant the low half of a 32-bit encoding at its end (low 2 bits 0b11)
    machine.ram_write(RAM_BASE + 0x6000 + 4094, &0xFFFFu16.to_le_bytes()).unwrap();

    run_to_wfi(&mut hart, 1000);

    // instruction page fault, reporting the *second* half's address
    assert_eq!(hart.peek_csr(csr::SCAUSE), Some(12));
    assert_eq!(hart.peek_csr(csr::STVAL), Some(0x2000_1000));
}
