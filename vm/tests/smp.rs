// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-hart memory-model scenarios on real OS threads.

mod common;

use std::time::{Duration, Instant};

use common::*;
use kestrel_vm::{Machine, MachineConfig};

const COUNTER: u64 = RAM_BASE + 0x200;

fn read_u32(machine: &Machine, addr: u64) -> u32 {
    let mut buf = [0u8; 4];
    machine.ram_read(addr, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}

fn wait_for_u32(machine: &Machine, addr: u64, expect: u32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if read_u32(machine, addr) == expect {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out; value = {}",
            read_u32(machine, addr)
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn amoadd_counter_is_exact() {
    const PER_HART: u32 = 250_000;
    // every hart: for i in 0..PER_HART { amoadd.w [counter], 1 }
    let code = [
        lui(10, 0x10000),
        addi(10, 10, 0x200),
        addi(12, 0, 1),
        lui(11, PER_HART >> 12),
        addi(11, 11, (PER_HART & 0xfff) as i32),
        amoadd_w(0, 10, 12),
        addi(11, 11, -1),
        bne(11, 0, -8),
        wfi(),
    ];
    let cfg = MachineConfig { harts: 2, ..config(false) };
    let machine = Machine::new(cfg).unwrap();
    write_words(&machine, RAM_BASE, &code);

    machine.start();
    wait_for_u32(&machine, COUNTER, 2 * PER_HART, Duration::from_secs(60));
    machine.stop();

    assert_eq!(read_u32(&machine, COUNTER), 2 * PER_HART);
}

#[test]
fn lr_sc_spinlock_excludes() {
    const PER_HART: u32 = 50_000;
    const LOCK: u64 = RAM_BASE + 0x300;
    // x10 = lock, x11 = counter, x13 = iterations
    let code = [
        lui(10, 0x10000),
        addi(10, 10, 0x300),
        lui(11, 0x10000),
        addi(11, 11, 0x200),
        lui(13, PER_HART >> 12),
        addi(13, 13, (PER_HART & 0xfff) as i32),
        // acquire:
        lr_w(5, 10),
        bne(5, 0, -4),
        addi(6, 0, 1),
        sc_w(7, 10, 6),
        bne(7, 0, -16),
        // critical section: a plain read-modify-write
        lw(8, 11, 0),
        addi(8, 8, 1),
        sw(8, 11, 0),
        // release
        amoswap_w(0, 10, 0),
        addi(13, 13, -1),
        bne(13, 0, -40),
        wfi(),
    ];
    let cfg = MachineConfig { harts: 4, ..config(false) };
    let machine = Machine::new(cfg).unwrap();
    write_words(&machine, RAM_BASE, &code);

    machine.start();
    wait_for_u32(&machine, COUNTER, 4 * PER_HART, Duration::from_secs(120));
    machine.stop();

    // exact count implies no two harts were ever inside the critical
    // section at once
    assert_eq!(read_u32(&machine, COUNTER), 4 * PER_HART);
    assert_eq!(read_u32(&machine, LOCK), 0);
}

#[test]
fn pause_and_resume() {
    // a hart spinning on a counter increment forever
    let code = [
        lui(10, 0x10000),
        addi(10, 10, 0x200),
        addi(12, 0, 1),
        amoadd_w(0, 10, 12),
        jal(0, -4),
    ];
    let machine = Machine::new(config(false)).unwrap();
    write_words(&machine, RAM_BASE, &code);
    machine.start();

    // let it make progress, pause, and verify the counter stops
    let deadline = Instant::now() + Duration::from_secs(30);
    while read_u32(&machine, COUNTER) < 1000 {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    machine.pause_hart(0);
    let frozen = read_u32(&machine, COUNTER);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(read_u32(&machine, COUNTER), frozen);

    machine.resume_hart(0);
    let deadline = Instant::now() + Duration::from_secs(30);
    while read_u32(&machine, COUNTER) == frozen {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    machine.stop();
}
