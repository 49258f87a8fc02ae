// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-block register allocator.
//!
//! Maps guest integer registers onto the backend's pool for the duration of
//! one block, with LRU reclaim and a dirty/clean spill discipline. Guest
//! registers whose value is a compile-time constant (`lui`, `auipc`) are
//! carried unmaterialized until first read, which is what folds PC-relative
//! address formation into the later add.

use super::backend::{Emitter, HostReg};

#[derive(Clone, Copy)]
enum Slot {
    /// Lives in the hart's register file only.
    Unmapped,
    /// Mapped to a host register.
    Reg { host: HostReg, dirty: bool, last_use: u32 },
    /// Known constant, not yet materialized. Always logically dirty.
    Const { value: u64 },
}

pub(crate) struct RegAlloc {
    slots: [Slot; 32],
    /// Host registers currently handed out to nobody.
    free: u32,
    /// Pool registers that may not be reclaimed within this instruction.
    pinned: u32,
    /// Temporaries handed out since the last [`Self::begin_instr`].
    temps: u32,
    /// Callee-saved pool registers the block has touched.
    abireclaim: u32,
    callee_saved: u32,
    clock: u32,
}

impl RegAlloc {
    pub(crate) fn new(pool: u32, caller_saved: u32) -> Self {
        Self {
            slots: [Slot::Unmapped; 32],
            free: pool,
            pinned: 0,
            temps: 0,
            abireclaim: 0,
            callee_saved: pool & !caller_saved,
            clock: 0,
        }
    }

    /// Starts a new guest instruction: pins reset, temporaries return to the
    /// pool, the LRU clock ticks.
    pub(crate) fn begin_instr(&mut self) {
        self.free |= self.temps;
        self.temps = 0;
        self.pinned = 0;
        self.clock += 1;
    }

    /// Maps a guest register for reading; `guest` must not be `x0`.
    pub(crate) fn read<E: Emitter>(&mut self, em: &mut E, guest: u8) -> HostReg {
        debug_assert_ne!(guest, 0);
        match self.slots[guest as usize] {
            Slot::Reg { host, dirty, .. } => {
                self.slots[guest as usize] =
                    Slot::Reg { host, dirty, last_use: self.clock };
                self.pinned |= 1 << host;
                host
            }
            Slot::Unmapped => {
                let host = self.claim(em);
                em.emit_get(host, guest);
                self.slots[guest as usize] =
                    Slot::Reg { host, dirty: false, last_use: self.clock };
                self.pinned |= 1 << host;
                host
            }
            Slot::Const { value } => {
                let host = self.claim(em);
                em.emit_imm(host, value);
                self.slots[guest as usize] =
                    Slot::Reg { host, dirty: true, last_use: self.clock };
                self.pinned |= 1 << host;
                host
            }
        }
    }

    /// Maps a guest register for writing; the old value is not loaded.
    /// `guest` must not be `x0` (the frontend discards those writes).
    pub(crate) fn write<E: Emitter>(&mut self, em: &mut E, guest: u8) -> HostReg {
        debug_assert_ne!(guest, 0);
        let host = match self.slots[guest as usize] {
            Slot::Reg { host, .. } => host,
            Slot::Unmapped | Slot::Const { .. } => self.claim(em),
        };
        self.slots[guest as usize] = Slot::Reg { host, dirty: true, last_use: self.clock };
        self.pinned |= 1 << host;
        host
    }

    /// Records a compile-time constant value for a guest register.
    pub(crate) fn set_const(&mut self, guest: u8, value: u64) {
        debug_assert_ne!(guest, 0);
        if let Slot::Reg { host, .. } = self.slots[guest as usize] {
            self.free |= 1 << host;
        }
        self.slots[guest as usize] = Slot::Const { value };
    }

    /// The carried constant of a guest register, if it has one.
    pub(crate) fn const_of(&self, guest: u8) -> Option<u64> {
        match self.slots[guest as usize] {
            Slot::Const { value } => Some(value),
            _ => None,
        }
    }

    /// A scratch register holding zero; stands in for `x0` operands.
    pub(crate) fn read_zero<E: Emitter>(&mut self, em: &mut E) -> HostReg {
        let host = self.temp(em);
        em.emit_imm(host, 0);
        host
    }

    /// A free temporary, returned to the pool at the next instruction.
    pub(crate) fn temp<E: Emitter>(&mut self, em: &mut E) -> HostReg {
        let host = self.claim(em);
        self.temps |= 1 << host;
        self.pinned |= 1 << host;
        host
    }

    fn claim<E: Emitter>(&mut self, em: &mut E) -> HostReg {
        if self.free != 0 {
            let host = self.free.trailing_zeros() as HostReg;
            self.free &= !(1 << host);
            self.abireclaim |= 1 << host & self.callee_saved;
            return host;
        }
        self.reclaim(em)
    }

    /// Evicts the least-recently-used unpinned mapping, spilling it first if
    /// dirty.
    fn reclaim<E: Emitter>(&mut self, em: &mut E) -> HostReg {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(guest, slot)| match slot {
                Slot::Reg { host, last_use, .. } if self.pinned & 1 << host == 0 => {
                    Some((guest, *last_use))
                }
                _ => None,
            })
            .min_by_key(|&(_, last_use)| last_use)
            .map(|(guest, _)| guest)
            .expect("register pool exhausted with every mapping pinned");

        let Slot::Reg { host, dirty, .. } = self.slots[victim] else {
            unreachable!("victim chosen from mapped slots");
        };
        if dirty {
            em.emit_put(host, victim as u8);
        }
        self.slots[victim] = Slot::Unmapped;
        host
    }

    /// Flushes every dirty mapping (and pending constant) to the hart's
    /// register file. Called before any helper call and at block exit; after
    /// it, no dirty mapping remains.
    pub(crate) fn writeback_all<E: Emitter>(&mut self, em: &mut E) {
        for guest in 1..32u8 {
            match self.slots[guest as usize] {
                Slot::Reg { host, dirty: true, last_use } => {
                    em.emit_put(host, guest);
                    self.slots[guest as usize] =
                        Slot::Reg { host, dirty: false, last_use };
                }
                Slot::Const { value } => {
                    em.emit_put_imm(guest, value);
                    self.slots[guest as usize] = Slot::Unmapped;
                }
                _ => {}
            }
        }
    }

    /// Drops (clean) mappings living in caller-saved registers; the helper
    /// call that just happened clobbered them. Must run after
    /// [`Self::writeback_all`].
    pub(crate) fn drop_caller_saved<E: Emitter>(&mut self) {
        for guest in 1..32usize {
            if let Slot::Reg { host, dirty, .. } = self.slots[guest] {
                if E::CALLER_SAVED & 1 << host != 0 {
                    debug_assert!(!dirty, "caller-saved mapping dirty across a call");
                    self.slots[guest] = Slot::Unmapped;
                    self.free |= 1 << host;
                }
            }
        }
        // temporaries in caller-saved registers are dead too
        self.free |= self.temps & E::CALLER_SAVED;
        self.temps &= !E::CALLER_SAVED;
        self.pinned &= !E::CALLER_SAVED;
    }

    /// Whether any dirty mapping remains; the post-emission invariant check.
    pub(crate) fn any_dirty(&self) -> bool {
        self.slots.iter().any(|slot| {
            matches!(slot, Slot::Reg { dirty: true, .. } | Slot::Const { .. })
        })
    }

    /// Callee-saved registers handed out so far; the trampoline's save set
    /// must cover this.
    pub(crate) fn abireclaim(&self) -> u32 {
        self.abireclaim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_riscv::Xlen;
    use kestrel_riscv::decode::{AluOp, BranchCond};

    use crate::jit::backend::{CodeBuf, Emitter, HostReg};

    /// Records operations instead of machine code.
    struct TraceEmitter {
        buf: CodeBuf,
        log: Vec<String>,
    }

    impl Emitter for TraceEmitter {
        const POOL: u32 = 0b1111 << 4; // four registers: 4..8
        const CALLER_SAVED: u32 = 0b0011 << 4;
        const NATIVE_LINKER: bool = false;
        const SLOT_SIZE: usize = 4;

        fn new(_xlen: Xlen) -> Self {
            Self { buf: CodeBuf::new(), log: Vec::new() }
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
            0
        }
        fn emit_entry(&mut self, _: u64, _: u32) {}
        fn emit_get(&mut self, dst: HostReg, guest: u8) {
            self.log.push(format!("get h{dst} <- x{guest}"));
        }
        fn emit_put(&mut self, src: HostReg, guest: u8) {
            self.log.push(format!("put x{guest} <- h{src}"));
        }
        fn emit_put_imm(&mut self, guest: u8, imm: u64) {
            self.log.push(format!("put x{guest} <- {imm:#x}"));
        }
        fn emit_imm(&mut self, dst: HostReg, imm: u64) {
            self.log.push(format!("imm h{dst} <- {imm:#x}"));
        }
        fn emit_mov(&mut self, _: HostReg, _: HostReg) {}
        fn emit_alu(&mut self, _: AluOp, _: bool, _: HostReg, _: HostReg, _: HostReg) {}
        fn emit_alu_imm(&mut self, _: AluOp, _: bool, _: HostReg, _: HostReg, _: i64) {}
        fn emit_store_pc_imm(&mut self, _: u64) {}
        fn emit_store_pc_reg(&mut self, _: HostReg) {}
        fn emit_call_load(&mut self, _: usize, _: HostReg) {}
        fn emit_call_store(&mut self, _: usize, _: HostReg, _: HostReg) {}
        fn emit_move_ret(&mut self, _: HostReg) {}
        fn emit_trap_check(&mut self) {}
        fn emit_teardown(&mut self) {}
        fn emit_ret(&mut self) {}
        fn emit_exit_slot(&mut self, _: u64) -> usize {
            0
        }
        fn emit_cond_skip(&mut self, _: BranchCond, _: HostReg, _: HostReg, _: usize) {}
        unsafe fn patch_jump(_: *mut u8, _: usize, _: usize) {}
        fn emit_trampoline(_: &mut CodeBuf) {}
    }

    fn setup() -> (TraceEmitter, RegAlloc) {
        (
            TraceEmitter::new(Xlen::Rv64),
            RegAlloc::new(TraceEmitter::POOL, TraceEmitter::CALLER_SAVED),
        )
    }

    #[test]
    fn read_loads_once() {
        let (mut em, mut ra) = setup();
        ra.begin_instr();
        let a = ra.read(&mut em, 5);
        ra.begin_instr();
        let b = ra.read(&mut em, 5);
        assert_eq!(a, b);
        assert_eq!(em.log, vec!["get h4 <- x5"]);
    }

    #[test]
    fn lru_reclaim_spills_dirty() {
        let (mut em, mut ra) = setup();
        // fill the pool with four dirty mappings
        for guest in 1..=4 {
            ra.begin_instr();
            ra.write(&mut em, guest);
        }
        em.log.clear();
        // a fifth mapping must evict x1 (least recently used) with a spill
        ra.begin_instr();
        ra.write(&mut em, 5);
        assert_eq!(em.log, vec!["put x1 <- h4"]);
    }

    #[test]
    fn writeback_clears_dirt() {
        let (mut em, mut ra) = setup();
        ra.begin_instr();
        ra.write(&mut em, 7);
        ra.set_const(3, 0x8000_1000);
        assert!(ra.any_dirty());
        ra.writeback_all(&mut em);
        assert!(!ra.any_dirty());
        assert!(em.log.contains(&"put x7 <- h4".to_string()));
        assert!(em.log.contains(&"put x3 <- 0x80001000".to_string()));
    }

    #[test]
    fn consts_materialize_on_read() {
        let (mut em, mut ra) = setup();
        ra.set_const(9, 0x42);
        ra.begin_instr();
        ra.read(&mut em, 9);
        assert_eq!(em.log, vec!["imm h4 <- 0x42"]);
        // now mapped and dirty: a writeback stores it
        ra.writeback_all(&mut em);
        assert_eq!(em.log.last().unwrap(), "put x9 <- h4");
    }

    #[test]
    fn caller_saved_dropped_after_call() {
        let (mut em, mut ra) = setup();
        ra.begin_instr();
        ra.read(&mut em, 1); // h4, caller-saved
        ra.read(&mut em, 2); // h5, caller-saved
        ra.read(&mut em, 3); // h6, callee-saved
        ra.writeback_all(&mut em);
        ra.drop_caller_saved::<TraceEmitter>();
        em.log.clear();
        ra.begin_instr();
        // x3 survived in h6, x1 must reload
        ra.read(&mut em, 3);
        ra.read(&mut em, 1);
        assert_eq!(em.log, vec!["get h4 <- x1"]);
    }

    #[test]
    fn abireclaim_tracks_callee_saved() {
        let (mut em, mut ra) = setup();
        ra.begin_instr();
        ra.read(&mut em, 1);
        ra.read(&mut em, 2);
        assert_eq!(ra.abireclaim(), 0);
        ra.read(&mut em, 3); // h6 is callee-saved
        assert_eq!(ra.abireclaim(), 1 << 6);
    }
}
