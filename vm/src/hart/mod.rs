// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A hart: architectural state plus the top-level dispatch loop.

mod shared;

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::mpsc;

use kestrel_riscv::{Interrupt, Privilege, Trap, Xlen};
use kestrel_riscv::csr::{ip, mstatus};

pub(crate) use shared::HartShared;

use crate::csr::CsrFile;
use crate::machine::Machine;
use crate::mem::{PhysAddr, VirtAddr};
use crate::mmu::{Access, Tlb};
use crate::trap::Fault;
use crate::{interp, jit, mmu, trap};

/// The part of a hart addressed directly by emitted code. Kept `repr(C)` so
/// the field offsets the backends bake into instructions are stable.
#[repr(C)]
pub struct HartState {
    /// Integer register file. `x0` is stored but never written.
    pub regs: [u64; 32],
    /// Floating-point register file, NaN-boxed for single precision.
    pub fregs: [u64; 32],
    pub pc: u64,
    /// Points at the owning hart's [`HartShared::exit_request`]; compiled
    /// blocks poll it at every entry.
    pub(crate) exit_req: *const AtomicU32,
    /// Set by the JIT memory helpers when a guest access faulted. The block
    /// returns immediately and the loop delivers the recorded trap.
    pub(crate) trap_pending: u32,
    _pad: u32,
    pub(crate) trap_cause: u64,
    pub(crate) trap_tval: u64,
    /// Guest instructions retired inside compiled code since the loop last
    /// drained it into the architectural counters.
    pub(crate) jit_instret: u64,
}

/// LR reservation: address, width and the value observed at `lr` time. The
/// matching `sc` resolves as a compare-and-swap against that value, which
/// also catches stores from other harts without a global registry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reservation {
    pub addr: PhysAddr,
    pub width: u64,
    pub value: u64,
}

/// Hart run states. `Trapped` only exists between fault detection and
/// delivery inside one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Trapped,
    WaitingForInterrupt,
    Paused,
    Stopped,
}

/// Cross-hart requests, drained at the top of every loop iteration.
#[derive(Debug)]
pub(crate) enum RequestKind {
    /// Remote `sfence.vma`. `None` operands mean "all".
    SfenceVma { vaddr: Option<u64>, asid: Option<u16> },
    /// Remote `fence.i`: come to the dispatcher so dirty bits are observed.
    FenceI,
    Pause,
    Resume,
    /// Reset to the given program counter in M-mode.
    Reset { pc: u64 },
    PowerOff,
}

pub(crate) struct Request {
    pub kind: RequestKind,
    /// Present when the sender blocks on acknowledgement.
    pub ack: Option<mpsc::SyncSender<()>>,
}

/// Direct-mapped execution counters backing the JIT promotion policy.
struct HotSlot {
    pc: u64,
    count: u32,
}

const HOT_SLOTS: usize = 256;

pub struct Hart {
    pub(crate) id: usize,
    pub(crate) xlen: Xlen,
    pub(crate) state: HartState,
    pub(crate) csr: CsrFile,
    pub(crate) tlb: Tlb,
    pub(crate) privilege: Privilege,
    pub(crate) reservation: Option<Reservation>,
    pub(crate) run_state: RunState,
    pub(crate) shared: Arc<HartShared>,
    machine: Arc<Machine>,
    requests: mpsc::Receiver<Request>,
    hot: Vec<HotSlot>,
}

impl Hart {
    pub(crate) fn new(
        id: usize,
        machine: Arc<Machine>,
        shared: Arc<HartShared>,
        requests: mpsc::Receiver<Request>,
    ) -> Self {
        let cfg = machine.config();
        let xlen = cfg.xlen;
        let csr = CsrFile::new(xlen, id as u64, Arc::clone(&shared), machine.irq_arc());
        let exit_req = &shared.exit_request as *const AtomicU32;
        let mut hart = Self {
            id,
            xlen,
            state: HartState {
                regs: [0; 32],
                fregs: [0; 32],
                pc: cfg.reset_vector,
                exit_req,
                trap_pending: 0,
                _pad: 0,
                trap_cause: 0,
                trap_tval: 0,
                jit_instret: 0,
            },
            csr,
            tlb: Tlb::new(),
            privilege: Privilege::Machine,
            reservation: None,
            run_state: RunState::Running,
            shared,
            machine,
            requests,
            hot: Vec::new(),
        };
        hart.hot = (0..HOT_SLOTS).map(|_| HotSlot { pc: 0, count: 0 }).collect();
        hart
    }

    #[inline]
    pub(crate) fn machine(&self) -> &Machine {
        &self.machine
    }

    #[inline]
    pub(crate) fn machine_arc(&self) -> Arc<Machine> {
        Arc::clone(&self.machine)
    }

    /// Integer register read; `x0` is architecturally zero.
    #[inline]
    pub fn x(&self, reg: u8) -> u64 {
        self.state.regs[reg as usize & 31]
    }

    /// Integer register write, canonicalized to the hart's XLEN. Writes to
    /// `x0` are discarded.
    #[inline]
    pub fn set_x(&mut self, reg: u8, value: u64) {
        if reg != 0 {
            self.state.regs[reg as usize & 31] = self.xlen.canonicalize(value);
        }
    }

    #[inline]
    pub fn pc(&self) -> u64 {
        self.state.pc
    }

    #[inline]
    pub fn set_pc(&mut self, pc: u64) {
        self.state.pc = self.xlen.canonicalize(pc);
    }

    #[inline]
    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    #[inline]
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Returns a waiting or paused hart to `Running`. Embedders driving the
    /// loop inline use this in place of the thread parker.
    pub fn wake(&mut self) {
        if matches!(self.run_state, RunState::WaitingForInterrupt | RunState::Paused) {
            self.run_state = RunState::Running;
        }
    }

    /// Reads a CSR with machine privilege; embedder/test introspection.
    pub fn peek_csr(&self, addr: u16) -> Option<u64> {
        self.csr.read(addr, Privilege::Machine).ok()
    }

    /// Runs the hart until it powers off.
    pub fn run(&mut self) {
        tracing::debug!(hart = self.id, "hart entering run loop");
        while self.run_state != RunState::Stopped {
            match self.run_state {
                RunState::Running => self.step(),
                RunState::WaitingForInterrupt => self.wait_for_interrupt(),
                RunState::Paused => self.wait_while_paused(),
                RunState::Trapped | RunState::Stopped => {}
            }
        }
        tracing::debug!(hart = self.id, "hart stopped");
    }

    /// One loop iteration: drain requests, take a deliverable interrupt,
    /// then execute through the JIT or the interpreter.
    pub fn step(&mut self) {
        // safe point: everything cross-hart happens against this boundary
        if self.shared.exit_requested() {
            self.shared.clear_exit_request();
        }
        self.drain_requests();
        if self.run_state != RunState::Running {
            return;
        }

        if self.tlb.epoch != self.machine.epoch() {
            self.tlb.epoch = self.machine.epoch();
            self.tlb.flush_all();
        }

        if let Some(interrupt) = self.pending_interrupt() {
            let pc = self.state.pc;
            trap::deliver(self, Trap::Interrupt(interrupt), 0, pc);
            return;
        }

        let pc = self.state.pc;
        let phys = match mmu::translate(self, VirtAddr::new(pc), Access::Fetch) {
            Ok(phys) => phys,
            Err(fault) => {
                self.take_fault(fault, pc);
                return;
            }
        };

        if jit::dispatch(self, phys) {
            return;
        }

        // cold path: interpret one instruction
        if let Err(fault) = interp::step(self, phys) {
            self.take_fault(fault, pc);
        } else {
            self.csr.instret = self.csr.instret.wrapping_add(1);
            self.csr.cycle = self.csr.cycle.wrapping_add(1);
        }
    }

    /// Synchronous fault path: `Trapped` for the duration of delivery.
    pub(crate) fn take_fault(&mut self, fault: Fault, epc: u64) {
        self.run_state = RunState::Trapped;
        trap::deliver(self, Trap::Exception(fault.cause), fault.tval, epc);
        self.run_state = RunState::Running;
    }

    /// Highest-priority deliverable interrupt, if any: machine-level bits
    /// first (MEI, MSI, MTI), then supervisor (SEI, SSI, STI).
    pub(crate) fn pending_interrupt(&self) -> Option<Interrupt> {
        const M_ORDER: [u64; 3] = [ip::MEIP, ip::MSIP, ip::MTIP];
        const S_ORDER: [u64; 3] = [ip::SEIP, ip::SSIP, ip::STIP];

        let pending = self.csr.mip() & self.csr.mie;
        if pending == 0 {
            return None;
        }

        let m_pending = pending & !self.csr.mideleg;
        let m_enabled = self.privilege < Privilege::Machine
            || self.csr.mstatus & mstatus::MIE != 0;
        if m_pending != 0 && m_enabled {
            for mask in M_ORDER.into_iter().chain(S_ORDER) {
                if m_pending & mask != 0 {
                    return Interrupt::try_from(mask.trailing_zeros() as u64).ok();
                }
            }
        }

        let s_pending = pending & self.csr.mideleg;
        let s_enabled = self.privilege < Privilege::Supervisor
            || (self.privilege == Privilege::Supervisor
                && self.csr.mstatus & mstatus::SIE != 0);
        if s_pending != 0 && s_enabled {
            for mask in S_ORDER {
                if s_pending & mask != 0 {
                    return Interrupt::try_from(mask.trailing_zeros() as u64).ok();
                }
            }
        }
        None
    }

    /// WFI: parked until an interrupt becomes pending (enabled by `mie`,
    /// regardless of global enables) or a request arrives.
    fn wait_for_interrupt(&mut self) {
        if self.csr.mip() & self.csr.mie != 0 || self.shared.exit_requested() {
            self.shared.clear_exit_request();
            self.run_state = RunState::Running;
            return;
        }
        self.drain_requests();
        if self.run_state != RunState::WaitingForInterrupt {
            return;
        }
        if self.csr.mip() & self.csr.mie != 0 {
            self.run_state = RunState::Running;
            return;
        }
        self.shared.park();
        if self.run_state == RunState::WaitingForInterrupt {
            self.run_state = RunState::Running;
        }
    }

    fn wait_while_paused(&mut self) {
        self.drain_requests();
        if self.run_state == RunState::Paused {
            self.shared.park();
        }
    }

    fn drain_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            tracing::trace!(hart = self.id, kind = ?request.kind, "hart request");
            match request.kind {
                RequestKind::SfenceVma { vaddr, asid } => self.sfence_local(vaddr, asid),
                // returning to the dispatcher is all that is needed: dirty
                // bits were set by the requester before the kick
                RequestKind::FenceI => {}
                RequestKind::Pause => self.run_state = RunState::Paused,
                RequestKind::Resume => {
                    if self.run_state == RunState::Paused {
                        self.run_state = RunState::Running;
                    }
                }
                RequestKind::Reset { pc } => self.reset(pc),
                RequestKind::PowerOff => self.run_state = RunState::Stopped,
            }
            if let Some(ack) = request.ack {
                let _ = ack.send(());
            }
        }
    }

    /// The local effect of `sfence.vma`, also used for remote shootdowns.
    pub(crate) fn sfence_local(&mut self, vaddr: Option<u64>, asid: Option<u16>) {
        match (vaddr, asid) {
            (None, None) => self.tlb.flush_all(),
            (Some(vaddr), None) => self.tlb.flush_vaddr(VirtAddr::new(vaddr)),
            (None, Some(asid)) => self.tlb.flush_asid(asid),
            (Some(vaddr), Some(asid)) => self.tlb.flush_vaddr_asid(VirtAddr::new(vaddr), asid),
        }
    }

    fn reset(&mut self, pc: u64) {
        self.state.regs = [0; 32];
        self.state.fregs = [0; 32];
        self.state.pc = pc;
        self.state.trap_pending = 0;
        self.state.jit_instret = 0;
        self.privilege = Privilege::Machine;
        self.reservation = None;
        self.tlb.flush_all();
        let irq = self.machine.irq_arc();
        self.csr = CsrFile::new(self.xlen, self.id as u64, Arc::clone(&self.shared), irq);
        self.run_state = RunState::Running;
    }

    /// Bumps the execution counter for `phys` and reports whether it crossed
    /// the promotion threshold.
    pub(crate) fn note_hot(&mut self, phys: PhysAddr) -> bool {
        let slot = &mut self.hot[(phys.get() as usize >> 1) % HOT_SLOTS];
        if slot.pc == phys.get() {
            slot.count = slot.count.saturating_add(1);
            slot.count >= self.machine.config().jit_threshold
        } else {
            slot.pc = phys.get();
            slot.count = 1;
            false
        }
    }

    /// Forgets the execution count for `phys`; used when compilation at that
    /// PC was declined, so the dispatcher stops retrying every iteration.
    pub(crate) fn reset_hot(&mut self, phys: PhysAddr) {
        let slot = &mut self.hot[(phys.get() as usize >> 1) % HOT_SLOTS];
        if slot.pc == phys.get() {
            slot.count = 0;
        }
    }

    /// Folds instructions retired in compiled code into the architectural
    /// counters.
    pub(crate) fn sync_jit_counters(&mut self) {
        let delta = core::mem::take(&mut self.state.jit_instret);
        self.csr.instret = self.csr.instret.wrapping_add(delta);
        self.csr.cycle = self.csr.cycle.wrapping_add(delta);
    }
}

// Safety: the raw `exit_req` pointer targets an `AtomicU32` inside the
// `Arc<HartShared>` the hart also owns, so it stays valid for the hart's
// lifetime and is safe to send across threads with it.
unsafe impl Send for Hart {}
