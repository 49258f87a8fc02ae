// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The machine: the shared container every hart borrows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

use anyhow::Context;

use crate::config::MachineConfig;
use crate::hart::{Hart, HartShared, Request, RequestKind};
use crate::irq::IrqController;
use crate::jit::{self, CodeHeap};
use crate::mem::{MmioDevice, PhysAddr, PhysMemory};

pub struct Machine {
    config: MachineConfig,
    pub(crate) mem: PhysMemory,
    code: Option<CodeHeap>,
    irq: Arc<IrqController>,
    /// Bumped by every machine-wide invalidation; harts drop their TLBs when
    /// they observe a change.
    epoch: AtomicU64,
    shared: Vec<Arc<HartShared>>,
    senders: Vec<mpsc::Sender<Request>>,
    /// Harts not yet running on a thread (or taken by the embedder).
    parked_harts: Mutex<Vec<Hart>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Machine {
    /// Builds a machine per `config`: RAM, code heap, interrupt controller
    /// and one reset hart per configured hart.
    ///
    /// # Errors
    ///
    /// Host resource failures (mapping RAM or the code heap) and invalid
    /// configuration.
    pub fn new(config: MachineConfig) -> anyhow::Result<Arc<Self>> {
        let mem = PhysMemory::new(config.ram_base, config.ram_size)
            .context("mapping guest RAM")?;

        let code = if config.jit && jit::supported(config.xlen) {
            Some(CodeHeap::new(config.jit_heap_size).context("mapping the code heap")?)
        } else {
            None
        };

        let shared: Vec<_> = (0..config.harts).map(|_| Arc::new(HartShared::new())).collect();
        let irq = Arc::new(IrqController::new(shared.clone()));

        let mut senders = Vec::with_capacity(config.harts);
        let mut receivers = Vec::with_capacity(config.harts);
        for _ in 0..config.harts {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let machine = Arc::new(Self {
            config,
            mem,
            code,
            irq,
            epoch: AtomicU64::new(0),
            shared,
            senders,
            parked_harts: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        });

        // the harts need the machine Arc, so they are created afterwards
        let harts = receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| {
                Hart::new(id, Arc::clone(&machine), Arc::clone(&machine.shared[id]), rx)
            })
            .collect();
        *machine.parked_harts.lock().expect("machine poisoned") = harts;

        tracing::info!(
            harts = machine.config.harts,
            ram = machine.config.ram_size,
            jit = machine.code.is_some(),
            "machine created"
        );
        Ok(machine)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn irq(&self) -> &IrqController {
        &self.irq
    }

    pub(crate) fn irq_arc(&self) -> Arc<IrqController> {
        Arc::clone(&self.irq)
    }

    #[inline]
    pub(crate) fn code_heap(&self) -> Option<&CodeHeap> {
        self.code.as_ref()
    }

    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Takes one constructed hart out of the machine to drive inline (an
    /// embedder's single-threaded loop, or a test). `None` once started or
    /// already taken.
    pub fn take_hart(&self, id: usize) -> Option<Hart> {
        let mut parked = self.parked_harts.lock().expect("machine poisoned");
        let index = parked.iter().position(|hart| hart.id == id)?;
        Some(parked.swap_remove(index))
    }

    /// Spawns one OS thread per remaining hart and starts them.
    pub fn start(&self) {
        let harts = std::mem::take(&mut *self.parked_harts.lock().expect("machine poisoned"));
        let mut threads = self.threads.lock().expect("machine poisoned");
        for mut hart in harts {
            let thread = std::thread::Builder::new()
                .name(format!("hart{}", hart.id))
                .spawn(move || hart.run())
                .expect("spawning hart thread");
            threads.push(thread);
        }
    }

    /// Requests every hart to power off and waits for their threads.
    pub fn stop(&self) {
        for id in 0..self.config.harts {
            let _ = self.send_request(id, RequestKind::PowerOff, false);
        }
        let threads = std::mem::take(&mut *self.threads.lock().expect("machine poisoned"));
        for thread in threads {
            let _ = thread.join();
        }
    }

    /// Sends a request to a hart, optionally blocking until it acknowledges.
    pub(crate) fn send_request(&self, hart: usize, kind: RequestKind, wait: bool) -> bool {
        let Some(sender) = self.senders.get(hart) else {
            return false;
        };
        let (ack_tx, ack_rx) = if wait {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        if sender.send(Request { kind, ack: ack_tx }).is_err() {
            return false;
        }
        self.shared[hart].kick();
        if let Some(rx) = ack_rx {
            return rx.recv().is_ok();
        }
        true
    }

    /// Remote `sfence.vma` towards one hart; blocks until acknowledged, the
    /// contract that makes shootdowns synchronous.
    pub fn sfence_remote(&self, hart: usize, vaddr: Option<u64>, asid: Option<u16>) {
        self.send_request(hart, RequestKind::SfenceVma { vaddr, asid }, true);
    }

    pub fn pause_hart(&self, hart: usize) {
        self.send_request(hart, RequestKind::Pause, true);
    }

    pub fn resume_hart(&self, hart: usize) {
        self.send_request(hart, RequestKind::Resume, false);
    }

    pub fn reset_hart(&self, hart: usize, pc: u64) {
        self.send_request(hart, RequestKind::Reset { pc }, true);
    }

    /// `fence.i` semantics, from a guest instruction or an embedder: every
    /// page becomes suspect and every hart returns to its dispatcher before
    /// running another block. Asynchronous by contract.
    pub(crate) fn fence_i(&self, from_hart: usize) {
        self.mem.mark_all_dirty();
        for (id, shared) in self.shared.iter().enumerate() {
            if id != from_hart {
                shared.kick();
            }
            let _ = self.senders[id].send(Request { kind: RequestKind::FenceI, ack: None });
        }
    }

    /// Runs `f` with the code heap held exclusively. Every hart is kicked
    /// out of compiled code first so the write lock cannot deadlock against
    /// a hart spinning inside a linked loop.
    pub(crate) fn with_heap_exclusive<R>(
        &self,
        f: impl FnOnce(&mut crate::jit::HeapInner) -> R,
    ) -> R {
        let heap = self.code.as_ref().expect("heap access without jit");
        for shared in &self.shared {
            shared.kick();
        }
        let mut inner = heap.inner.write().expect("code heap poisoned");
        f(&mut inner)
    }

    /// Flushes the code heap: all blocks, all links, all dirty bits, and a
    /// new epoch.
    pub(crate) fn heap_flush(&self) {
        if self.code.is_none() {
            return;
        }
        self.with_heap_exclusive(|inner| inner.flush(&self.mem.dirty, &self.epoch));
    }

    /// Number of global code-heap flushes so far.
    pub fn jit_flushes(&self) -> u64 {
        self.code
            .as_ref()
            .map_or(0, |heap| heap.inner.read().expect("code heap poisoned").flushes())
    }

    // ---- device-model interface ----

    /// Registers an MMIO region. See [`MmioDevice`].
    ///
    /// # Errors
    ///
    /// Overlapping an existing region.
    pub fn mmio_register(
        &self,
        base: u64,
        size: u64,
        dev: Arc<dyn MmioDevice>,
    ) -> crate::Result<()> {
        self.mem.register_mmio(base, size, dev)
    }

    /// # Errors
    ///
    /// No region registered at `base`.
    pub fn mmio_unregister(&self, base: u64) -> crate::Result<()> {
        self.mem.unregister_mmio(base)
    }

    /// Reads guest RAM (or MMIO) on behalf of a device or loader.
    ///
    /// # Errors
    ///
    /// [`crate::mem::BusError`] outside backed ranges.
    pub fn ram_read(&self, addr: u64, buf: &mut [u8]) -> Result<(), crate::mem::BusError> {
        self.mem.read(PhysAddr::new(addr), buf)
    }

    /// Writes guest RAM on behalf of a device or loader; marks pages dirty.
    ///
    /// # Errors
    ///
    /// [`crate::mem::BusError`] outside backed ranges.
    pub fn ram_write(&self, addr: u64, buf: &[u8]) -> Result<(), crate::mem::BusError> {
        self.mem.write(PhysAddr::new(addr), buf)
    }

    /// Marks pages touched by DMA so stale translations retire.
    pub fn dma_mark_dirty(&self, addr: u64, len: u64) {
        self.mem.dma_mark_dirty(PhysAddr::new(addr), len);
    }
}
