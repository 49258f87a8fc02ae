// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use kestrel_riscv::Xlen;

/// Machine construction parameters.
///
/// The defaults describe the common case: a single RV64 hart, 128 MiB of RAM
/// at the conventional DRAM base, JIT enabled where the host supports it.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Guest physical address where RAM begins. Page-aligned.
    pub ram_base: u64,
    /// Guest RAM size in bytes. Page-aligned.
    pub ram_size: u64,
    /// Number of harts.
    pub harts: usize,
    /// Base integer width of all harts.
    pub xlen: Xlen,
    /// Address of the first instruction executed at reset, in M-mode.
    pub reset_vector: u64,
    /// Whether to translate hot traces to host code.
    pub jit: bool,
    /// Size of the executable code heap in bytes.
    pub jit_heap_size: usize,
    /// Number of dispatches of the same physical PC before the tracer is
    /// invoked. Re-tune against real guests before changing the default.
    pub jit_threshold: u32,
    /// Maximum number of guest instructions translated into one block.
    pub jit_max_block: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_base: 0x8000_0000,
            ram_size: 128 * 1024 * 1024,
            harts: 1,
            xlen: Xlen::Rv64,
            reset_vector: 0x8000_0000,
            jit: true,
            jit_heap_size: 48 * 1024 * 1024,
            jit_threshold: 8,
            jit_max_block: 256,
        }
    }
}
