// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Trap cause codes.
//!
//! These are the architectural `mcause`/`scause` encodings. The engine keeps
//! causes in this typed form until the moment they are written into a guest
//! CSR by trap delivery.

use core::fmt;
use core::fmt::Formatter;

/// A trap cause, either synchronous or an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Interrupt(Interrupt),
    Exception(Exception),
}

impl Trap {
    /// Encodes the cause for an XLEN-bit `mcause`/`scause` register.
    #[inline]
    #[must_use]
    pub fn to_bits(self, xlen_bits: u32) -> u64 {
        match self {
            Trap::Interrupt(interrupt) => 1 << (u64::from(xlen_bits) - 1) | interrupt as u64,
            Trap::Exception(exception) => exception as u64,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoft = 1,
    MachineSoft = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl Interrupt {
    /// The `mip`/`mie` bit corresponding to this interrupt.
    #[inline]
    #[must_use]
    pub fn mask(self) -> u64 {
        1 << (self as u64)
    }
}

impl TryFrom<u64> for Interrupt {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::SupervisorSoft),
            3 => Ok(Self::MachineSoft),
            5 => Ok(Self::SupervisorTimer),
            7 => Ok(Self::MachineTimer),
            9 => Ok(Self::SupervisorExternal),
            11 => Ok(Self::MachineExternal),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address misaligned
    InstructionMisaligned = 0,
    /// Instruction access fault
    InstructionFault = 1,
    /// Illegal instruction
    IllegalInstruction = 2,
    /// Breakpoint
    Breakpoint = 3,
    /// Load address misaligned
    LoadMisaligned = 4,
    /// Load access fault
    LoadFault = 5,
    /// Store/AMO address misaligned
    StoreMisaligned = 6,
    /// Store/AMO access fault
    StoreFault = 7,
    /// Environment call from U-mode
    UserEnvCall = 8,
    /// Environment call from S-mode
    SupervisorEnvCall = 9,
    /// Environment call from M-mode
    MachineEnvCall = 11,
    /// Instruction page fault
    InstructionPageFault = 12,
    /// Load page fault
    LoadPageFault = 13,
    /// Store/AMO page fault
    StorePageFault = 15,
}

impl TryFrom<u64> for Exception {
    type Error = ();

    #[inline]
    fn try_from(nr: u64) -> Result<Self, Self::Error> {
        match nr {
            0 => Ok(Self::InstructionMisaligned),
            1 => Ok(Self::InstructionFault),
            2 => Ok(Self::IllegalInstruction),
            3 => Ok(Self::Breakpoint),
            4 => Ok(Self::LoadMisaligned),
            5 => Ok(Self::LoadFault),
            6 => Ok(Self::StoreMisaligned),
            7 => Ok(Self::StoreFault),
            8 => Ok(Self::UserEnvCall),
            9 => Ok(Self::SupervisorEnvCall),
            11 => Ok(Self::MachineEnvCall),
            12 => Ok(Self::InstructionPageFault),
            13 => Ok(Self::LoadPageFault),
            15 => Ok(Self::StorePageFault),
            _ => Err(()),
        }
    }
}

impl Exception {
    /// The `medeleg` bit corresponding to this exception.
    #[inline]
    #[must_use]
    pub fn mask(self) -> u64 {
        1 << (self as u64)
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Interrupt(i) => write!(f, "interrupt {i:?}"),
            Trap::Exception(e) => write!(f, "exception {e:?}"),
        }
    }
}
