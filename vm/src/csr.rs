// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-hart CSR bank.
//!
//! Reads and writes dispatch through [`CsrFile::read`]/[`CsrFile::write`],
//! which enforce the privilege and read-only encodings of the address and
//! apply WARL masking. Side effects that the caller must act on (TLB flush
//! after an `satp` write) are reported through [`CsrEffect`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use kestrel_riscv::csr::{self, Fflags, mstatus, ip, misa};
use kestrel_riscv::{Privilege, Xlen};

use crate::hart::HartShared;
use crate::irq::IrqController;
use crate::mmu::Pmp;

/// Access rejected: unimplemented address, insufficient privilege, write to
/// a read-only register, or a TVM/counter-enable violation. Always becomes
/// an illegal-instruction trap with the instruction word as `tval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CsrError;

/// What the executor must do after a successful CSR write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CsrEffect {
    pub flush_tlb: bool,
}

pub(crate) struct CsrFile {
    xlen: Xlen,
    hart_id: u64,
    shared: Arc<HartShared>,
    irq: Arc<IrqController>,

    pub mstatus: u64,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mie: u64,
    pub mtvec: u64,
    pub mcounteren: u64,
    pub menvcfg: u64,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,

    pub stvec: u64,
    pub scounteren: u64,
    pub senvcfg: u64,
    pub sscratch: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub satp: u64,

    pub fflags: Fflags,
    pub frm: u8,

    pub cycle: u64,
    pub instret: u64,

    pub pmp: Pmp,
}

impl CsrFile {
    pub(crate) fn new(
        xlen: Xlen,
        hart_id: u64,
        shared: Arc<HartShared>,
        irq: Arc<IrqController>,
    ) -> Self {
        Self {
            xlen,
            hart_id,
            shared,
            irq,
            mstatus: 0,
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mtvec: 0,
            mcounteren: 0,
            menvcfg: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            stvec: 0,
            scounteren: 0,
            senvcfg: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            satp: 0,
            fflags: Fflags::empty(),
            frm: 0,
            cycle: 0,
            instret: 0,
            pmp: Pmp::new(),
        }
    }

    /// Effective pending-interrupt mask, merging device-posted bits.
    #[inline]
    pub(crate) fn mip(&self) -> u64 {
        self.shared.mip.load(Ordering::Acquire) & ip::ALL
    }

    /// Whether the FPU is enabled (`mstatus.FS != Off`).
    #[inline]
    pub(crate) fn fpu_enabled(&self) -> bool {
        self.mstatus & mstatus::FS != 0
    }

    /// Marks the FP state dirty; every FP register or `fcsr` write does this.
    #[inline]
    pub(crate) fn set_fs_dirty(&mut self) {
        self.mstatus |= mstatus::FS;
    }

    fn mstatus_read(&self) -> u64 {
        let mut value = self.mstatus;
        if value & mstatus::FS == mstatus::FS {
            value |= mstatus::sd_bit(self.xlen.bits());
        }
        value
    }

    fn counter_read(&self, addr: csr::Addr, privilege: Privilege) -> Result<u64, CsrError> {
        let bit = match addr {
            csr::CYCLE | csr::CYCLEH => 1 << 0,
            csr::TIME | csr::TIMEH => 1 << 1,
            _ => 1 << 2,
        };
        if privilege < Privilege::Machine && self.mcounteren & bit == 0 {
            return Err(CsrError);
        }
        if privilege == Privilege::User && self.scounteren & bit == 0 {
            return Err(CsrError);
        }
        Ok(match addr {
            csr::CYCLE | csr::CYCLEH => self.cycle,
            csr::TIME | csr::TIMEH => self.irq.mtime.load(Ordering::Acquire),
            _ => self.instret,
        })
    }

    /// Reads a CSR, enforcing the privilege encoded in the address.
    pub(crate) fn read(&self, addr: csr::Addr, privilege: Privilege) -> Result<u64, CsrError> {
        if csr::min_privilege(addr) > privilege as u8 {
            return Err(CsrError);
        }
        let value = match addr {
            csr::FFLAGS if self.fpu_enabled() => self.fflags.bits(),
            csr::FRM if self.fpu_enabled() => u64::from(self.frm),
            csr::FCSR if self.fpu_enabled() => u64::from(self.frm) << 5 | self.fflags.bits(),

            csr::CYCLE | csr::TIME | csr::INSTRET => self.counter_read(addr, privilege)?,
            csr::CYCLEH | csr::TIMEH | csr::INSTRETH if self.xlen == Xlen::Rv32 => {
                self.counter_read(addr, privilege)? >> 32
            }

            csr::SSTATUS => {
                let mut value = self.mstatus & mstatus::SSTATUS_MASK;
                if self.mstatus & mstatus::FS == mstatus::FS {
                    value |= mstatus::sd_bit(self.xlen.bits());
                }
                value
            }
            csr::SIE => self.mie & self.mideleg,
            csr::STVEC => self.stvec,
            csr::SCOUNTEREN => self.scounteren,
            csr::SENVCFG => self.senvcfg,
            csr::SSCRATCH => self.sscratch,
            csr::SEPC => self.sepc,
            csr::SCAUSE => self.scause,
            csr::STVAL => self.stval,
            csr::SIP => self.mip() & self.mideleg,
            csr::SATP => {
                if privilege == Privilege::Supervisor && self.mstatus & mstatus::TVM != 0 {
                    return Err(CsrError);
                }
                self.satp
            }

            csr::MVENDORID | csr::MARCHID | csr::MIMPID | csr::MCONFIGPTR => 0,
            csr::MHARTID => self.hart_id,
            csr::MSTATUS => self.mstatus_read(),
            csr::MSTATUSH if self.xlen == Xlen::Rv32 => 0,
            csr::MISA => misa::mxl(self.xlen.bits()) | misa::IMAFDC_SU,
            csr::MEDELEG => self.medeleg,
            csr::MIDELEG => self.mideleg,
            csr::MIE => self.mie,
            csr::MTVEC => self.mtvec,
            csr::MCOUNTEREN => self.mcounteren,
            csr::MENVCFG => self.menvcfg,
            csr::MSCRATCH => self.mscratch,
            csr::MEPC => self.mepc,
            csr::MCAUSE => self.mcause,
            csr::MTVAL => self.mtval,
            csr::MIP => self.mip(),
            csr::MCYCLE => self.cycle,
            csr::MINSTRET => self.instret,
            csr::MCYCLEH | csr::MINSTRETH if self.xlen == Xlen::Rv32 => {
                match addr {
                    csr::MCYCLEH => self.cycle >> 32,
                    _ => self.instret >> 32,
                }
            }

            _ if self.pmp.is_pmp_addr(addr) => self.pmp.read(addr),

            _ => return Err(CsrError),
        };
        Ok(self.xlen.canonicalize(value))
    }

    /// Writes a CSR, applying the WARL masks of each register.
    #[allow(clippy::too_many_lines, reason = "flat address dispatch")]
    pub(crate) fn write(
        &mut self,
        addr: csr::Addr,
        value: u64,
        privilege: Privilege,
    ) -> Result<CsrEffect, CsrError> {
        if csr::min_privilege(addr) > privilege as u8 || csr::is_read_only(addr) {
            return Err(CsrError);
        }
        let value = match self.xlen {
            Xlen::Rv32 => value & 0xffff_ffff,
            Xlen::Rv64 => value,
        };
        let mut effect = CsrEffect::default();
        match addr {
            csr::FFLAGS if self.fpu_enabled() => {
                self.fflags = Fflags::from_bits_truncate(value);
                self.set_fs_dirty();
            }
            csr::FRM if self.fpu_enabled() => {
                self.frm = (value & 0b111) as u8;
                self.set_fs_dirty();
            }
            csr::FCSR if self.fpu_enabled() => {
                self.fflags = Fflags::from_bits_truncate(value);
                self.frm = ((value >> 5) & 0b111) as u8;
                self.set_fs_dirty();
            }

            csr::SSTATUS => {
                self.mstatus = (self.mstatus & !mstatus::SSTATUS_MASK)
                    | (value & mstatus::SSTATUS_MASK);
            }
            csr::SIE => {
                self.mie = (self.mie & !self.mideleg) | (value & self.mideleg);
            }
            csr::STVEC => self.stvec = warl_tvec(value),
            csr::SCOUNTEREN => self.scounteren = value & 0x7,
            csr::SENVCFG => self.senvcfg = value,
            csr::SSCRATCH => self.sscratch = value,
            csr::SEPC => self.sepc = value & !1,
            csr::SCAUSE => self.scause = value,
            csr::STVAL => self.stval = value,
            csr::SIP => {
                // only SSIP is software-writable from S-mode
                let mask = ip::SSIP & self.mideleg;
                self.write_mip(value, mask);
            }
            csr::SATP => {
                if privilege == Privilege::Supervisor && self.mstatus & mstatus::TVM != 0 {
                    return Err(CsrError);
                }
                // a write selecting a reserved mode is ignored wholesale
                if kestrel_riscv::satp::Satp::from_bits(value, self.xlen).mode().is_some() {
                    self.satp = value;
                    effect.flush_tlb = true;
                }
            }

            csr::MSTATUS => {
                const WRITABLE: u64 = mstatus::SIE
                    | mstatus::MIE
                    | mstatus::SPIE
                    | mstatus::MPIE
                    | mstatus::SPP
                    | mstatus::MPP
                    | mstatus::FS
                    | mstatus::MPRV
                    | mstatus::SUM
                    | mstatus::MXR
                    | mstatus::TVM
                    | mstatus::TW
                    | mstatus::TSR;
                let mut value = (self.mstatus & !WRITABLE) | (value & WRITABLE);
                // MPP is WARL over {U, S, M}
                if (value & mstatus::MPP) >> mstatus::MPP_SHIFT == 2 {
                    value &= !mstatus::MPP;
                }
                self.mstatus = value;
            }
            csr::MSTATUSH if self.xlen == Xlen::Rv32 => {}
            csr::MISA => {}
            csr::MEDELEG => {
                // ecall-from-M can never be delegated
                self.medeleg = value & !(1 << 11);
            }
            csr::MIDELEG => {
                // only supervisor interrupts are delegatable
                self.mideleg = value & ip::S_MASK;
            }
            csr::MIE => self.mie = value & ip::ALL,
            csr::MTVEC => self.mtvec = warl_tvec(value),
            csr::MCOUNTEREN => self.mcounteren = value & 0x7,
            csr::MENVCFG => self.menvcfg = value,
            csr::MSCRATCH => self.mscratch = value,
            csr::MEPC => self.mepc = value & !1,
            csr::MCAUSE => self.mcause = value,
            csr::MTVAL => self.mtval = value,
            csr::MIP => {
                // MSIP/MTIP/MEIP are wired to the interrupt controller and
                // not software-writable through this register
                self.write_mip(value, ip::SSIP | ip::STIP | ip::SEIP);
            }
            csr::MCYCLE => self.cycle = value,
            csr::MINSTRET => self.instret = value,
            csr::MCYCLEH if self.xlen == Xlen::Rv32 => {
                self.cycle = (self.cycle & 0xffff_ffff) | value << 32;
            }
            csr::MINSTRETH if self.xlen == Xlen::Rv32 => {
                self.instret = (self.instret & 0xffff_ffff) | value << 32;
            }

            _ if self.pmp.is_pmp_addr(addr) => self.pmp.write(addr, value, self.xlen),

            _ => return Err(CsrError),
        }
        Ok(effect)
    }

    fn write_mip(&mut self, value: u64, mask: u64) {
        self.shared.mip.fetch_or(value & mask, Ordering::AcqRel);
        self.shared.mip.fetch_and(!(mask & !value), Ordering::AcqRel);
    }
}

/// `{m,s}tvec` WARL: vectored (1) and direct (0) are the only modes.
fn warl_tvec(value: u64) -> u64 {
    if value & 0b10 != 0 { value & !0b11 } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(xlen: Xlen) -> CsrFile {
        let shared = Arc::new(HartShared::new());
        let irq = Arc::new(IrqController::new(vec![Arc::clone(&shared)]));
        CsrFile::new(xlen, 0, shared, irq)
    }

    #[test]
    fn privilege_encoding_enforced() {
        let mut csrs = file(Xlen::Rv64);
        assert_eq!(csrs.read(csr::MSTATUS, Privilege::Supervisor), Err(CsrError));
        assert_eq!(csrs.read(csr::SSTATUS, Privilege::User), Err(CsrError));
        assert!(csrs.read(csr::SSTATUS, Privilege::Supervisor).is_ok());
        // read-only encodings reject writes at any privilege
        assert_eq!(csrs.write(csr::MHARTID, 1, Privilege::Machine), Err(CsrError));
    }

    #[test]
    fn sstatus_is_a_view_of_mstatus() {
        let mut csrs = file(Xlen::Rv64);
        csrs.write(csr::MSTATUS, mstatus::MIE | mstatus::SIE | mstatus::SUM, Privilege::Machine)
            .unwrap();
        let sstatus = csrs.read(csr::SSTATUS, Privilege::Supervisor).unwrap();
        assert_eq!(sstatus & mstatus::SIE, mstatus::SIE);
        assert_eq!(sstatus & mstatus::SUM, mstatus::SUM);
        // MIE is machine-only state and must not leak
        assert_eq!(sstatus & mstatus::MIE, 0);
        // writing sstatus cannot flip machine-only bits
        csrs.write(csr::SSTATUS, 0, Privilege::Supervisor).unwrap();
        assert_ne!(csrs.mstatus & mstatus::MIE, 0);
    }

    #[test]
    fn satp_reserved_mode_is_ignored() {
        let mut csrs = file(Xlen::Rv64);
        let effect = csrs.write(csr::SATP, 8 << 60 | 0x1234, Privilege::Machine).unwrap();
        assert!(effect.flush_tlb);
        // mode 5 is reserved; the whole write is dropped
        let effect = csrs.write(csr::SATP, 5 << 60 | 0xFFFF, Privilege::Machine).unwrap();
        assert!(!effect.flush_tlb);
        assert_eq!(csrs.satp, 8 << 60 | 0x1234);
    }

    #[test]
    fn warl_masks() {
        let mut csrs = file(Xlen::Rv64);
        csrs.write(csr::MEPC, 0x8000_0003, Privilege::Machine).unwrap();
        assert_eq!(csrs.mepc, 0x8000_0002);
        csrs.write(csr::MIDELEG, u64::MAX, Privilege::Machine).unwrap();
        assert_eq!(csrs.mideleg, ip::S_MASK);
        csrs.write(csr::MTVEC, 0x9000_0002, Privilege::Machine).unwrap();
        assert_eq!(csrs.mtvec, 0x9000_0000);
        // MPP cannot hold the reserved hypervisor encoding
        csrs.write(csr::MSTATUS, 2 << mstatus::MPP_SHIFT, Privilege::Machine).unwrap();
        assert_eq!(csrs.mstatus & mstatus::MPP, 0);
    }

    #[test]
    fn fcsr_requires_fpu_on() {
        let mut csrs = file(Xlen::Rv64);
        assert_eq!(csrs.read(csr::FCSR, Privilege::Machine), Err(CsrError));
        csrs.write(csr::MSTATUS, mstatus::FS, Privilege::Machine).unwrap();
        csrs.write(csr::FCSR, 0b010_11111, Privilege::Machine).unwrap();
        assert_eq!(csrs.read(csr::FRM, Privilege::Machine), Ok(0b010));
        assert_eq!(csrs.read(csr::FFLAGS, Privilege::Machine), Ok(0b11111));
    }

    #[test]
    fn counters_gated_by_counteren() {
        let mut csrs = file(Xlen::Rv64);
        csrs.cycle = 99;
        assert_eq!(csrs.read(csr::CYCLE, Privilege::Machine), Ok(99));
        // not exposed below M until mcounteren.CY is set
        assert_eq!(csrs.read(csr::CYCLE, Privilege::Supervisor), Err(CsrError));
        csrs.write(csr::MCOUNTEREN, 1, Privilege::Machine).unwrap();
        assert_eq!(csrs.read(csr::CYCLE, Privilege::Supervisor), Ok(99));
        // user additionally needs scounteren
        assert_eq!(csrs.read(csr::CYCLE, Privilege::User), Err(CsrError));
        csrs.write(csr::SCOUNTEREN, 1, Privilege::Machine).unwrap();
        assert_eq!(csrs.read(csr::CYCLE, Privilege::User), Ok(99));
    }
}
