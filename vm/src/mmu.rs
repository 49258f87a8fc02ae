// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Virtual memory: the page-table walker, the per-hart TLB and PMP checks.

use kestrel_riscv::csr::mstatus;
use kestrel_riscv::satp::{Mode, Satp};
use kestrel_riscv::{Exception, Privilege, Xlen};

use crate::hart::Hart;
use crate::mem::{PhysAddr, VirtAddr};
use crate::trap::Fault;
use crate::PAGE_SHIFT;

/// What an access is, for permission checks and fault causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Fetch,
    Load,
    Store,
}

impl Access {
    /// The page-fault cause for this access kind.
    #[inline]
    pub(crate) fn page_fault(self) -> Exception {
        match self {
            Access::Fetch => Exception::InstructionPageFault,
            Access::Load => Exception::LoadPageFault,
            Access::Store => Exception::StorePageFault,
        }
    }

    /// The access-fault cause for this access kind.
    #[inline]
    pub(crate) fn access_fault(self) -> Exception {
        match self {
            Access::Fetch => Exception::InstructionFault,
            Access::Load => Exception::LoadFault,
            Access::Store => Exception::StoreFault,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Pte: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

const TLB_SIZE: usize = 64;

/// One direct-mapped translation, indexed by `vpn % TLB_SIZE`.
///
/// The key is (VPN, ASID, privilege); the access kind is keyed implicitly:
/// a store only hits an entry whose PTE had D already set, so the first
/// store through a load-installed entry re-walks and updates the dirty bit.
#[derive(Clone, Copy)]
struct TlbEntry {
    vpn: u64,
    ppn: u64,
    asid: u16,
    privilege: Privilege,
    flags: Pte,
    valid: bool,
}

impl TlbEntry {
    const INVALID: Self = Self {
        vpn: 0,
        ppn: 0,
        asid: 0,
        privilege: Privilege::User,
        flags: Pte::empty(),
        valid: false,
    };
}

pub(crate) struct Tlb {
    entries: Box<[TlbEntry; TLB_SIZE]>,
    /// Machine epoch this TLB was last in sync with; a mismatch at lookup
    /// time invalidates wholesale.
    pub(crate) epoch: u64,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self { entries: Box::new([TlbEntry::INVALID; TLB_SIZE]), epoch: 0 }
    }

    #[inline]
    fn lookup(&self, vpn: u64, asid: u16, privilege: Privilege) -> Option<&TlbEntry> {
        let entry = &self.entries[(vpn as usize) % TLB_SIZE];
        (entry.valid
            && entry.vpn == vpn
            && entry.privilege == privilege
            && (entry.asid == asid || entry.flags.contains(Pte::G)))
        .then_some(entry)
    }

    #[inline]
    fn insert(&mut self, vpn: u64, ppn: u64, asid: u16, privilege: Privilege, flags: Pte) {
        self.entries[(vpn as usize) % TLB_SIZE] =
            TlbEntry { vpn, ppn, asid, privilege, flags, valid: true };
    }

    pub(crate) fn flush_all(&mut self) {
        self.entries.fill(TlbEntry::INVALID);
    }

    /// `sfence.vma` with a VA operand: drops the entry covering `vaddr`,
    /// regardless of ASID or G bit.
    pub(crate) fn flush_vaddr(&mut self, vaddr: VirtAddr) {
        let entry = &mut self.entries[(vaddr.vpn() as usize) % TLB_SIZE];
        if entry.valid && entry.vpn == vaddr.vpn() {
            entry.valid = false;
        }
    }

    /// `sfence.vma` with an ASID operand: drops matching non-global entries.
    pub(crate) fn flush_asid(&mut self, asid: u16) {
        for entry in self.entries.iter_mut() {
            if entry.valid && entry.asid == asid && !entry.flags.contains(Pte::G) {
                entry.valid = false;
            }
        }
    }

    /// `sfence.vma` with both operands: the VA entry, if its ASID matches
    /// and it is not global.
    pub(crate) fn flush_vaddr_asid(&mut self, vaddr: VirtAddr, asid: u16) {
        let entry = &mut self.entries[(vaddr.vpn() as usize) % TLB_SIZE];
        if entry.valid
            && entry.vpn == vaddr.vpn()
            && entry.asid == asid
            && !entry.flags.contains(Pte::G)
        {
            entry.valid = false;
        }
    }
}

/// Translates `vaddr` for `access`, consulting the hart's TLB and walking the
/// page tables on a miss.
///
/// # Errors
///
/// A precise [`Fault`] with the page-fault or access-fault cause of the
/// access kind, `tval` = the faulting virtual address.
pub(crate) fn translate(hart: &mut Hart, vaddr: VirtAddr, access: Access) -> Result<PhysAddr, Fault> {
    let privilege = effective_privilege(hart, access);
    let satp = Satp::from_bits(hart.csr.satp, hart.xlen);
    let mode = satp.mode().unwrap_or(Mode::Bare);

    // registers hold canonical (sign-extended) values on RV32; the address
    // space is the low 32 bits
    let vaddr = match hart.xlen {
        Xlen::Rv32 => VirtAddr::new(vaddr.get() & 0xffff_ffff),
        Xlen::Rv64 => vaddr,
    };

    let phys = if privilege == Privilege::Machine || mode == Mode::Bare {
        PhysAddr::new(vaddr.get())
    } else {
        translate_paged(hart, vaddr, access, privilege, satp, mode)?
    };

    hart.csr.pmp.check(phys, access, privilege).map_err(|()| {
        Fault::new(access.access_fault(), vaddr.get())
    })?;
    Ok(phys)
}

/// Loads and stores run at `MPP` when `mstatus.MPRV` is set; fetches always
/// run at the hart's privilege.
#[inline]
fn effective_privilege(hart: &Hart, access: Access) -> Privilege {
    if access != Access::Fetch && hart.csr.mstatus & mstatus::MPRV != 0 {
        Privilege::from_bits(hart.csr.mstatus >> mstatus::MPP_SHIFT)
    } else {
        hart.privilege
    }
}

fn translate_paged(
    hart: &mut Hart,
    vaddr: VirtAddr,
    access: Access,
    privilege: Privilege,
    satp: Satp,
    mode: Mode,
) -> Result<PhysAddr, Fault> {
    let fault = || Fault::new(access.page_fault(), vaddr.get());

    // SV39+ requires the unused upper bits to be a sign extension of the
    // translated bits
    if hart.xlen == Xlen::Rv64 {
        let shift = 64 - mode.va_bits();
        if ((vaddr.get() as i64) << shift >> shift) as u64 != vaddr.get() {
            return Err(fault());
        }
    }

    let asid = satp.asid();
    if let Some(entry) = hart.tlb.lookup(vaddr.vpn(), asid, privilege) {
        if permitted(entry.flags, access, privilege, hart.csr.mstatus)
            && (access != Access::Store || entry.flags.contains(Pte::D))
        {
            return Ok(PhysAddr::new(entry.ppn << PAGE_SHIFT | vaddr.page_offset()));
        }
        // insufficient permission or missing D bit; re-walk for the precise
        // fault or the A/D update
    }

    let (pte_size, index_bits) = match mode {
        Mode::Sv32 => (4u64, 10u32),
        _ => (8u64, 9u32),
    };

    let mut table = satp.ppn() << PAGE_SHIFT;
    let mut level = mode.levels() - 1;
    let (pte_addr, mut pte) = loop {
        let pte_addr =
            PhysAddr::new(table + vaddr.pt_index(level, index_bits) * pte_size);
        let raw = hart
            .machine()
            .mem
            .read_int(pte_addr, pte_size)
            .map_err(|_| Fault::new(access.access_fault(), vaddr.get()))?;

        // reserved high bits (Svpbmt/N) must be zero on RV64
        if mode != Mode::Sv32 && raw >> 54 & 0x3ff != 0 {
            return Err(fault());
        }
        let pte = Pte::from_bits_truncate(raw);
        if !pte.contains(Pte::V) || (pte.contains(Pte::W) && !pte.contains(Pte::R)) {
            return Err(fault());
        }
        if pte.intersects(Pte::R | Pte::X) {
            break (pte_addr, (raw, pte));
        }
        // non-leaf: A/D/U must be clear
        if pte.intersects(Pte::A | Pte::D | Pte::U) {
            return Err(fault());
        }
        level = level.checked_sub(1).ok_or_else(fault)?;
        table = pte_ppn(raw, mode) << PAGE_SHIFT;
    };

    let (raw, flags) = pte;
    if !permitted(flags, access, privilege, hart.csr.mstatus) {
        return Err(fault());
    }

    // superpage alignment
    let ppn = pte_ppn(raw, mode);
    let align_pages = 1u64 << (level * index_bits);
    if ppn % align_pages != 0 {
        return Err(fault());
    }

    // A/D update, performed as part of the walk
    let mut new_raw = raw | Pte::A.bits();
    if access == Access::Store {
        new_raw |= Pte::D.bits();
    }
    if new_raw != raw {
        hart.machine()
            .mem
            .write_int(pte_addr, pte_size, new_raw)
            .map_err(|_| Fault::new(access.access_fault(), vaddr.get()))?;
    }
    pte.1 = Pte::from_bits_truncate(new_raw);

    // break superpages down to 4 KiB granularity before caching
    let vpn = vaddr.vpn();
    let page_ppn = ppn | (vpn & (align_pages - 1));
    hart.tlb.insert(vpn, page_ppn, asid, privilege, pte.1);

    Ok(PhysAddr::new(page_ppn << PAGE_SHIFT | vaddr.page_offset()))
}

#[inline]
fn pte_ppn(raw: u64, mode: Mode) -> u64 {
    match mode {
        Mode::Sv32 => raw >> 10 & 0x3f_ffff,
        _ => raw >> 10 & 0xfff_ffff_ffff,
    }
}

/// The R/W/X/U permission check, with MXR and SUM folded in at check time so
/// `mstatus` writes never need to shoot down the TLB.
fn permitted(flags: Pte, access: Access, privilege: Privilege, mstatus: u64) -> bool {
    if privilege == Privilege::User && !flags.contains(Pte::U) {
        return false;
    }
    if privilege == Privilege::Supervisor
        && flags.contains(Pte::U)
        && (access == Access::Fetch || mstatus & mstatus::SUM == 0)
    {
        return false;
    }
    match access {
        Access::Fetch => flags.contains(Pte::X),
        Access::Load => {
            flags.contains(Pte::R)
                || (mstatus & mstatus::MXR != 0 && flags.contains(Pte::X))
        }
        Access::Store => flags.contains(Pte::W),
    }
}

/// Physical memory protection. Sixteen entries, checked for S/U accesses and
/// for locked entries in M-mode. Machines that never program PMP skip the
/// scan entirely.
pub(crate) struct Pmp {
    cfg: [u8; 16],
    addr: [u64; 16],
    active: bool,
}

const PMP_R: u8 = 1 << 0;
const PMP_W: u8 = 1 << 1;
const PMP_X: u8 = 1 << 2;
const PMP_A: u8 = 0b11 << 3;
const PMP_L: u8 = 1 << 7;

impl Pmp {
    pub(crate) fn new() -> Self {
        Self { cfg: [0; 16], addr: [0; 16], active: false }
    }

    pub(crate) fn is_pmp_addr(&self, addr: u16) -> bool {
        matches!(addr, 0x3A0..=0x3A3 | 0x3B0..=0x3BF)
    }

    pub(crate) fn read(&self, addr: u16) -> u64 {
        match addr {
            0x3A0..=0x3A3 => {
                // eight lanes per even register on RV64; the RV32 read path
                // truncates to its four
                let base = (addr - 0x3A0) as usize * 4;
                let end = (base + 8).min(16);
                self.cfg[base..end]
                    .iter()
                    .enumerate()
                    .fold(0u64, |acc, (i, &b)| acc | u64::from(b) << (8 * i))
            }
            _ => self.addr[(addr - 0x3B0) as usize],
        }
    }

    pub(crate) fn write(&mut self, addr: u16, value: u64, xlen: Xlen) {
        match addr {
            0x3A0..=0x3A3 => {
                // pmpcfg1/pmpcfg3 only exist on RV32; RV64 packs eight
                // entries per even register (we expose the low half)
                if xlen == Xlen::Rv64 && addr % 2 != 0 {
                    return;
                }
                let base = (addr - 0x3A0) as usize * 4;
                let lanes = if xlen == Xlen::Rv64 { 8.min(16 - base) } else { 4 };
                for i in 0..lanes {
                    let byte = (value >> (8 * i)) as u8;
                    if self.cfg[base + i] & PMP_L == 0 {
                        self.cfg[base + i] = byte;
                    }
                }
            }
            _ => {
                let i = (addr - 0x3B0) as usize;
                if self.cfg[i] & PMP_L == 0 {
                    self.addr[i] = value;
                }
            }
        }
        self.active = self.cfg.iter().any(|&c| c & PMP_A != 0);
    }

    /// Checks one access against the PMP. `Err(())` is an access fault.
    pub(crate) fn check(
        &self,
        phys: PhysAddr,
        access: Access,
        privilege: Privilege,
    ) -> Result<(), ()> {
        if !self.active {
            return Ok(());
        }
        let addr = phys.get();
        for (i, &cfg) in self.cfg.iter().enumerate() {
            let matched = match (cfg & PMP_A) >> 3 {
                0 => continue,
                // TOR
                1 => {
                    let lo = if i == 0 { 0 } else { self.addr[i - 1] << 2 };
                    let hi = self.addr[i] << 2;
                    addr >= lo && addr < hi
                }
                // NA4
                2 => addr >> 2 == self.addr[i],
                // NAPOT
                _ => {
                    let trailing = self.addr[i].trailing_ones();
                    let mask = !((1u64 << (trailing + 3)) - 1);
                    (addr & mask) == (self.addr[i] << 2) & mask
                }
            };
            if !matched {
                continue;
            }
            if privilege == Privilege::Machine && cfg & PMP_L == 0 {
                return Ok(());
            }
            let allowed = match access {
                Access::Fetch => cfg & PMP_X != 0,
                Access::Load => cfg & PMP_R != 0,
                Access::Store => cfg & PMP_W != 0,
            };
            return if allowed { Ok(()) } else { Err(()) };
        }
        // no entry matched: machine mode passes, S/U fails while any entry
        // is active
        if privilege == Privilege::Machine { Ok(()) } else { Err(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlb_sfence_scopes() {
        let mut tlb = Tlb::new();
        let global = Pte::V | Pte::R | Pte::A | Pte::G;
        let plain = Pte::V | Pte::R | Pte::A;
        tlb.insert(0x10, 0x100, 1, Privilege::Supervisor, plain);
        tlb.insert(0x11, 0x101, 1, Privilege::Supervisor, global);
        tlb.insert(0x12, 0x102, 2, Privilege::Supervisor, plain);

        // asid-scoped flush spares global entries and other asids
        tlb.flush_asid(1);
        assert!(tlb.lookup(0x10, 1, Privilege::Supervisor).is_none());
        assert!(tlb.lookup(0x11, 1, Privilege::Supervisor).is_some());
        assert!(tlb.lookup(0x12, 2, Privilege::Supervisor).is_some());

        // va-scoped flush removes even global entries
        tlb.flush_vaddr(VirtAddr::new(0x11 << PAGE_SHIFT));
        assert!(tlb.lookup(0x11, 1, Privilege::Supervisor).is_none());

        tlb.insert(0x10, 0x100, 1, Privilege::Supervisor, plain);
        tlb.flush_all();
        assert!(tlb.lookup(0x10, 1, Privilege::Supervisor).is_none());
    }

    #[test]
    fn tlb_key_includes_privilege_and_asid() {
        let mut tlb = Tlb::new();
        let plain = Pte::V | Pte::R | Pte::A;
        tlb.insert(0x20, 0x200, 1, Privilege::Supervisor, plain);
        assert!(tlb.lookup(0x20, 1, Privilege::User).is_none());
        assert!(tlb.lookup(0x20, 2, Privilege::Supervisor).is_none());
        assert!(tlb.lookup(0x20, 1, Privilege::Supervisor).is_some());
        // global entries match any asid
        tlb.insert(0x21, 0x201, 1, Privilege::Supervisor, plain | Pte::G);
        assert!(tlb.lookup(0x21, 9, Privilege::Supervisor).is_some());
    }

    #[test]
    fn mxr_and_sum_evaluated_per_access() {
        let xo = Pte::V | Pte::X | Pte::A;
        assert!(!permitted(xo, Access::Load, Privilege::Supervisor, 0));
        assert!(permitted(xo, Access::Load, Privilege::Supervisor, mstatus::MXR));
        let user = Pte::V | Pte::R | Pte::U | Pte::A;
        assert!(!permitted(user, Access::Load, Privilege::Supervisor, 0));
        assert!(permitted(user, Access::Load, Privilege::Supervisor, mstatus::SUM));
        // fetch from a user page is never legal in S-mode
        let user_x = user | Pte::X;
        assert!(!permitted(user_x, Access::Fetch, Privilege::Supervisor, mstatus::SUM));
        assert!(permitted(user_x, Access::Fetch, Privilege::User, 0));
    }

    #[test]
    fn pmp_napot_and_priority() {
        let mut pmp = Pmp::new();
        // entry 0: NAPOT 4 KiB at 0x8000_0000, R only
        let napot_addr = (0x8000_0000u64 >> 2) | 0x1ff;
        pmp.write(0x3B0, napot_addr, Xlen::Rv64);
        pmp.write(0x3A0, u64::from(PMP_R | 3 << 3), Xlen::Rv64);

        let inside = PhysAddr::new(0x8000_0800);
        assert!(pmp.check(inside, Access::Load, Privilege::Supervisor).is_ok());
        assert!(pmp.check(inside, Access::Store, Privilege::Supervisor).is_err());
        // unlocked entries do not constrain machine mode
        assert!(pmp.check(inside, Access::Store, Privilege::Machine).is_ok());
        // no match: S/U fails while entries are active, M passes
        let outside = PhysAddr::new(0x9000_0000);
        assert!(pmp.check(outside, Access::Load, Privilege::Supervisor).is_err());
        assert!(pmp.check(outside, Access::Load, Privilege::Machine).is_ok());
    }

    #[test]
    fn pmp_inactive_is_transparent() {
        let pmp = Pmp::new();
        assert!(
            pmp.check(PhysAddr::new(0x1234), Access::Store, Privilege::User).is_ok()
        );
    }
}
