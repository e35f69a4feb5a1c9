//! Privileged-instruction emulation.
//!
//! Guests trap into the hypervisor on TLB management instructions, SPR
//! accesses the hardware has no guest view for, message sends, and the
//! return-from-interrupt variants whose save/restore pairs are
//! shadowed. The decoder only understands the instructions this set
//! needs; anything else reflects a program interrupt with ESR[PIL].

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::arch::{
    mas1_tsize, TrapFrame, MAS0_ESEL_MASK, MAS0_ESEL_SHIFT, MAS0_TLBSEL1, MAS1_TID_SHIFT,
    MAS1_TS_SHIFT, MAS1_VALID, MAS2_EPN, MAS2_FLAGS, MAS3_PERM_MASK, MAS3_RPN, PAGE_SHIFT,
    MCSR_LD, MCSR_MAV, MCSR_MEA, MCSR_ST, TLB1_GSIZE,
};
use crate::events::{self, EV_TLBIVAX};
use crate::guest::gcpu::{Gcpu, GcpuStat, GCPU_PEND_MSGSND, GCPU_PEND_MSGSNDC};
use crate::guest::Guest;
use crate::log::{LogLevel, LogType};
use crate::printlog;
use crate::tlb::cache::TlbcEntry;
use crate::tlb::Tlb1Error;
use crate::timers;

// Primary opcodes.
const OP_CR: u32 = 19;
const OP_EXT: u32 = 31;

// Extended opcodes under 31.
const XO_MFSPR: u32 = 339;
const XO_MTSPR: u32 = 467;
const XO_TLBIVAX: u32 = 786;
const XO_TLBSX: u32 = 914;
const XO_TLBRE: u32 = 946;
const XO_TLBWE: u32 = 978;
const XO_TLBSYNC: u32 = 566;
const XO_MSGSND: u32 = 206;
const XO_MSGCLR: u32 = 238;

// Extended opcodes under 19.
const XO_RFI: u32 = 50;
const XO_RFCI: u32 = 51;
const XO_RFMCI: u32 = 38;
const XO_RFDI: u32 = 39;

// SPR numbers the hypervisor intercepts.
const SPR_DEAR: u32 = 61;
const SPR_ESR: u32 = 62;
const SPR_IVPR: u32 = 63;
const SPR_SPRG4_W: u32 = 276;
const SPR_SPRG9_W: u32 = 281;
const SPR_PIR: u32 = 286;
const SPR_TSR: u32 = 336;
const SPR_LPIDR: u32 = 338;
const SPR_MAS5: u32 = 339;
const SPR_TCR: u32 = 340;
const SPR_MAS8: u32 = 341;
const SPR_IVOR0: u32 = 400;
const SPR_IVOR15: u32 = 415;
const SPR_IVOR32: u32 = 528;
const SPR_IVOR37: u32 = 533;
const SPR_CSRR0: u32 = 58;
const SPR_CSRR1: u32 = 59;
const SPR_MCSRR0: u32 = 570;
const SPR_MCSRR1: u32 = 571;
const SPR_MCSR: u32 = 572;
const SPR_MCAR: u32 = 573;
const SPR_DSRR0: u32 = 574;
const SPR_DSRR1: u32 = 575;
const SPR_MAS0: u32 = 624;
const SPR_MAS1: u32 = 625;
const SPR_MAS2: u32 = 626;
const SPR_MAS3: u32 = 627;
const SPR_MAS4: u32 = 628;
const SPR_MAS6: u32 = 630;
const SPR_MAS7: u32 = 944;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuOutcome {
    /// Instruction emulated; advance past it.
    Done,
    /// Reflect a machine check (invalid guest-physical reference).
    MachineCheck { mcsr: u32, mcar: u64 },
    /// Not ours; reflect a program interrupt with ESR[PIL].
    Illegal,
}

#[inline]
fn rd(insn: u32) -> usize {
    ((insn >> 21) & 31) as usize
}

#[inline]
fn ra(insn: u32) -> usize {
    ((insn >> 16) & 31) as usize
}

#[inline]
fn rb(insn: u32) -> usize {
    ((insn >> 11) & 31) as usize
}

#[inline]
fn sprn(insn: u32) -> u32 {
    ((insn >> 16) & 0x1f) | (((insn >> 11) & 0x1f) << 5)
}

/// Emulate one trapped instruction.
pub fn emulate(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame, insn: u32) -> EmuOutcome {
    gcpu.inc_stat(GcpuStat::EmuTotal);

    let opcd = insn >> 26;
    let xo = (insn >> 1) & 0x3ff;

    // The rf* class replaces the PC; everything else steps past the
    // emulated instruction.
    let mut advance = true;

    let outcome = match (opcd, xo) {
        (OP_EXT, XO_MFSPR) => emu_mfspr(gcpu, regs, insn),
        (OP_EXT, XO_MTSPR) => emu_mtspr(gcpu, regs, insn),
        (OP_EXT, XO_TLBWE) => emu_tlbwe(gcpu),
        (OP_EXT, XO_TLBRE) => emu_tlbre(gcpu),
        (OP_EXT, XO_TLBSX) => emu_tlbsx(gcpu, regs, insn),
        (OP_EXT, XO_TLBIVAX) => emu_tlbivax(gcpu, regs, insn),
        (OP_EXT, XO_TLBSYNC) => {
            let _guard = crate::tlb::TLBSYNC_LOCK.lock();
            EmuOutcome::Done
        }
        (OP_EXT, XO_MSGSND) => emu_msgsnd(gcpu, regs, insn, false),
        (OP_EXT, XO_MSGCLR) => emu_msgsnd(gcpu, regs, insn, true),
        (OP_CR, XO_RFCI) => {
            let r = gcpu.regs.lock();
            regs.srr0 = r.csrr0;
            regs.srr1 = r.csrr1;
            advance = false;
            EmuOutcome::Done
        }
        (OP_CR, XO_RFDI) => {
            let r = gcpu.regs.lock();
            regs.srr0 = r.dsrr0;
            regs.srr1 = r.dsrr1;
            advance = false;
            EmuOutcome::Done
        }
        (OP_CR, XO_RFMCI) => {
            let r = gcpu.regs.lock();
            regs.srr0 = r.mcsrr0;
            regs.srr1 = r.mcsrr1;
            advance = false;
            EmuOutcome::Done
        }
        (OP_CR, XO_RFI) => {
            // hardware handles the GSRR return
            advance = false;
            EmuOutcome::Done
        }
        _ => EmuOutcome::Illegal,
    };

    if outcome == EmuOutcome::Done && advance {
        regs.srr0 += 4;
    }
    outcome
}

fn emu_mfspr(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame, insn: u32) -> EmuOutcome {
    gcpu.inc_stat(GcpuStat::EmuSpr);
    let spr = sprn(insn);
    let r = gcpu.regs.lock();

    let val: u64 = match spr {
        SPR_IVPR => r.ivpr,
        SPR_IVOR0..=SPR_IVOR15 => r.ivor[(spr - SPR_IVOR0) as usize] as u64,
        SPR_IVOR32..=SPR_IVOR37 => r.ivor[(spr - SPR_IVOR32 + 32) as usize] as u64,
        SPR_SPRG4_W..=SPR_SPRG9_W => r.sprg[(spr - SPR_SPRG4_W) as usize],
        SPR_CSRR0 => r.csrr0,
        SPR_CSRR1 => r.csrr1 as u64,
        SPR_DSRR0 => r.dsrr0,
        SPR_DSRR1 => r.dsrr1 as u64,
        SPR_MCSRR0 => r.mcsrr0,
        SPR_MCSRR1 => r.mcsrr1 as u64,
        SPR_MCSR => gcpu.mcsr.load(Ordering::Acquire) as u64,
        SPR_MCAR => gcpu.mcar.load(Ordering::Acquire),
        SPR_MAS0 => r.mas0 as u64,
        SPR_MAS1 => r.mas1 as u64,
        SPR_MAS2 => r.mas2,
        SPR_MAS3 => r.mas3 as u64,
        SPR_MAS4 | SPR_MAS5 | SPR_MAS8 => 0,
        SPR_MAS6 => r.mas6 as u64,
        SPR_MAS7 => r.mas7 as u64,
        SPR_TSR => timers::get_tsr(gcpu) as u64,
        SPR_TCR => timers::get_tcr(gcpu) as u64,
        SPR_PIR => gcpu.gcpu_num as u64,
        SPR_LPIDR | SPR_DEAR | SPR_ESR => return EmuOutcome::Illegal,
        _ => return EmuOutcome::Illegal,
    };

    regs.gpregs[rd(insn)] = val;
    EmuOutcome::Done
}

fn emu_mtspr(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame, insn: u32) -> EmuOutcome {
    gcpu.inc_stat(GcpuStat::EmuSpr);
    let spr = sprn(insn);
    let val = regs.gpregs[rd(insn)];

    match spr {
        SPR_TSR => {
            timers::set_tsr(gcpu, val as u32);
            return EmuOutcome::Done;
        }
        SPR_TCR => {
            timers::set_tcr(gcpu, val as u32);
            return EmuOutcome::Done;
        }
        SPR_MCSR => {
            gcpu.mcsr.fetch_and(!(val as u32), Ordering::AcqRel);
            return EmuOutcome::Done;
        }
        _ => {}
    }

    let mut r = gcpu.regs.lock();
    match spr {
        SPR_IVPR => r.ivpr = val & !0xffff,
        SPR_IVOR0..=SPR_IVOR15 => r.ivor[(spr - SPR_IVOR0) as usize] = val as u32 & 0xfff0,
        SPR_IVOR32..=SPR_IVOR37 => r.ivor[(spr - SPR_IVOR32 + 32) as usize] = val as u32 & 0xfff0,
        SPR_SPRG4_W..=SPR_SPRG9_W => r.sprg[(spr - SPR_SPRG4_W) as usize] = val,
        SPR_CSRR0 => r.csrr0 = val,
        SPR_CSRR1 => r.csrr1 = val as u32,
        SPR_DSRR0 => r.dsrr0 = val,
        SPR_DSRR1 => r.dsrr1 = val as u32,
        SPR_MCSRR0 => r.mcsrr0 = val,
        SPR_MCSRR1 => r.mcsrr1 = val as u32,
        SPR_MAS0 => r.mas0 = val as u32,
        SPR_MAS1 => r.mas1 = val as u32,
        SPR_MAS2 => r.mas2 = val,
        SPR_MAS3 => r.mas3 = val as u32,
        SPR_MAS4 | SPR_MAS5 | SPR_MAS8 => {}
        SPR_MAS6 => r.mas6 = val as u32,
        SPR_MAS7 => r.mas7 = val as u32,
        _ => return EmuOutcome::Illegal,
    }
    EmuOutcome::Done
}

/// Guest `tlbwe`: TLB1 writes go through the multiplexer; TLB0 writes
/// populate the software cache with the translated entry.
fn emu_tlbwe(gcpu: &Arc<Gcpu>) -> EmuOutcome {
    gcpu.inc_stat(GcpuStat::EmuTlbwe);

    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return EmuOutcome::Illegal,
    };

    let (mas0, mas1, mas2, mas3, mas7) = {
        let r = gcpu.regs.lock();
        (r.mas0, r.mas1, r.mas2, r.mas3, r.mas7)
    };

    let epn = (mas2 & MAS2_EPN as u64) >> PAGE_SHIFT;
    let grpn = (((mas7 as u64) << 32) | (mas3 & MAS3_RPN) as u64) >> PAGE_SHIFT;
    let mas2flags = (mas2 as u32) & MAS2_FLAGS;
    let mas3flags = mas3 & MAS3_PERM_MASK;

    if mas0 & MAS0_TLBSEL1 != 0 {
        let entry = ((mas0 & MAS0_ESEL_MASK) >> MAS0_ESEL_SHIFT) as usize;
        if entry >= TLB1_GSIZE {
            return EmuOutcome::Illegal;
        }

        if mas1 & MAS1_VALID == 0 {
            let mut tlb1 = gcpu.tlb1.lock();
            let mut hw = gcpu.hw_tlb1.lock();
            tlb1.free_entry(&mut hw, entry);
            tlb1.gtlb1[entry] = crate::arch::TlbEntry::empty();
            return EmuOutcome::Done;
        }

        let gphys = guest.gphys.lock();
        let mut tlb1 = gcpu.tlb1.lock();
        let mut hw = gcpu.hw_tlb1.lock();
        match tlb1.set_entry(&mut hw, entry, mas1, epn, grpn, mas2flags, mas3flags, &gphys,
                             guest.lpid) {
            Ok(_) => EmuOutcome::Done,
            Err(Tlb1Error::OutOfEntries) => EmuOutcome::MachineCheck {
                mcsr: MCSR_MAV | MCSR_MEA | MCSR_ST,
                mcar: epn << PAGE_SHIFT,
            },
        }
    } else {
        // TLB0: translate through the guest-physical map and cache the
        // real entry. A write naming an unmapped guest page is exactly
        // the invalid-gphys access the guest cannot recover from.
        if mas1 & MAS1_VALID == 0 {
            if let Some(hv) = guest.hv.upgrade() {
                let pid = (mas1 & crate::arch::MAS1_TID_MASK) >> MAS1_TID_SHIFT;
                let space = (mas1 >> MAS1_TS_SHIFT) & 1;
                hv.tlbcache.invalidate(epn << PAGE_SHIFT, pid, space, guest.lpid);
            }
            return EmuOutcome::Done;
        }

        let (rpn, attr) = {
            let gphys = guest.gphys.lock();
            match gphys.xlate(grpn, false) {
                crate::mem::gphys::Xlate::Mapped { rpn, attr } => (rpn, attr),
                crate::mem::gphys::Xlate::Hole { .. } => {
                    return EmuOutcome::MachineCheck {
                        mcsr: MCSR_MAV | MCSR_MEA | MCSR_LD,
                        mcar: grpn << PAGE_SHIFT,
                    };
                }
            }
        };

        let pid = (mas1 & crate::arch::MAS1_TID_MASK) >> MAS1_TID_SHIFT;
        let space = (mas1 >> MAS1_TS_SHIFT) & 1;

        // TLB1 already translating this address wins; drop the write.
        if gcpu.tlb1.lock().conflicts(epn, mas1_tsize(mas1), pid, space) {
            printlog!(LogType::Mmu, LogLevel::Debug,
                      "tlbwe: tlb0 write shadowed by tlb1 at {:#x}", epn << PAGE_SHIFT);
            return EmuOutcome::Done;
        }

        if let Some(hv) = guest.hv.upgrade() {
            hv.tlbcache.insert(
                epn << PAGE_SHIFT,
                pid,
                space,
                guest.lpid,
                TlbcEntry {
                    mas3: ((rpn << PAGE_SHIFT) as u32 & MAS3_RPN)
                        | (mas3flags & attr.mas3_perms()),
                    mas2flags: mas2flags as u8,
                    mas7: (rpn >> (32 - PAGE_SHIFT)) as u8 & 0xf,
                    tsize: mas1_tsize(mas1) as u8,
                    mas8: (attr.mas8_bits() >> 30) as u8,
                    gmas3: mas3flags as u8 & 0x3f,
                },
            );
        }

        EmuOutcome::Done
    }
}

/// Guest `tlbre`: read back the selected TLB1 entry into the MAS shadow.
fn emu_tlbre(gcpu: &Arc<Gcpu>) -> EmuOutcome {
    let mut r = gcpu.regs.lock();
    if r.mas0 & MAS0_TLBSEL1 == 0 {
        // TLB0 reads come straight from hardware on silicon; nothing
        // shadowed to return here.
        r.mas1 = 0;
        return EmuOutcome::Done;
    }

    let entry = ((r.mas0 & MAS0_ESEL_MASK) >> MAS0_ESEL_SHIFT) as usize;
    if entry >= TLB1_GSIZE {
        return EmuOutcome::Illegal;
    }

    let e = gcpu.tlb1.lock().gtlb1[entry];
    r.mas1 = e.mas1;
    r.mas2 = e.mas2 as u64;
    r.mas3 = e.mas3;
    r.mas7 = e.mas7;
    EmuOutcome::Done
}

/// Guest `tlbsx`: search the guest's TLB1 view by virtual address.
fn emu_tlbsx(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame, insn: u32) -> EmuOutcome {
    let base = if ra(insn) == 0 { 0 } else { regs.gpregs[ra(insn)] };
    let vaddr = base.wrapping_add(regs.gpregs[rb(insn)]);

    let mut r = gcpu.regs.lock();
    let pid = (r.mas6 >> 16) & 0x3fff;
    let space = r.mas6 & 1;

    let tlb1 = gcpu.tlb1.lock();
    for (i, e) in tlb1.gtlb1.iter().enumerate() {
        if e.matches(vaddr >> PAGE_SHIFT, space, pid) {
            r.mas0 = MAS0_TLBSEL1 | ((i as u32) << MAS0_ESEL_SHIFT);
            r.mas1 = e.mas1;
            r.mas2 = e.mas2 as u64;
            r.mas3 = e.mas3;
            r.mas7 = e.mas7;
            return EmuOutcome::Done;
        }
    }

    r.mas1 = 0; // not found: V stays clear
    EmuOutcome::Done
}

/// Guest `tlbivax`: invalidate locally, then broadcast to the other
/// vCPUs of the partition.
fn emu_tlbivax(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame, insn: u32) -> EmuOutcome {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return EmuOutcome::Illegal,
    };

    let base = if ra(insn) == 0 { 0 } else { regs.gpregs[ra(insn)] };
    let vaddr = base.wrapping_add(regs.gpregs[rb(insn)]) & !0xfff;

    guest.tlbivax_addr.store(vaddr, Ordering::Release);
    guest
        .tlbivax_count
        .store(guest.gcpus.len() as u32, Ordering::Release);

    for target in &guest.gcpus {
        events::setevent(target, EV_TLBIVAX);
    }
    EmuOutcome::Done
}

/// Guest `msgsnd`/`msgclr`: doorbells between the partition's own
/// vCPUs. The payload selects normal or critical class and the target.
fn emu_msgsnd(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame, insn: u32, clear: bool) -> EmuOutcome {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return EmuOutcome::Illegal,
    };

    let msg = regs.gpregs[rb(insn)];
    let msgtype = (msg >> 27) & 0x1f;
    let broadcast = msg & (1 << 26) != 0;
    let target = (msg & 0x3fff) as usize;

    let (bit, crit) = match msgtype {
        2 => (GCPU_PEND_MSGSND, false),  // guest doorbell
        3 => (GCPU_PEND_MSGSNDC, true), // guest critical doorbell
        _ => return EmuOutcome::Done,   // other types are hypervisor-owned
    };

    for t in &guest.gcpus {
        if !broadcast && t.gcpu_num != target {
            continue;
        }
        if clear {
            t.gdbell_pending.fetch_and(!bit, Ordering::AcqRel);
        } else {
            t.gdbell_pending.fetch_or(bit, Ordering::AcqRel);
            if crit {
                t.crit_gdbell_line.store(true, Ordering::Release);
            } else {
                t.gdbell_line.store(true, Ordering::Release);
            }
        }
    }
    EmuOutcome::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{MAS1_TSIZE_SHIFT, PteAttr, TLB_TSIZE_4K, TSR_DIS};
    use crate::guest::Guest;
    use crate::hv::Hypervisor;

    fn insn_x(opcd: u32, xo: u32, d: u32, a: u32, b: u32) -> u32 {
        (opcd << 26) | (d << 21) | (a << 16) | (b << 11) | (xo << 1)
    }

    fn insn_spr(xo: u32, d: u32, spr: u32) -> u32 {
        (OP_EXT << 26) | (d << 21) | ((spr & 0x1f) << 16) | (((spr >> 5) & 0x1f) << 11) | (xo << 1)
    }

    #[test]
    fn test_mtspr_mfspr_ivor_roundtrip() {
        let guest = Guest::new_bare("emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        let mut regs = TrapFrame::default();

        regs.gpregs[5] = 0x1230;
        assert_eq!(emulate(gcpu, &mut regs, insn_spr(XO_MTSPR, 5, SPR_IVOR0 + 4)),
                   EmuOutcome::Done);

        let mut regs2 = TrapFrame::default();
        assert_eq!(emulate(gcpu, &mut regs2, insn_spr(XO_MFSPR, 7, SPR_IVOR0 + 4)),
                   EmuOutcome::Done);
        assert_eq!(regs2.gpregs[7], 0x1230);
        assert_eq!(gcpu.stat(GcpuStat::EmuSpr), 2);
    }

    #[test]
    fn test_mtspr_tsr_is_w1c() {
        let guest = Guest::new_bare("emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        gcpu.gtsr.store(TSR_DIS, Ordering::Relaxed);

        let mut regs = TrapFrame::default();
        regs.gpregs[3] = TSR_DIS as u64;
        emulate(gcpu, &mut regs, insn_spr(XO_MTSPR, 3, SPR_TSR));
        assert_eq!(gcpu.gtsr.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unknown_spr_is_illegal() {
        let guest = Guest::new_bare("emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        let mut regs = TrapFrame::default();
        assert_eq!(emulate(gcpu, &mut regs, insn_spr(XO_MFSPR, 3, 1015)),
                   EmuOutcome::Illegal);
        // srr0 not advanced on failure
        assert_eq!(regs.srr0, 0);
    }

    #[test]
    fn test_tlbwe_tlb1_goes_through_mux() {
        let hv = Hypervisor::new_bare();
        let guest = Guest::new_bare_with_hv(&hv, "emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        guest.gphys.lock().map(0, 0x500, 16, PteAttr::VALID | PteAttr::SR | PteAttr::SW);

        {
            let mut r = gcpu.regs.lock();
            r.mas0 = MAS0_TLBSEL1 | (3 << MAS0_ESEL_SHIFT);
            r.mas1 = MAS1_VALID | (TLB_TSIZE_4K << MAS1_TSIZE_SHIFT);
            r.mas2 = 0x2000;
            r.mas3 = 0x2000 | 0x3; // grpn 2, SR|UR
        }
        let mut regs = TrapFrame::default();
        assert_eq!(emulate(gcpu, &mut regs, insn_x(OP_EXT, XO_TLBWE, 0, 0, 0)),
                   EmuOutcome::Done);

        let tlb1 = gcpu.tlb1.lock();
        assert!(tlb1.gtlb1[3].is_valid());
        assert_eq!(tlb1.used_mask(3).count_ones(), 1);
        assert_eq!(gcpu.stat(GcpuStat::EmuTlbwe), 1);
    }

    #[test]
    fn test_tlbwe_tlb0_populates_cache() {
        let hv = Hypervisor::new_bare();
        let guest = Guest::new_bare_with_hv(&hv, "emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        guest.gphys.lock().map(0x10, 0x9910, 1, PteAttr::VALID | PteAttr::SR | PteAttr::SW);

        {
            let mut r = gcpu.regs.lock();
            r.mas0 = 0;
            r.mas1 = MAS1_VALID | (TLB_TSIZE_4K << MAS1_TSIZE_SHIFT);
            r.mas2 = 0x7000_0000;
            r.mas3 = (0x10 << 12) | 0x1;
        }
        let mut regs = TrapFrame::default();
        assert_eq!(emulate(gcpu, &mut regs, insn_x(OP_EXT, XO_TLBWE, 0, 0, 0)),
                   EmuOutcome::Done);

        let tag = hv.tlbcache.make_tag(0x7000_0000, 0, 0, 1);
        let (_, _, entry) = hv.tlbcache.find_gtlb_entry(0x7000_0000, tag).expect("cached");
        assert_eq!(entry.mas3 >> 12, 0x9910);
    }

    #[test]
    fn test_tlbwe_tlb0_invalid_gphys_is_mcheck() {
        let hv = Hypervisor::new_bare();
        let guest = Guest::new_bare_with_hv(&hv, "emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];

        {
            let mut r = gcpu.regs.lock();
            r.mas0 = 0;
            r.mas1 = MAS1_VALID | (TLB_TSIZE_4K << MAS1_TSIZE_SHIFT);
            r.mas2 = 0x7000_0000;
            r.mas3 = 0xdead_0000;
        }
        let mut regs = TrapFrame::default();
        match emulate(gcpu, &mut regs, insn_x(OP_EXT, XO_TLBWE, 0, 0, 0)) {
            EmuOutcome::MachineCheck { mcsr, .. } => {
                assert_ne!(mcsr & MCSR_MAV, 0);
            }
            other => panic!("expected machine check, got {:?}", other),
        }
    }

    #[test]
    fn test_tlbsx_finds_entry() {
        let guest = Guest::new_bare("emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        let mut gphys = crate::mem::PageTable::new();
        gphys.map(0, 0x100, 4, PteAttr::VALID | PteAttr::SR);
        {
            let mut tlb1 = gcpu.tlb1.lock();
            let mut hw = gcpu.hw_tlb1.lock();
            tlb1.set_entry(&mut hw, 7,
                           MAS1_VALID | (TLB_TSIZE_4K << MAS1_TSIZE_SHIFT),
                           0x40, 0, 0, 0x1, &gphys, 1)
                .unwrap();
        }

        let mut regs = TrapFrame::default();
        regs.gpregs[4] = 0x40 << 12;
        assert_eq!(emulate(gcpu, &mut regs, insn_x(OP_EXT, XO_TLBSX, 0, 0, 4)),
                   EmuOutcome::Done);

        let r = gcpu.regs.lock();
        assert_eq!(r.mas0, MAS0_TLBSEL1 | (7 << MAS0_ESEL_SHIFT));
        assert_ne!(r.mas1 & MAS1_VALID, 0);
    }

    #[test]
    fn test_msgsnd_targets_vcpu() {
        let guest = Guest::new_bare("emu", 1, &[0, 1]);
        let gcpu = &guest.gcpus[0];

        let mut regs = TrapFrame::default();
        // type 2 (guest doorbell), target vcpu 1
        regs.gpregs[9] = (2u64 << 27) | 1;
        assert_eq!(emulate(gcpu, &mut regs, insn_x(OP_EXT, XO_MSGSND, 0, 0, 9)),
                   EmuOutcome::Done);

        assert_eq!(guest.gcpus[0].gdbell_pending.load(Ordering::Relaxed) & GCPU_PEND_MSGSND, 0);
        assert_ne!(guest.gcpus[1].gdbell_pending.load(Ordering::Relaxed) & GCPU_PEND_MSGSND, 0);
        assert!(guest.gcpus[1].gdbell_line.load(Ordering::Relaxed));
    }

    #[test]
    fn test_rfci_restores_shadow() {
        let guest = Guest::new_bare("emu", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        {
            let mut r = gcpu.regs.lock();
            r.csrr0 = 0xc0de;
            r.csrr1 = 0x8000;
        }
        let mut regs = TrapFrame::default();
        assert_eq!(emulate(gcpu, &mut regs, (OP_CR << 26) | (XO_RFCI << 1)),
                   EmuOutcome::Done);
        assert_eq!(regs.srr0, 0xc0de);
        assert_eq!(regs.srr1, 0x8000);
    }
}
