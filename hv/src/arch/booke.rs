//! e500mc MMU assist (MAS) registers, MSR/ESR/MCSR bits, timer control
//! and the software page-table attribute word.
//!
//! MAS1 (per TLB entry):
//!   Bit  [31]    - V (valid)
//!   Bit  [30]    - IPROT (invalidate-protected, TLB1 only)
//!   Bits [29:16] - TID (process id, 14 bits)
//!   Bit  [12]    - TS (translation space)
//!   Bits [11:7]  - TSIZE, log4 of the page size in KiB (4K=1 .. 4G=11)
//!
//! MAS2 holds EPN | WIMGE flags; MAS3 holds RPN[31:12] | permission bits;
//! MAS7 holds RPN[63:32]; MAS8 holds TGS/VF and the LPID tag.

/// Number of 4 KiB pages covered by a power-of-4 TSIZE.
pub const PAGE_SHIFT: u32 = 12;
/// Page directory fan-out: 1024 entries per level.
pub const PGDIR_SHIFT: u32 = 10;
pub const PGDIR_SIZE: usize = 1 << PGDIR_SHIFT;
/// Levels in the guest-physical page table.
pub const PTE_PHYS_LEVELS: u32 = 2;

/// TSIZE encodings (log4 of size in KiB).
pub const TLB_TSIZE_4K: u32 = 1;
pub const TLB_TSIZE_16K: u32 = 2;
pub const TLB_TSIZE_64K: u32 = 3;
pub const TLB_TSIZE_256K: u32 = 4;
pub const TLB_TSIZE_1M: u32 = 5;
pub const TLB_TSIZE_4M: u32 = 6;
pub const TLB_TSIZE_16M: u32 = 7;
pub const TLB_TSIZE_64M: u32 = 8;
pub const TLB_TSIZE_256M: u32 = 9;
pub const TLB_TSIZE_1G: u32 = 10;
pub const TLB_TSIZE_MAX: u32 = 11;

/// Hardware TLB1 size on this core.
pub const TLB1_SIZE: usize = 64;
/// First TLB1 index reserved for the hypervisor; guests multiplex below it.
pub const TLB1_RSVD: usize = 48;
/// TLB1 as seen by the guest.
pub const TLB1_GSIZE: usize = 16;

/// Pages covered by a TSIZE (4^(tsize-1) 4 KiB pages).
#[inline]
pub const fn tsize_to_pages(tsize: u32) -> u64 {
    1u64 << (2 * tsize - 2)
}

/// TSIZE of the largest page that fits `npages` at alignment `epn`.
pub fn max_page_size(epn: u64, npages: u64) -> u32 {
    let mut tsize = TLB_TSIZE_4K;

    while tsize < TLB_TSIZE_MAX {
        let pages = tsize_to_pages(tsize + 1);
        if pages > npages || epn & (pages - 1) != 0 {
            break;
        }
        tsize += 1;
    }

    tsize
}

/// TSIZE of the natural power-of-4 alignment of a real page number.
pub fn natural_alignment(rpn: u64) -> u32 {
    let mut tsize = TLB_TSIZE_4K;

    while tsize < TLB_TSIZE_MAX {
        if rpn & (tsize_to_pages(tsize + 1) - 1) != 0 {
            break;
        }
        tsize += 1;
    }

    tsize
}

// ── MAS0 ────────────────────────────────────────────────────────────
pub const MAS0_TLBSEL1: u32 = 0x1000_0000;
pub const MAS0_ESEL_SHIFT: u32 = 16;
pub const MAS0_ESEL_MASK: u32 = 0x003f_0000;

// ── MAS1 ────────────────────────────────────────────────────────────
pub const MAS1_VALID: u32 = 0x8000_0000;
pub const MAS1_IPROT: u32 = 0x4000_0000;
pub const MAS1_TID_SHIFT: u32 = 16;
pub const MAS1_TID_MASK: u32 = 0x3fff_0000;
pub const MAS1_TS_SHIFT: u32 = 12;
pub const MAS1_TS: u32 = 0x0000_1000;
pub const MAS1_TSIZE_SHIFT: u32 = 7;
pub const MAS1_TSIZE_MASK: u32 = 0x0000_0f80;

#[inline]
pub const fn mas1_tsize(mas1: u32) -> u32 {
    (mas1 >> MAS1_TSIZE_SHIFT) & 15
}

#[inline]
pub const fn mas1_tid(mas1: u32) -> u32 {
    (mas1 & MAS1_TID_MASK) >> MAS1_TID_SHIFT
}

// ── MAS2 ────────────────────────────────────────────────────────────
pub const MAS2_EPN: u32 = 0xffff_f000;
pub const MAS2_W: u32 = 0x0000_0010;
pub const MAS2_I: u32 = 0x0000_0008;
pub const MAS2_M: u32 = 0x0000_0004;
pub const MAS2_G: u32 = 0x0000_0002;
pub const MAS2_E: u32 = 0x0000_0001;
pub const MAS2_FLAGS: u32 = 0x0000_001f;

// ── MAS3 ────────────────────────────────────────────────────────────
pub const MAS3_RPN: u32 = 0xffff_f000;
pub const MAS3_SR: u32 = 0x0000_0001;
pub const MAS3_UR: u32 = 0x0000_0002;
pub const MAS3_SW: u32 = 0x0000_0004;
pub const MAS3_UW: u32 = 0x0000_0008;
pub const MAS3_SX: u32 = 0x0000_0010;
pub const MAS3_UX: u32 = 0x0000_0020;
pub const MAS3_PERM_MASK: u32 = 0x0000_003f;

// ── MAS6 ────────────────────────────────────────────────────────────
pub const MAS6_SPID_SHIFT: u32 = 16;
pub const MAS6_SAS: u32 = 0x0000_0001;

// ── MAS8 ────────────────────────────────────────────────────────────
pub const MAS8_TGS: u32 = 0x8000_0000;
pub const MAS8_VF: u32 = 0x4000_0000;
pub const MAS8_TLPID_MASK: u32 = 0x0000_003f;

// ── MSR ─────────────────────────────────────────────────────────────
pub const MSR_CM: u32 = 0x8000_0000;
pub const MSR_GS: u32 = 0x1000_0000;
pub const MSR_UCLE: u32 = 0x0400_0000;
pub const MSR_CE: u32 = 0x0002_0000;
pub const MSR_EE: u32 = 0x0000_8000;
pub const MSR_PR: u32 = 0x0000_4000;
pub const MSR_ME: u32 = 0x0000_1000;
pub const MSR_DE: u32 = 0x0000_0200;
pub const MSR_IS: u32 = 0x0000_0020;
pub const MSR_DS: u32 = 0x0000_0010;
pub const MSR_RI: u32 = 0x0000_0002;

/// MSR bits a guest may see in SRR1 when an interrupt is reflected.
pub const MSR_GUEST_REFLECT: u32 = MSR_CE | MSR_ME | MSR_DE | MSR_GS | MSR_UCLE | MSR_RI;

// ── ESR ─────────────────────────────────────────────────────────────
pub const ESR_PIL: u32 = 0x0800_0000;
pub const ESR_PPR: u32 = 0x0400_0000;
pub const ESR_PTR: u32 = 0x0200_0000;
pub const ESR_ST: u32 = 0x0080_0000;
pub const ESR_EPID: u32 = 0x0000_0040;

// ── MCSR ────────────────────────────────────────────────────────────
pub const MCSR_MCP: u32 = 0x8000_0000;
pub const MCSR_NMI: u32 = 0x0010_0000;
pub const MCSR_MAV: u32 = 0x0008_0000;
pub const MCSR_MEA: u32 = 0x0004_0000;
pub const MCSR_IF: u32 = 0x0001_0000;
pub const MCSR_LD: u32 = 0x0000_8000;
pub const MCSR_ST: u32 = 0x0000_4000;

// ── TSR / TCR ───────────────────────────────────────────────────────
pub const TSR_ENW: u32 = 0x8000_0000;
pub const TSR_WIS: u32 = 0x4000_0000;
pub const TSR_WRS_MASK: u32 = 0x3000_0000;
pub const TSR_DIS: u32 = 0x0800_0000;
pub const TSR_FIS: u32 = 0x0400_0000;

pub const TCR_WP_MASK: u32 = 0xc000_0000;
pub const TCR_WP_SHIFT: u32 = 30;
pub const TCR_WRC_MASK: u32 = 0x3000_0000;
pub const TCR_WRC_SHIFT: u32 = 28;
pub const TCR_WIE: u32 = 0x0800_0000;
pub const TCR_DIE: u32 = 0x0400_0000;
pub const TCR_FP_MASK: u32 = 0x0300_0000;
pub const TCR_FP_SHIFT: u32 = 24;
pub const TCR_FIE: u32 = 0x0080_0000;
pub const TCR_ARE: u32 = 0x0040_0000;
/// Watchdog period extension, concatenated below TCR[WP].
pub const TCR_WPEXT_MASK: u32 = 0x001e_0000;
pub const TCR_WPEXT_SHIFT: u32 = 17;
/// FIT period extension, concatenated below TCR[FP].
pub const TCR_FPEXT_MASK: u32 = 0x0001_e000;
pub const TCR_FPEXT_SHIFT: u32 = 13;

/// Timebase bit selected by the guest's FIT period (0 = MSB).
#[inline]
pub const fn tcr_fit_bit(tcr: u32) -> u32 {
    ((tcr & TCR_FP_MASK) >> TCR_FP_SHIFT) | (((tcr & TCR_FPEXT_MASK) >> TCR_FPEXT_SHIFT) << 2)
}

/// Timebase bit selected by the guest's watchdog period.
#[inline]
pub const fn tcr_wd_bit(tcr: u32) -> u32 {
    ((tcr & TCR_WP_MASK) >> TCR_WP_SHIFT) | (((tcr & TCR_WPEXT_MASK) >> TCR_WPEXT_SHIFT) << 2)
}

bitflags::bitflags! {
    /// Software page-table attribute word (second word of each PTE).
    ///
    /// The low six bits are the MAS3 permission bits verbatim; VF/GS map
    /// onto MAS8; the high nibble is the TSIZE of the mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteAttr: u32 {
        const SR     = MAS3_SR;
        const UR     = MAS3_UR;
        const SW     = MAS3_SW;
        const UW     = MAS3_UW;
        const SX     = MAS3_SX;
        const UX     = MAS3_UX;
        /// Virtualization fault: accesses trap to a device emulation hook.
        const VF     = 0x0000_0040;
        /// Guest-space translation (MAS8[TGS]).
        const GS     = 0x0000_0080;
        const VALID  = 0x0000_1000;
        /// PID-zero (global) mapping.
        const GLOBAL = 0x0000_2000;
        /// Page may be a DMA target through the IOMMU.
        const DMA    = 0x0000_8000;
        const E      = 0x0001_0000;
        const G      = 0x0002_0000;
        const M      = 0x0004_0000;
        const I      = 0x0008_0000;
        const W      = 0x0010_0000;
        const _ = !0;
    }
}

pub const PTE_SIZE_SHIFT: u32 = 28;
pub const PTE_SIZE_MASK: u32 = 0xf000_0000;
pub const PTE_MAS3_MASK: u32 = MAS3_PERM_MASK;
/// PTE bits forwarded into MAS8 (VF and GS, shifted to the top).
pub const PTE_MAS8_SHIFT: u32 = 24;
pub const PTE_MAS8_MASK: u32 = 0xc000_0000;
/// PTE bits forwarded into MAS2 flags.
pub const PTE_MAS2_SHIFT: u32 = 16;
pub const PTE_MAS2_MASK: u32 = MAS2_FLAGS;

impl PteAttr {
    #[inline]
    pub fn tsize(self) -> u32 {
        self.bits() >> PTE_SIZE_SHIFT
    }

    #[inline]
    pub fn with_tsize(self, tsize: u32) -> PteAttr {
        PteAttr::from_bits_retain((self.bits() & !PTE_SIZE_MASK) | (tsize << PTE_SIZE_SHIFT))
    }

    /// MAS3 permission bits of this mapping.
    #[inline]
    pub fn mas3_perms(self) -> u32 {
        self.bits() & PTE_MAS3_MASK
    }

    /// MAS2 WIMGE flags of this mapping.
    #[inline]
    pub fn mas2_flags(self) -> u32 {
        (self.bits() >> PTE_MAS2_SHIFT) & PTE_MAS2_MASK
    }

    /// MAS8 TGS/VF bits of this mapping.
    #[inline]
    pub fn mas8_bits(self) -> u32 {
        (self.bits() << PTE_MAS8_SHIFT) & PTE_MAS8_MASK
    }
}

/// One hardware (or shadow) TLB entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub mas1: u32,
    pub mas2: u32,
    pub mas3: u32,
    pub mas7: u32,
    pub mas8: u32,
}

impl TlbEntry {
    pub const fn empty() -> Self {
        TlbEntry { mas1: 0, mas2: 0, mas3: 0, mas7: 0, mas8: 0 }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.mas1 & MAS1_VALID != 0
    }

    #[inline]
    pub fn tsize(&self) -> u32 {
        mas1_tsize(self.mas1)
    }

    /// Effective page number (virtual address >> 12).
    #[inline]
    pub fn epn(&self) -> u64 {
        (self.mas2 & MAS2_EPN) as u64 >> PAGE_SHIFT
    }

    /// Real page number including MAS7 high bits.
    #[inline]
    pub fn rpn(&self) -> u64 {
        ((self.mas7 as u64) << (32 - PAGE_SHIFT)) | ((self.mas3 & MAS3_RPN) as u64 >> PAGE_SHIFT)
    }

    /// Does this entry translate `epn` in address space `ts` for `pid`?
    /// A TID of zero matches every PID.
    pub fn matches(&self, epn: u64, ts: u32, pid: u32) -> bool {
        if !self.is_valid() {
            return false;
        }
        if (self.mas1 >> MAS1_TS_SHIFT) & 1 != ts {
            return false;
        }
        let tid = mas1_tid(self.mas1);
        if tid != 0 && tid != pid {
            return false;
        }
        let pages = tsize_to_pages(self.tsize());
        let base = self.epn() & !(pages - 1);
        epn >= base && epn < base + pages
    }
}

/// Build a TLB entry from its parts; `rpn` carries into MAS7 above 4 GiB.
#[allow(clippy::too_many_arguments)]
pub fn tlb_entry(
    epn: u64,
    rpn: u64,
    tsize: u32,
    mas2_flags: u32,
    mas3_flags: u32,
    tid: u32,
    ts: u32,
    mas8: u32,
) -> TlbEntry {
    TlbEntry {
        mas1: MAS1_VALID
            | ((tid << MAS1_TID_SHIFT) & MAS1_TID_MASK)
            | ((ts & 1) << MAS1_TS_SHIFT)
            | ((tsize << MAS1_TSIZE_SHIFT) & MAS1_TSIZE_MASK),
        mas2: ((epn << PAGE_SHIFT) as u32 & MAS2_EPN) | (mas2_flags & MAS2_FLAGS),
        mas3: ((rpn << PAGE_SHIFT) as u32 & MAS3_RPN) | (mas3_flags & MAS3_PERM_MASK),
        mas7: (rpn >> (32 - PAGE_SHIFT)) as u32,
        mas8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsize_to_pages() {
        assert_eq!(tsize_to_pages(TLB_TSIZE_4K), 1);
        assert_eq!(tsize_to_pages(TLB_TSIZE_16K), 4);
        assert_eq!(tsize_to_pages(TLB_TSIZE_4M), 1024);
        assert_eq!(tsize_to_pages(TLB_TSIZE_1G), 1 << 18);
    }

    #[test]
    fn test_max_page_size_alignment() {
        // 4 MiB-aligned epn with a full directory span allows a 4M page
        assert_eq!(max_page_size(0x400, 1024), TLB_TSIZE_4M);
        // one page short of a 4M span caps at 1M
        assert_eq!(max_page_size(0x400, 1023), TLB_TSIZE_1M);
        // misaligned start caps at 4K
        assert_eq!(max_page_size(0x401, 1024), TLB_TSIZE_4K);
    }

    #[test]
    fn test_natural_alignment() {
        assert_eq!(natural_alignment(0), TLB_TSIZE_MAX);
        assert_eq!(natural_alignment(1), TLB_TSIZE_4K);
        assert_eq!(natural_alignment(4), TLB_TSIZE_16K);
        assert_eq!(natural_alignment(1024), TLB_TSIZE_4M);
    }

    #[test]
    fn test_tlb_entry_roundtrip() {
        let e = tlb_entry(0x10000, 0x1_00000, TLB_TSIZE_16K, MAS2_M, MAS3_SR | MAS3_SW, 5, 1, 2);
        assert!(e.is_valid());
        assert_eq!(e.epn(), 0x10000 & 0xfffff); // EPN is 32-bit in MAS2
        assert_eq!(e.rpn(), 0x1_00000);
        assert_eq!(e.tsize(), TLB_TSIZE_16K);
        assert_eq!(mas1_tid(e.mas1), 5);
    }

    #[test]
    fn test_tlb_entry_matches() {
        let e = tlb_entry(0x1000, 0x2000, TLB_TSIZE_64K, 0, MAS3_SR, 0, 0, 0);
        // 64K = 16 pages starting at the 16-page-aligned base
        assert!(e.matches(0x1000, 0, 7)); // TID 0 is global
        assert!(e.matches(0x100f, 0, 7));
        assert!(!e.matches(0x1010, 0, 7));
        assert!(!e.matches(0x1000, 1, 7));
    }

    #[test]
    fn test_pte_attr_mas_projection() {
        let attr = (PteAttr::SR | PteAttr::SW | PteAttr::GS | PteAttr::M | PteAttr::I)
            .with_tsize(TLB_TSIZE_4K);
        assert_eq!(attr.mas3_perms(), MAS3_SR | MAS3_SW);
        assert_eq!(attr.mas2_flags(), MAS2_M | MAS2_I);
        assert_eq!(attr.mas8_bits(), MAS8_TGS);
        assert_eq!(attr.tsize(), TLB_TSIZE_4K);
    }

    #[test]
    fn test_fit_bit_concatenation() {
        // FP = 2, FPEXT = 3 -> bit index 0b1110
        let tcr = (2 << TCR_FP_SHIFT) | (3 << TCR_FPEXT_SHIFT);
        assert_eq!(tcr_fit_bit(tcr), 14);
    }
}
