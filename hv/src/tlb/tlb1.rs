//! TLB1 multiplexer.
//!
//! The guest sees a fixed 16-entry TLB1. The hardware has 64 entries, of
//! which the top `TLB1_RSVD..` are reserved for the hypervisor's own
//! mappings. Each guest entry fractures into up to N real entries,
//! bounded by the guest-physical map: only the valid intersection of the
//! guest entry's range and the gphys map is installed.

use crate::arch::{
    mas1_tsize, max_page_size, natural_alignment, tlb_entry, tsize_to_pages, TlbEntry,
    MAS1_TID_SHIFT, MAS1_TS_SHIFT, MAS8_TLPID_MASK, PAGE_SHIFT, PTE_MAS3_MASK, TLB1_GSIZE,
    TLB1_RSVD, TLB1_SIZE,
};
use crate::mem::gphys::{PageTable, Xlate};
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// Shadow of one core's hardware TLB1. On silicon, writes through this
/// type pair with `tlbwe`; the shadow is authoritative for searches
/// either way.
pub struct HwTlb1 {
    pub entries: [TlbEntry; TLB1_SIZE],
}

impl Default for HwTlb1 {
    fn default() -> Self {
        HwTlb1 { entries: [TlbEntry::empty(); TLB1_SIZE] }
    }
}

impl HwTlb1 {
    /// Write one entry to the hardware (shadow) array.
    pub fn write_entry(&mut self, idx: usize, entry: TlbEntry) {
        self.entries[idx] = entry;
    }

    pub fn invalidate_entry(&mut self, idx: usize) {
        self.entries[idx] = TlbEntry::empty();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tlb1Error {
    /// No free real entry below the hypervisor-reserved range. The
    /// guest write is refused and a machine check reflected.
    OutOfEntries,
}

/// Per-vCPU guest TLB1 state: the guest's view plus the bitmaps tying
/// each guest entry to the real entries currently implementing it.
pub struct GuestTlb1 {
    /// The guest's view of its 16 TLB1 entries.
    pub gtlb1: [TlbEntry; TLB1_GSIZE],
    /// Real entries implementing each guest entry.
    used: [u64; TLB1_GSIZE],
    /// Real entries free for guest use (never includes reserved ones).
    free: u64,
}

impl Default for GuestTlb1 {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestTlb1 {
    pub fn new() -> Self {
        GuestTlb1 {
            gtlb1: [TlbEntry::empty(); TLB1_GSIZE],
            used: [0; TLB1_GSIZE],
            free: (1u64 << TLB1_RSVD) - 1,
        }
    }

    /// Real entries currently in use by any guest entry.
    pub fn inuse_mask(&self) -> u64 {
        ((1u64 << TLB1_RSVD) - 1) & !self.free
    }

    /// Bitmap of real entries implementing guest entry `entry`.
    pub fn used_mask(&self, entry: usize) -> u64 {
        self.used[entry]
    }

    fn alloc_tlb1(&mut self, entry: usize) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let idx = self.free.trailing_zeros() as usize;
        if idx >= TLB1_RSVD {
            return None;
        }
        self.free &= !(1 << idx);
        self.used[entry] |= 1 << idx;
        Some(idx)
    }

    /// Invalidate every real entry implementing guest entry `entry`.
    pub fn free_entry(&mut self, hw: &mut HwTlb1, entry: usize) {
        while self.used[entry] != 0 {
            let idx = self.used[entry].trailing_zeros() as usize;
            debug_assert!(idx < TLB1_RSVD);

            hw.invalidate_entry(idx);
            self.used[entry] &= !(1 << idx);
            self.free |= 1 << idx;
        }
    }

    /// Map a real TLB1 index back to the guest entry it implements.
    pub fn real_to_guest(&self, idx: usize) -> Option<usize> {
        (0..TLB1_GSIZE).find(|&e| self.used[e] & (1 << idx) != 0)
    }

    /// Install guest TLB1 entry `entry` from a guest `tlbwe`, fracturing
    /// it against the guest-physical map. Returns the number of real
    /// entries installed.
    pub fn set_entry(
        &mut self,
        hw: &mut HwTlb1,
        entry: usize,
        mas1: u32,
        epn: u64,
        grpn: u64,
        mas2flags: u32,
        mas3flags: u32,
        gphys: &PageTable,
        lpid: u32,
    ) -> Result<usize, Tlb1Error> {
        let gsize = mas1_tsize(mas1);
        let size_pages = tsize_to_pages(gsize);
        let end = epn + size_pages;

        self.free_entry(hw, entry);

        self.gtlb1[entry] = TlbEntry {
            mas1,
            mas2: ((epn << PAGE_SHIFT) as u32 & crate::arch::MAS2_EPN) | mas2flags,
            mas3: ((grpn << PAGE_SHIFT) as u32 & crate::arch::MAS3_RPN) | mas3flags,
            mas7: (grpn >> (32 - PAGE_SHIFT)) as u32,
            mas8: 0,
        };

        let tid = (mas1 >> MAS1_TID_SHIFT) & 0x3fff;
        let ts = (mas1 >> MAS1_TS_SHIFT) & 1;
        let mut epn = epn;
        let mut grpn = grpn;
        let mut installed = 0;

        while epn < end {
            // Skip holes in the guest-physical map; the guest's view and
            // the map share the hole shape, so epn and grpn advance
            // together. Accesses inside a hole reflect a TLB miss, as
            // real TLB1 entries are too scarce to spend on trap mappings.
            let (rpn, attr) = match gphys.xlate(grpn, false) {
                Xlate::Hole { skip } => {
                    epn = (epn | skip) + 1;
                    grpn = (grpn | skip) + 1;
                    continue;
                }
                Xlate::Mapped { rpn, attr } => (rpn, attr),
            };

            let size = max_page_size(epn, end - epn)
                .min(natural_alignment(rpn))
                .min(attr.tsize());

            let mas3 = mas3flags & (attr.bits() & PTE_MAS3_MASK);
            let mas8 = (lpid & MAS8_TLPID_MASK) | attr.mas8_bits();

            let real = match self.alloc_tlb1(entry) {
                Some(r) => r,
                None => {
                    printlog!(LogType::Mmu, LogLevel::Error,
                              "out of TLB1 entries: gtlb1[{}] base {:#x} size {}",
                              entry, epn << PAGE_SHIFT, size);
                    // Refuse the whole write; the caller reflects a
                    // machine check to the guest.
                    self.free_entry(hw, entry);
                    self.gtlb1[entry] = TlbEntry::empty();
                    return Err(Tlb1Error::OutOfEntries);
                }
            };

            hw.write_entry(real, tlb_entry(epn, rpn, size, mas2flags, mas3, tid, ts, mas8));
            installed += 1;

            epn += tsize_to_pages(size);
            grpn += tsize_to_pages(size);
        }

        Ok(installed)
    }

    /// `tlbivax`/`tlbilx` against TLB1: free every guest entry whose
    /// virtual range covers the invalidation target.
    pub fn invalidate_va(&mut self, hw: &mut HwTlb1, vaddr: u64) {
        let epn = vaddr >> PAGE_SHIFT;
        for entry in 0..TLB1_GSIZE {
            let g = self.gtlb1[entry];
            if !g.is_valid() {
                continue;
            }
            let pages = tsize_to_pages(g.tsize());
            let base = g.epn() & !(pages - 1);
            if epn >= base && epn < base + pages {
                self.free_entry(hw, entry);
                self.gtlb1[entry] = TlbEntry::empty();
            }
        }
    }

    /// Does any valid guest TLB1 entry already translate `epn` for this
    /// (pid, space)? Checked before inserting TLB0 shadows.
    pub fn conflicts(&self, epn: u64, tsize: u32, pid: u32, space: u32) -> bool {
        let pages = tsize_to_pages(tsize);
        let start = epn & !(pages - 1);

        self.gtlb1.iter().any(|g| {
            g.matches(start, space, pid) || g.matches(start + pages - 1, space, pid)
        })
    }
}
