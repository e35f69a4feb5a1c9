//! Guest-physical translation tables.
//!
//! A two-level table of 1024-entry directories over 4 KiB pages maps
//! guest-physical page numbers to real-physical page numbers. Top-level
//! slots hold either a pointer to a bottom-level table, a large-page
//! mapping (4 MiB and up), or an invalid marker used to skip holes.
//! Each partition owns a forward table (`gphys`) and a reverse table
//! built with the same type.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::{
    max_page_size, natural_alignment, tsize_to_pages, PteAttr, PGDIR_SHIFT, PGDIR_SIZE,
    TLB_TSIZE_4M,
};
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// One page-table entry: a page frame and an attribute word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub page: u64,
    pub attr: PteAttr,
}

impl Pte {
    pub const fn invalid() -> Self {
        Pte { page: 0, attr: PteAttr::empty() }
    }
}

/// Bottom-level directory: 1024 small-page PTEs.
struct PageDir {
    ptes: [Pte; PGDIR_SIZE],
}

impl PageDir {
    fn new() -> Box<Self> {
        Box::new(PageDir { ptes: [Pte::invalid(); PGDIR_SIZE] })
    }
}

/// Top-level slot.
enum Slot {
    Invalid,
    /// Large page (TSIZE >= 4M) covering this whole directory span.
    Mapped(Pte),
    Dir(Box<PageDir>),
}

/// Result of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlate {
    /// Real page number covering the queried page, plus its attributes.
    Mapped { rpn: u64, attr: PteAttr },
    /// No mapping; `skip` is a low-bit mask the caller can use to jump
    /// past the hole (`epn = (epn | skip) + 1`).
    Hole { skip: u64 },
}

impl Xlate {
    pub fn rpn(&self) -> Option<u64> {
        match *self {
            Xlate::Mapped { rpn, .. } => Some(rpn),
            Xlate::Hole { .. } => None,
        }
    }
}

/// Two-level guest-physical page table.
pub struct PageTable {
    top: Vec<Slot>,
    /// Small-over-large overwrite requests rejected (configuration bugs).
    pub rejected_overlaps: u64,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    pub fn new() -> Self {
        let mut top = Vec::with_capacity(PGDIR_SIZE);
        top.resize_with(PGDIR_SIZE, || Slot::Invalid);
        PageTable { top, rejected_overlaps: 0 }
    }

    /// Map `npages` pages at guest page `epn` to real page `rpn`,
    /// greedily using the largest page sizes both alignments allow.
    /// `attr` must carry no TSIZE bits; sizes are chosen here. Large
    /// mappings are a latency source and belong in init-time code paths.
    pub fn map(&mut self, epn: u64, rpn: u64, npages: u64, attr: PteAttr) {
        let end = epn + npages;
        let mut epn = epn;
        let mut rpn = rpn;

        printlog!(LogType::Mmu, LogLevel::Debug,
                  "gphys map: epn {:#x} end {:#x} rpn {:#x}", epn, end, rpn);

        while epn < end {
            let size = max_page_size(epn, end - epn).min(natural_alignment(rpn));
            let size_pages = tsize_to_pages(size);
            let sub_end = epn + size_pages;
            let chunk_attr = attr.with_tsize(size);

            debug_assert!(size_pages <= end - epn);

            if size >= TLB_TSIZE_4M {
                while epn < sub_end {
                    let idx = (epn >> PGDIR_SHIFT) as usize & (PGDIR_SIZE - 1);
                    if let Slot::Dir(_) = self.top[idx] {
                        // Overwriting existing small mappings; callers
                        // guarantee the small pages were a subset.
                        printlog!(LogType::Mmu, LogLevel::Debug,
                                  "gphys map: large page replaces small pages at epn {:#x}",
                                  epn);
                    }
                    self.top[idx] = Slot::Mapped(Pte { page: rpn, attr: chunk_attr });
                    epn = (epn | (PGDIR_SIZE as u64 - 1)) + 1;
                    rpn = (rpn | (PGDIR_SIZE as u64 - 1)) + 1;
                }
            } else {
                while epn < sub_end {
                    let idx = (epn >> PGDIR_SHIFT) as usize & (PGDIR_SIZE - 1);
                    match self.top[idx] {
                        Slot::Mapped(_) => {
                            // A large page already covers this span. The
                            // request is dropped; see rejected_overlaps.
                            self.rejected_overlaps += 1;
                            printlog!(LogType::Mmu, LogLevel::Warn,
                                      "gphys map: small page inside large page at epn {:#x}, dropped",
                                      epn);
                            epn += 1;
                            rpn += 1;
                            continue;
                        }
                        Slot::Invalid => {
                            self.top[idx] = Slot::Dir(PageDir::new());
                        }
                        Slot::Dir(_) => {}
                    }

                    if let Slot::Dir(ref mut dir) = self.top[idx] {
                        let sub = epn as usize & (PGDIR_SIZE - 1);
                        dir.ptes[sub] = Pte { page: rpn, attr: chunk_attr };
                    }

                    epn += 1;
                    rpn += 1;
                }
            }
        }
    }

    /// Translate one guest page. With `dma` set, the DMA attribute gates
    /// validity instead of VALID (IOMMU-eligible mappings only).
    pub fn xlate(&self, epn: u64, dma: bool) -> Xlate {
        let valid = if dma { PteAttr::DMA } else { PteAttr::VALID };
        let idx = (epn >> PGDIR_SHIFT) as usize & (PGDIR_SIZE - 1);

        let pte = match self.top[idx] {
            Slot::Invalid => {
                return Xlate::Hole { skip: (1 << PGDIR_SHIFT) - 1 };
            }
            Slot::Mapped(pte) => {
                debug_assert!(pte.attr.tsize() >= TLB_TSIZE_4M);
                if !pte.attr.contains(valid) {
                    return Xlate::Hole { skip: (1 << PGDIR_SHIFT) - 1 };
                }
                pte
            }
            Slot::Dir(ref dir) => {
                let pte = dir.ptes[epn as usize & (PGDIR_SIZE - 1)];
                debug_assert!(!pte.attr.contains(PteAttr::VALID)
                              || pte.attr.tsize() < TLB_TSIZE_4M);
                if !pte.attr.contains(valid) {
                    return Xlate::Hole { skip: 0 };
                }
                pte
            }
        };

        #[cfg(feature = "mmu-trace")]
        printlog!(LogType::Mmu, LogLevel::Verbose,
                  "gphys xlate: epn {:#x} -> page {:#x} attr {:#x}",
                  epn, pte.page, pte.attr.bits());

        let size_pages = tsize_to_pages(pte.attr.tsize());
        Xlate::Mapped {
            rpn: (pte.page & !(size_pages - 1)) | (epn & (size_pages - 1)),
            attr: pte.attr,
        }
    }

    /// Verify that `[grpn, grpn + npages)` is contiguous in real-physical
    /// space, DMA-mapped and writable, and return the starting real page.
    /// Used by hypercalls that hand guest buffers to the hypervisor.
    pub fn get_rpn(&self, grpn: u64, npages: u64) -> Option<u64> {
        let end = grpn + npages;
        let mut grpn = grpn;
        let mut start_rpn = None;
        let mut next_rpn = 0u64;

        while grpn < end {
            let (rpn, attr) = match self.xlate(grpn, true) {
                Xlate::Mapped { rpn, attr } => (rpn, attr),
                Xlate::Hole { .. } => {
                    printlog!(LogType::Mmu, LogLevel::Error,
                              "get_rpn: unmapped guest address at {:#x}",
                              grpn << crate::arch::PAGE_SHIFT);
                    return None;
                }
            };

            match start_rpn {
                None => start_rpn = Some(rpn),
                Some(_) if rpn != next_rpn => {
                    printlog!(LogType::Mmu, LogLevel::Error,
                              "get_rpn: discontiguity at guest address {:#x}",
                              grpn << crate::arch::PAGE_SHIFT);
                    return None;
                }
                Some(_) => {}
            }

            if !attr.intersects(PteAttr::SW | PteAttr::UW) {
                printlog!(LogType::Mmu, LogLevel::Error,
                          "get_rpn: not writeable at guest address {:#x}",
                          grpn << crate::arch::PAGE_SHIFT);
                return None;
            }

            let cur = tsize_to_pages(attr.tsize()) - (grpn & (tsize_to_pages(attr.tsize()) - 1));
            grpn += cur;
            next_rpn = rpn + cur;
        }

        start_rpn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{TLB_TSIZE_16K, TLB_TSIZE_4K};

    fn attr_rw() -> PteAttr {
        PteAttr::VALID | PteAttr::DMA | PteAttr::SR | PteAttr::SW | PteAttr::UR | PteAttr::UW
    }

    #[test]
    fn test_map_single_page() {
        let mut pt = PageTable::new();
        pt.map(0x10, 0x5010, 1, attr_rw());

        match pt.xlate(0x10, false) {
            Xlate::Mapped { rpn, attr } => {
                assert_eq!(rpn, 0x5010);
                assert_eq!(attr.tsize(), TLB_TSIZE_4K);
            }
            Xlate::Hole { .. } => panic!("expected mapping"),
        }
        assert_eq!(pt.xlate(0x11, false), Xlate::Hole { skip: 0 });
    }

    #[test]
    fn test_map_picks_large_pages() {
        let mut pt = PageTable::new();
        // 4 MiB aligned both sides: one large top-level slot
        pt.map(0x400, 0x400, 1024, attr_rw());

        match pt.xlate(0x7ff, false) {
            Xlate::Mapped { rpn, attr } => {
                assert_eq!(rpn, 0x7ff);
                assert_eq!(attr.tsize(), TLB_TSIZE_4M);
            }
            Xlate::Hole { .. } => panic!("expected large mapping"),
        }
    }

    #[test]
    fn test_map_mixed_alignment() {
        let mut pt = PageTable::new();
        // misaligned rpn limits page size
        pt.map(0, 3, 8, attr_rw());

        for i in 0..8 {
            assert_eq!(pt.xlate(i, false).rpn(), Some(3 + i));
        }
        assert_eq!(pt.xlate(8, false).rpn(), None);
    }

    #[test]
    fn test_hole_skip_mask() {
        let pt = PageTable::new();
        match pt.xlate(0x12345, false) {
            Xlate::Hole { skip } => assert_eq!(skip, 0x3ff),
            _ => panic!("expected hole"),
        }
    }

    #[test]
    fn test_small_inside_large_rejected() {
        let mut pt = PageTable::new();
        pt.map(0x400, 0x400, 1024, attr_rw());
        // attempt to poke a single page into the large mapping
        pt.map(0x410, 0x9999, 1, attr_rw());

        assert_eq!(pt.rejected_overlaps, 1);
        // the large page still provides the translation
        assert_eq!(pt.xlate(0x410, false).rpn(), Some(0x410));
    }

    #[test]
    fn test_large_replaces_small_subset() {
        let mut pt = PageTable::new();
        pt.map(0x400, 0x400, 4, attr_rw());
        pt.map(0x400, 0x400, 1024, attr_rw());

        match pt.xlate(0x400, false) {
            Xlate::Mapped { attr, .. } => assert_eq!(attr.tsize(), TLB_TSIZE_4M),
            _ => panic!("expected large mapping"),
        }
    }

    #[test]
    fn test_dma_gate() {
        let mut pt = PageTable::new();
        let attr = PteAttr::VALID | PteAttr::SR | PteAttr::SW;
        pt.map(0, 0x100, 4, attr);

        assert!(pt.xlate(0, false).rpn().is_some());
        assert_eq!(pt.xlate(0, true).rpn(), None);
    }

    #[test]
    fn test_get_rpn_contiguous() {
        let mut pt = PageTable::new();
        pt.map(0, 0x1000, 16, attr_rw());
        assert_eq!(pt.get_rpn(0, 16), Some(0x1000));
        assert_eq!(pt.get_rpn(4, 8), Some(0x1004));
    }

    #[test]
    fn test_get_rpn_discontiguous() {
        let mut pt = PageTable::new();
        pt.map(0, 0x1000, 4, attr_rw());
        pt.map(4, 0x9000, 4, attr_rw());
        assert_eq!(pt.get_rpn(0, 8), None);
    }

    #[test]
    fn test_get_rpn_requires_write() {
        let mut pt = PageTable::new();
        pt.map(0, 0x1000, 4, PteAttr::VALID | PteAttr::DMA | PteAttr::SR | PteAttr::UR);
        assert_eq!(pt.get_rpn(0, 4), None);
    }

    #[test]
    fn test_sixteen_k_chunk() {
        let mut pt = PageTable::new();
        // 4-page-aligned epn and rpn, 4 pages: one 16K PTE
        pt.map(8, 0x20, 4, attr_rw());
        match pt.xlate(9, false) {
            Xlate::Mapped { rpn, attr } => {
                assert_eq!(attr.tsize(), TLB_TSIZE_16K);
                assert_eq!(rpn, 0x21);
            }
            _ => panic!("expected mapping"),
        }
    }
}
