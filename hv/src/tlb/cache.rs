//! Software TLB0 cache.
//!
//! A 4-way set-associative cache of guest TLB0 entries, consulted on the
//! TLB-miss hot path before reflecting the miss to the guest. A hit
//! loads the MAS registers and writes the real TLB directly; a miss
//! reflects ITLB/DTLB to the guest, whose `tlbwe` then populates the
//! cache.
//!
//! Tags pack into one 64-bit word so the miss handler can read them
//! atomically without taking a lock:
//!   Bits [31:0]  - vaddr above the page and index bits
//!   Bit  [32]    - valid
//!   Bit  [33]    - address space
//!   Bits [39:34] - LPID (6 bits)
//!   Bits [53:40] - PID (14 bits)
//!
//! Readers are lock-free; writers publish by clearing the tag, storing
//! the entry word, then storing the new tag, so a racing reader sees a
//! fully valid or fully invalid line.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{tlb_entry, TlbEntry, PAGE_SHIFT};

pub const TLBC_WAYS: usize = 4;
/// At least 1024 sets (64 KiB of cache).
pub const TLBC_MIN_IDX_BITS: u32 = 10;

const TAG_VALID: u64 = 1 << 32;
const TAG_SPACE: u64 = 1 << 33;
const TAG_LPID_SHIFT: u32 = 34;
const TAG_PID_SHIFT: u32 = 40;

/// One cached guest TLB0 entry: real mas2/mas3/mas7 plus the tsize and
/// the guest's own mas3 rights (needed when the guest reads back).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbcEntry {
    pub mas3: u32,
    pub mas2flags: u8,
    pub mas7: u8,
    pub tsize: u8,
    pub mas8: u8,
    pub gmas3: u8,
}

impl TlbcEntry {
    fn pack(self) -> u64 {
        (self.mas3 as u64)
            | ((self.mas2flags as u64) << 32)
            | ((self.mas7 as u64) << 40)
            | ((self.tsize as u64) << 44)
            | ((self.mas8 as u64) << 48)
            | ((self.gmas3 as u64) << 50)
    }

    fn unpack(word: u64) -> Self {
        TlbcEntry {
            mas3: word as u32,
            mas2flags: (word >> 32) as u8,
            mas7: ((word >> 40) & 0xf) as u8,
            tsize: ((word >> 44) & 0xf) as u8,
            mas8: ((word >> 48) & 0x3) as u8,
            gmas3: ((word >> 50) & 0x3f) as u8,
        }
    }
}

struct Way {
    tag: AtomicU64,
    entry: AtomicU64,
}

/// One set: 4 (tag, entry) pairs.
pub struct TlbcSet {
    ways: [Way; TLBC_WAYS],
}

impl TlbcSet {
    fn new() -> Self {
        TlbcSet {
            ways: [const { Way { tag: AtomicU64::new(0), entry: AtomicU64::new(0) } }; TLBC_WAYS],
        }
    }
}

pub struct TlbCache {
    sets: Vec<TlbcSet>,
    idx_bits: u32,
}

impl TlbCache {
    pub fn new(idx_bits: u32) -> Self {
        let idx_bits = idx_bits.max(TLBC_MIN_IDX_BITS);
        let mut sets = Vec::with_capacity(1 << idx_bits);
        sets.resize_with(1 << idx_bits, TlbcSet::new);
        TlbCache { sets, idx_bits }
    }

    #[inline]
    fn set_index(&self, vaddr: u64) -> usize {
        ((vaddr >> PAGE_SHIFT) & ((1 << self.idx_bits) - 1)) as usize
    }

    /// Constant-time tag construction for the miss-handler fast path.
    #[inline]
    pub fn make_tag(&self, vaddr: u64, pid: u32, space: u32, lpid: u32) -> u64 {
        ((vaddr >> (PAGE_SHIFT + self.idx_bits)) & 0xffff_ffff)
            | TAG_VALID
            | if space != 0 { TAG_SPACE } else { 0 }
            | (((lpid & 0x3f) as u64) << TAG_LPID_SHIFT)
            | (((pid & 0x3fff) as u64) << TAG_PID_SHIFT)
    }

    /// Linear scan of the 4 ways; returns the hit way and entry.
    pub fn find_gtlb_entry(&self, vaddr: u64, tag: u64) -> Option<(usize, usize, TlbcEntry)> {
        let set = self.set_index(vaddr);
        for way in 0..TLBC_WAYS {
            let w = &self.sets[set].ways[way];
            if w.tag.load(Ordering::Acquire) == tag {
                return Some((set, way, TlbcEntry::unpack(w.entry.load(Ordering::Acquire))));
            }
        }
        None
    }

    /// Insert (or replace) a line for `vaddr`. Way choice: first invalid
    /// way, else a vaddr-derived victim.
    pub fn insert(&self, vaddr: u64, pid: u32, space: u32, lpid: u32, entry: TlbcEntry) {
        let set = self.set_index(vaddr);
        let tag = self.make_tag(vaddr, pid, space, lpid);

        let mut victim = (vaddr >> PAGE_SHIFT) as usize % TLBC_WAYS;
        for way in 0..TLBC_WAYS {
            let cur = self.sets[set].ways[way].tag.load(Ordering::Acquire);
            if cur & TAG_VALID == 0 || cur == tag {
                victim = way;
                break;
            }
        }

        let w = &self.sets[set].ways[victim];
        w.tag.store(0, Ordering::Release);
        w.entry.store(entry.pack(), Ordering::Release);
        w.tag.store(tag, Ordering::Release);
    }

    /// Drop the line for one translation, if cached.
    pub fn invalidate(&self, vaddr: u64, pid: u32, space: u32, lpid: u32) {
        let set = self.set_index(vaddr);
        let tag = self.make_tag(vaddr, pid, space, lpid);
        for way in 0..TLBC_WAYS {
            let w = &self.sets[set].ways[way];
            if w.tag.load(Ordering::Acquire) == tag {
                w.tag.store(0, Ordering::Release);
            }
        }
    }

    /// Drop every line belonging to a partition (partition stop/restart).
    pub fn invalidate_lpid(&self, lpid: u32) {
        let field = ((lpid & 0x3f) as u64) << TAG_LPID_SHIFT;
        let mask = 0x3fu64 << TAG_LPID_SHIFT;
        for set in &self.sets {
            for w in &set.ways {
                if w.tag.load(Ordering::Acquire) & mask == field {
                    w.tag.store(0, Ordering::Release);
                }
            }
        }
    }

    /// Expand a hit into MAS register values ready for a hardware
    /// `tlbwe` of the real TLB0 entry.
    pub fn gtlb0_to_mas(&self, set: usize, way: usize, vaddr: u64, pid: u32, space: u32) -> Option<TlbEntry> {
        let w = &self.sets[set].ways[way];
        let tag = w.tag.load(Ordering::Acquire);
        if tag & TAG_VALID == 0 {
            return None;
        }
        let e = TlbcEntry::unpack(w.entry.load(Ordering::Acquire));
        let epn = vaddr >> PAGE_SHIFT;
        let rpn = ((e.mas7 as u64) << (32 - PAGE_SHIFT)) | ((e.mas3 >> PAGE_SHIFT) as u64);

        let mut te = tlb_entry(
            epn,
            rpn,
            e.tsize as u32,
            e.mas2flags as u32,
            e.mas3 & 0x3f,
            pid,
            space,
            (e.mas8 as u32) << 30,
        );
        te.mas3 = e.mas3;
        Some(te)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mas3: u32) -> TlbcEntry {
        TlbcEntry { mas3, mas2flags: 0x0c, mas7: 1, tsize: 1, mas8: 2, gmas3: 0x3f }
    }

    #[test]
    fn test_entry_pack_roundtrip() {
        let e = entry(0xdead_b03f);
        assert_eq!(TlbcEntry::unpack(e.pack()), e);
    }

    #[test]
    fn test_insert_and_find() {
        let c = TlbCache::new(TLBC_MIN_IDX_BITS);
        let vaddr = 0x1234_5000;
        c.insert(vaddr, 7, 0, 2, entry(0x1000_0005));

        let tag = c.make_tag(vaddr, 7, 0, 2);
        let (_, _, e) = c.find_gtlb_entry(vaddr, tag).expect("hit");
        assert_eq!(e.mas3, 0x1000_0005);
    }

    #[test]
    fn test_tag_discriminates_pid_space_lpid() {
        let c = TlbCache::new(TLBC_MIN_IDX_BITS);
        let vaddr = 0x8000_0000;
        c.insert(vaddr, 7, 0, 2, entry(1));

        assert!(c.find_gtlb_entry(vaddr, c.make_tag(vaddr, 8, 0, 2)).is_none());
        assert!(c.find_gtlb_entry(vaddr, c.make_tag(vaddr, 7, 1, 2)).is_none());
        assert!(c.find_gtlb_entry(vaddr, c.make_tag(vaddr, 7, 0, 3)).is_none());
        assert!(c.find_gtlb_entry(vaddr, c.make_tag(vaddr, 7, 0, 2)).is_some());
    }

    #[test]
    fn test_four_ways_per_set() {
        let c = TlbCache::new(TLBC_MIN_IDX_BITS);
        let base = 0x4000_0000u64;
        let stride = 1u64 << (PAGE_SHIFT + TLBC_MIN_IDX_BITS);

        // four different tags, same set
        for i in 0..4u64 {
            c.insert(base + i * stride, 1, 0, 1, entry(i as u32));
        }
        for i in 0..4u64 {
            let va = base + i * stride;
            let tag = c.make_tag(va, 1, 0, 1);
            assert_eq!(c.find_gtlb_entry(va, tag).unwrap().2.mas3, i as u32);
        }

        // a fifth insert evicts one line but leaves the set coherent
        c.insert(base + 4 * stride, 1, 0, 1, entry(4));
        let hits = (0..5u64)
            .filter(|&i| {
                let va = base + i * stride;
                c.find_gtlb_entry(va, c.make_tag(va, 1, 0, 1)).is_some()
            })
            .count();
        assert_eq!(hits, 4);
    }

    #[test]
    fn test_invalidate() {
        let c = TlbCache::new(TLBC_MIN_IDX_BITS);
        let vaddr = 0x6000_0000;
        c.insert(vaddr, 1, 0, 1, entry(9));
        c.invalidate(vaddr, 1, 0, 1);
        assert!(c.find_gtlb_entry(vaddr, c.make_tag(vaddr, 1, 0, 1)).is_none());
    }

    #[test]
    fn test_invalidate_lpid_sweeps_partition() {
        let c = TlbCache::new(TLBC_MIN_IDX_BITS);
        c.insert(0x1000, 1, 0, 2, entry(1));
        c.insert(0x2000, 1, 0, 3, entry(2));
        c.invalidate_lpid(2);

        assert!(c.find_gtlb_entry(0x1000, c.make_tag(0x1000, 1, 0, 2)).is_none());
        assert!(c.find_gtlb_entry(0x2000, c.make_tag(0x2000, 1, 0, 3)).is_some());
    }

    #[test]
    fn test_gtlb0_to_mas() {
        let c = TlbCache::new(TLBC_MIN_IDX_BITS);
        let vaddr = 0x1234_5000u64;
        c.insert(vaddr, 7, 1, 2, TlbcEntry {
            mas3: 0xabcd_e03d,
            mas2flags: 0x04,
            mas7: 0,
            tsize: 1,
            mas8: 2,
            gmas3: 0x3d,
        });

        let tag = c.make_tag(vaddr, 7, 1, 2);
        let (set, way, _) = c.find_gtlb_entry(vaddr, tag).unwrap();
        let te = c.gtlb0_to_mas(set, way, vaddr, 7, 1).unwrap();

        assert_eq!(te.epn(), vaddr >> PAGE_SHIFT);
        assert_eq!(te.mas3, 0xabcd_e03d);
        assert_eq!(te.tsize(), 1);
        assert_eq!(te.mas1 & crate::arch::MAS1_TS, crate::arch::MAS1_TS);
    }
}
