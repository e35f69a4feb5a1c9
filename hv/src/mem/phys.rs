//! Real-physical memory access.
//!
//! On silicon the hypervisor addresses real memory through its own
//! large-page mappings; this rendering backs it with a sparse page
//! store so image loading and guest-memory copies have something to
//! land in. Pages materialize zero-filled on first touch.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use spin::Mutex;

pub const PAGE_SIZE: usize = 4096;

pub struct PhysMem {
    pages: Mutex<BTreeMap<u64, Box<[u8; PAGE_SIZE]>>>,
}

impl Default for PhysMem {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMem {
    pub fn new() -> Self {
        PhysMem { pages: Mutex::new(BTreeMap::new()) }
    }

    pub fn write(&self, paddr: u64, data: &[u8]) {
        let mut pages = self.pages.lock();
        let mut addr = paddr;
        let mut rest = data;

        while !rest.is_empty() {
            let page = addr / PAGE_SIZE as u64;
            let off = (addr % PAGE_SIZE as u64) as usize;
            let n = rest.len().min(PAGE_SIZE - off);

            let p = pages.entry(page).or_insert_with(|| Box::new([0; PAGE_SIZE]));
            p[off..off + n].copy_from_slice(&rest[..n]);

            addr += n as u64;
            rest = &rest[n..];
        }
    }

    pub fn read(&self, paddr: u64, buf: &mut [u8]) {
        let pages = self.pages.lock();
        let mut addr = paddr;
        let mut rest: &mut [u8] = buf;

        while !rest.is_empty() {
            let page = addr / PAGE_SIZE as u64;
            let off = (addr % PAGE_SIZE as u64) as usize;
            let n = rest.len().min(PAGE_SIZE - off);

            match pages.get(&page) {
                Some(p) => rest[..n].copy_from_slice(&p[off..off + n]),
                None => rest[..n].fill(0),
            }

            addr += n as u64;
            rest = &mut rest[n..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_across_pages() {
        let pm = PhysMem::new();
        let data: alloc::vec::Vec<u8> = (0..8192u32).map(|i| i as u8).collect();
        pm.write(0x1ff0, &data);

        let mut back = alloc::vec![0u8; 8192];
        pm.read(0x1ff0, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn test_untouched_reads_zero() {
        let pm = PhysMem::new();
        let mut buf = [0xffu8; 16];
        pm.read(0x9000_0000, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }
}
