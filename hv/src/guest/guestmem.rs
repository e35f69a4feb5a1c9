//! Guest memory access.
//!
//! On e500mc the hypervisor reaches guest memory with external-PID
//! loads and stores; this rendering translates explicitly through the
//! guest's TLB state and the guest-physical map instead, with the same
//! failure modes: a missing translation is a TLB miss, an unmapped
//! guest-physical page is a TLB error.

use alloc::sync::Arc;

use crate::arch::PAGE_SHIFT;
use crate::errors::{Error, Result};
use crate::mem::gphys::Xlate;

use super::gcpu::Gcpu;
use super::Guest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestMemFault {
    TlbMiss,
    TlbErr,
}

/// Translate a guest-virtual address through the vCPU's TLB state.
pub fn virt_to_gphys(gcpu: &Gcpu, vaddr: u64, space: u32, pid: u32) -> Option<u64> {
    let epn = vaddr >> PAGE_SHIFT;
    let tlb1 = gcpu.tlb1.lock();

    for e in tlb1.gtlb1.iter() {
        if e.matches(epn, space, pid) {
            let pages = crate::arch::tsize_to_pages(e.tsize());
            let grpn_base = e.rpn() & !(pages - 1);
            let grpn = grpn_base | (epn & (pages - 1));
            return Some((grpn << PAGE_SHIFT) | (vaddr & 0xfff));
        }
    }
    None
}

/// Copy into guest-physical memory (image loading, generated trees).
pub fn copy_to_gphys(guest: &Arc<Guest>, gaddr: u64, buf: &[u8]) -> Result<()> {
    let hv = guest.hv.upgrade().ok_or(Error::NoDev)?;
    let gphys = guest.gphys.lock();

    let mut gaddr = gaddr;
    let mut rest = buf;
    while !rest.is_empty() {
        let grpn = gaddr >> PAGE_SHIFT;
        let off = (gaddr & 0xfff) as usize;
        let n = rest.len().min(4096 - off);

        match gphys.xlate(grpn, false) {
            Xlate::Mapped { rpn, .. } => {
                hv.phys_mem.write((rpn << PAGE_SHIFT) | off as u64, &rest[..n]);
            }
            Xlate::Hole { .. } => return Err(Error::Fault),
        }

        gaddr += n as u64;
        rest = &rest[n..];
    }
    Ok(())
}

/// Copy out of guest-physical memory.
pub fn copy_from_gphys(guest: &Arc<Guest>, gaddr: u64, buf: &mut [u8]) -> Result<()> {
    let hv = guest.hv.upgrade().ok_or(Error::NoDev)?;
    let gphys = guest.gphys.lock();

    let mut gaddr = gaddr;
    let mut rest: &mut [u8] = buf;
    while !rest.is_empty() {
        let grpn = gaddr >> PAGE_SHIFT;
        let off = (gaddr & 0xfff) as usize;
        let n = rest.len().min(4096 - off);

        match gphys.xlate(grpn, false) {
            Xlate::Mapped { rpn, .. } => {
                hv.phys_mem.read((rpn << PAGE_SHIFT) | off as u64, &mut rest[..n]);
            }
            Xlate::Hole { .. } => return Err(Error::Fault),
        }

        gaddr += n as u64;
        rest = &mut rest[n..];
    }
    Ok(())
}

/// Read guest memory at a guest-virtual address, as the emulation paths
/// do when fetching the faulting instruction.
pub fn read_virt(
    gcpu: &Gcpu,
    guest: &Arc<Guest>,
    vaddr: u64,
    space: u32,
    pid: u32,
    buf: &mut [u8],
) -> core::result::Result<(), GuestMemFault> {
    let gaddr = virt_to_gphys(gcpu, vaddr, space, pid).ok_or(GuestMemFault::TlbMiss)?;
    copy_from_gphys(guest, gaddr, buf).map_err(|_| GuestMemFault::TlbErr)
}
