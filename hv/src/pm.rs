//! Power management: coordinated nap and wake.
//!
//! Only the boot core may touch the run-control (RCPM) nap bits;
//! letting every core write them directly would race. A vCPU asking
//! for nap sets its request and raises EV_SYNC_NAP; the boot core then
//! walks all secondaries and naps exactly those whose request is still
//! standing and which have no wake-worthy work pending.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::TrapFrame;
use crate::errors::{Error, EV_SUCCESS};
use crate::events;
use crate::guest::gcpu::Gcpu;
use crate::guest::Guest;
use crate::hv::Hypervisor;
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// vCPU states reported by `get_core_state`.
pub const FH_VCPU_RUN: u32 = 0;
pub const FH_VCPU_IDLE: u32 = 1;
pub const FH_VCPU_NAP: u32 = 2;

/// Run control / power management block: core nap control and status.
pub struct Rcpm {
    /// CNAPCRL: one bit per core, set = napping.
    nap_ctrl: AtomicU32,
    /// CWAITSRL: cores waiting (idle).
    wait_status: AtomicU32,
}

impl Default for Rcpm {
    fn default() -> Self {
        Self::new()
    }
}

impl Rcpm {
    pub fn new() -> Self {
        Rcpm { nap_ctrl: AtomicU32::new(0), wait_status: AtomicU32::new(0) }
    }

    pub fn nap_mask(&self) -> u32 {
        self.nap_ctrl.load(Ordering::Acquire)
    }

    fn set_nap(&self, core: usize, nap: bool) {
        if nap {
            self.nap_ctrl.fetch_or(1 << core, Ordering::AcqRel);
        } else {
            self.nap_ctrl.fetch_and(!(1 << core), Ordering::AcqRel);
        }
    }

    pub fn is_napping(&self, core: usize) -> bool {
        self.nap_ctrl.load(Ordering::Acquire) & (1 << core) != 0
    }

    pub fn is_waiting(&self, core: usize) -> bool {
        self.wait_status.load(Ordering::Acquire) & (1 << core) != 0
    }
}

/// Query one vCPU's run state from the RCPM status registers.
pub fn get_vcpu_state(hv: &Hypervisor, guest: &Guest, vcpu: usize) -> Result<u32, Error> {
    let gcpu = guest.gcpus.get(vcpu).ok_or(Error::Invalid)?;

    if hv.rcpm.is_napping(gcpu.coreid) {
        Ok(FH_VCPU_NAP)
    } else if hv.rcpm.is_waiting(gcpu.coreid) {
        Ok(FH_VCPU_IDLE)
    } else {
        Ok(FH_VCPU_RUN)
    }
}

/// EV_SYNC_NAP: runs only on the boot core. Naps every secondary whose
/// request is standing and which has nothing pending; wakes the rest.
pub fn sync_nap(hv: &Hypervisor) {
    hv.sync_nap_pending.store(false, Ordering::Release);

    for guest in hv.guests().iter() {
        for gcpu in &guest.gcpus {
            // The boot core never naps.
            if gcpu.coreid == 0 {
                continue;
            }

            let core = hv.core(gcpu.coreid);
            let nap = core.nap_request.load(Ordering::Acquire)
                && gcpu.napping.load(Ordering::Acquire)
                && !events::wake_pending(gcpu);

            hv.rcpm.set_nap(gcpu.coreid, nap);
        }
    }
}

/// `enter_nap` hypercall: the calling vCPU asks to nap. Only the
/// partition's own handle and the caller's own vCPU are accepted.
pub fn hcall_enter_nap(guest: &Arc<Guest>, gcpu: &Arc<Gcpu>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vcpu = regs.gpregs[5] as usize;

    if handle != 0 || vcpu != gcpu.gcpu_num {
        return regs.set_status(Error::Invalid.status());
    }

    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return regs.set_status(Error::NoDev.status()),
    };

    if gcpu.coreid == 0 {
        // the boot core coordinates everyone else's nap; it cannot nap
        return regs.set_status(Error::Invalid.status());
    }

    printlog!(LogType::Pm, LogLevel::Debug, "vcpu {} of {} entering nap",
              gcpu.gcpu_num, guest.name);

    gcpu.napping.store(true, Ordering::Release);
    hv.core(gcpu.coreid).nap_request.store(true, Ordering::Release);
    sync_nap(&hv);

    regs.set_status(EV_SUCCESS);
}

/// `exit_nap` hypercall: a running vCPU brings a napping sibling back.
pub fn hcall_exit_nap(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vcpu = regs.gpregs[5] as usize;

    if handle != 0 {
        return regs.set_status(Error::Invalid.status());
    }
    let target = match guest.gcpus.get(vcpu) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return regs.set_status(Error::NoDev.status()),
    };

    target.napping.store(false, Ordering::Release);
    hv.core(target.coreid).nap_request.store(false, Ordering::Release);
    sync_nap(&hv);
    wake_hcall_nap(target);

    regs.set_status(EV_SUCCESS);
}

/// Wake a napping vCPU for event delivery; a self-doorbell keeps
/// ordering with decrementer and FIT state that accumulated while the
/// core slept.
pub fn wake_hcall_nap(gcpu: &Gcpu) {
    if !gcpu.napping.load(Ordering::Acquire) {
        return;
    }
    events::setevent(gcpu, events::EV_ASSERT_VINT);
    if let Some(hv) = gcpu.guest.upgrade().and_then(|g| g.hv.upgrade()) {
        hv.sync_nap_pending.store(true, Ordering::Release);
        sync_nap(&hv);
    }
}

/// `get_core_state` hypercall.
pub fn hcall_get_core_state(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4] as usize;
    let vcpu = regs.gpregs[5] as usize;

    let target = {
        let handles = guest.handles.lock();
        match handles.get(handle).and_then(|h| h.as_partition()) {
            Some(g) => g,
            None => return regs.set_status(Error::Invalid.status()),
        }
    };

    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return regs.set_status(Error::NoDev.status()),
    };

    match get_vcpu_state(&hv, &target, vcpu) {
        Ok(state) => {
            regs.gpregs[4] = state as u64;
            regs.set_status(EV_SUCCESS);
        }
        Err(e) => regs.set_status(e.status()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::Hypervisor;

    fn four_core_guest() -> (Arc<Hypervisor>, Arc<Guest>) {
        let hv = Hypervisor::new_bare();
        let guest = Guest::new_bare_with_hv(&hv, "pm", 1, &[0, 1, 2, 3]);
        (hv, guest)
    }

    fn enter_nap(guest: &Arc<Guest>, vcpu: usize) -> u32 {
        let mut regs = TrapFrame::default();
        regs.gpregs[5] = vcpu as u64;
        hcall_enter_nap(guest, &guest.gcpus[vcpu], &mut regs);
        regs.gpregs[3] as u32
    }

    #[test]
    fn test_odd_cores_nap_even_run() {
        let (hv, guest) = four_core_guest();

        assert_eq!(enter_nap(&guest, 1), 0);
        assert_eq!(enter_nap(&guest, 3), 0);

        assert_eq!(get_vcpu_state(&hv, &guest, 1).unwrap(), FH_VCPU_NAP);
        assert_eq!(get_vcpu_state(&hv, &guest, 3).unwrap(), FH_VCPU_NAP);
        assert_eq!(get_vcpu_state(&hv, &guest, 0).unwrap(), FH_VCPU_RUN);
        assert_eq!(get_vcpu_state(&hv, &guest, 2).unwrap(), FH_VCPU_RUN);

        // RCPM nap bits reflect exactly the napping set
        assert_eq!(hv.rcpm.nap_mask(), 0b1010);
    }

    #[test]
    fn test_exit_nap_returns_to_run() {
        let (hv, guest) = four_core_guest();
        enter_nap(&guest, 1);

        let mut regs = TrapFrame::default();
        regs.gpregs[5] = 1;
        hcall_exit_nap(&guest, &mut regs);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(get_vcpu_state(&hv, &guest, 1).unwrap(), FH_VCPU_RUN);
        assert_eq!(hv.rcpm.nap_mask(), 0);
    }

    #[test]
    fn test_boot_core_cannot_nap() {
        let (_hv, guest) = four_core_guest();
        assert_eq!(enter_nap(&guest, 0), Error::Invalid.status());
    }

    #[test]
    fn test_pending_event_blocks_nap() {
        let (hv, guest) = four_core_guest();
        enter_nap(&guest, 1);
        assert!(hv.rcpm.is_napping(1));

        // posting a gevent wakes the core at the next sync
        events::setgevent(&guest.gcpus[1], events::GEV_NMI);
        sync_nap(&hv);
        assert!(!hv.rcpm.is_napping(1));
    }

    #[test]
    fn test_get_core_state_hypercall() {
        let (_hv, guest) = four_core_guest();
        enter_nap(&guest, 2);

        let mut regs = TrapFrame::default();
        regs.gpregs[4] = 0; // self handle
        regs.gpregs[5] = 2;
        hcall_get_core_state(&guest, &mut regs);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(regs.gpregs[4] as u32, FH_VCPU_NAP);
    }
}
