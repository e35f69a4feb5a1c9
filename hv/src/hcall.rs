//! Hypercall ABI.
//!
//! Guests trap in with the call number in GPR3 and arguments in
//! GPR4..GPR11; the status lands back in GPR3 with results in the
//! following registers. Dispatch is table-driven: unknown numbers
//! return UNIMPLEMENTED, and a partition that has been stopped gets
//! nothing until its next start.

use alloc::sync::Arc;

use crate::arch::TrapFrame;
use crate::errors::{Error, EV_SUCCESS};
use crate::events::{self, GEV_NMI};
use crate::guest::gcpu::Gcpu;
use crate::guest::{self, Guest, GuestState};
use crate::hv::{self, handle_to_guest};
use crate::intr::vmpic;
use crate::ipc::{byte_chan, doorbell};
use crate::log::{LogLevel, LogType};
use crate::pm;
use crate::printlog;

pub const HC_PARTITION_GET_STATUS: u64 = 1;
pub const HC_PARTITION_START: u64 = 2;
pub const HC_PARTITION_STOP: u64 = 3;
pub const HC_PARTITION_RESTART: u64 = 4;
pub const HC_PARTITION_SEND_DBELL: u64 = 5;
pub const HC_PARTITION_GET_CORE_STATE: u64 = 6;
pub const HC_PARTITION_ENTER_NAP: u64 = 7;
pub const HC_PARTITION_EXIT_NAP: u64 = 8;
pub const HC_PARTITION_STOP_DMA: u64 = 9;
pub const HC_BYTE_CHANNEL_SEND: u64 = 10;
pub const HC_BYTE_CHANNEL_RECEIVE: u64 = 11;
pub const HC_BYTE_CHANNEL_POLL: u64 = 12;
pub const HC_INT_SET_CONFIG: u64 = 13;
pub const HC_INT_GET_CONFIG: u64 = 14;
pub const HC_INT_SET_MASK: u64 = 15;
pub const HC_INT_GET_MASK: u64 = 16;
pub const HC_INT_EOI: u64 = 17;
pub const HC_INT_IACK: u64 = 18;
pub const HC_INT_GET_ACTIVITY: u64 = 19;
pub const HC_VMPIC_GET_MSIR: u64 = 20;
pub const HC_DMA_ENABLE: u64 = 21;
pub const HC_DMA_DISABLE: u64 = 22;
pub const HC_ERR_GET_INFO: u64 = 23;
pub const HC_CLAIM_DEVICE: u64 = 24;
pub const HC_SEND_NMI: u64 = 25;
pub const HC_CPU_WHOAMI: u64 = 26;

type HcallFn = fn(&Arc<Gcpu>, &Arc<Guest>, &mut TrapFrame);

const HCALL_COUNT: usize = 27;

/// The dispatch table; index is the hypercall number.
static HCALL_TABLE: [Option<HcallFn>; HCALL_COUNT] = [
    None,
    Some(hc_partition_get_status),
    Some(hc_partition_start),
    Some(hc_partition_stop),
    Some(hc_partition_restart),
    Some(hc_partition_send_dbell),
    Some(hc_partition_get_core_state),
    Some(hc_partition_enter_nap),
    Some(hc_partition_exit_nap),
    Some(hc_partition_stop_dma),
    Some(hc_byte_channel_send),
    Some(hc_byte_channel_receive),
    Some(hc_byte_channel_poll),
    Some(hc_int_set_config),
    Some(hc_int_get_config),
    Some(hc_int_set_mask),
    Some(hc_int_get_mask),
    Some(hc_int_eoi),
    Some(hc_int_iack),
    Some(hc_int_get_activity),
    Some(hc_vmpic_get_msir),
    Some(hc_dma_enable),
    Some(hc_dma_disable),
    Some(hc_err_get_info),
    Some(hc_claim_device),
    Some(hc_send_nmi),
    Some(hc_cpu_whoami),
];

/// Entry from the trap path: GPR3 selects the handler.
pub fn dispatch(gcpu: &Arc<Gcpu>, regs: &mut TrapFrame) {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return regs.set_status(Error::NoDev.status()),
    };

    // A stopped partition gets no service until its next start.
    if guest.state() == GuestState::Stopped {
        return regs.set_status(Error::InvalidState.status());
    }

    let num = regs.gpregs[3];
    let handler = HCALL_TABLE
        .get(num as usize)
        .and_then(|h| h.as_ref());

    match handler {
        Some(handler) => handler(gcpu, &guest, regs),
        None => {
            printlog!(LogType::Misc, LogLevel::Debug, "unimplemented hypercall {}", num);
            regs.set_status(Error::Unimplemented.status());
        }
    }
}

// ── partition calls ─────────────────────────────────────────────────

fn hc_partition_get_status(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let target = match handle_to_guest(guest, regs.gpregs[4]) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    regs.gpregs[4] = target.state() as u64;
    regs.gpregs[5] = target.gcpus.len() as u64;
    regs.set_status(EV_SUCCESS);
}

fn hc_partition_start(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let target = match handle_to_guest(guest, regs.gpregs[4]) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    // entry point override from the manager, if given
    let entry = regs.gpregs[5];
    if entry != 0 {
        target.entry.store(entry, core::sync::atomic::Ordering::Release);
    }
    let load = regs.gpregs[6] != 0;

    match guest::start_guest(&target, load) {
        Ok(()) => regs.set_status(EV_SUCCESS),
        Err(e) => regs.set_status(e.status()),
    }
}

fn hc_partition_stop(gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let target = match handle_to_guest(guest, regs.gpregs[4]) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    let who = if Arc::ptr_eq(&target, guest) { "self" } else { guest.name.as_str() };
    let _ = gcpu;
    match guest::stop_guest(&target, "stop hcall", who) {
        Ok(()) => regs.set_status(EV_SUCCESS),
        Err(e) => regs.set_status(e.status()),
    }
}

fn hc_partition_restart(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let target = match handle_to_guest(guest, regs.gpregs[4]) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    let who = if Arc::ptr_eq(&target, guest) { "self" } else { guest.name.as_str() };
    match guest::restart_guest(&target, "restart hcall", who) {
        Ok(()) => regs.set_status(EV_SUCCESS),
        Err(e) => regs.set_status(e.status()),
    }
}

fn hc_partition_send_dbell(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    doorbell::hcall_send_dbell(guest, regs);
}

fn hc_partition_get_core_state(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    pm::hcall_get_core_state(guest, regs);
}

fn hc_partition_enter_nap(gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    pm::hcall_enter_nap(guest, gcpu, regs);
}

fn hc_partition_exit_nap(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    pm::hcall_exit_nap(guest, regs);
}

/// Quiesce a stopped partition's DMA before its memory is reused:
/// invalidate every window its LIODN handles cover.
fn hc_partition_stop_dma(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let target = match handle_to_guest(guest, regs.gpregs[4]) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return regs.set_status(Error::NoDev.status()),
    };

    let handles = target.handles.lock();
    for (_, h) in handles.iter() {
        if let Some(p) = h.as_pamu() {
            p.enabled.store(false, core::sync::atomic::Ordering::Release);
            let _ = hv.pamu.set_valid(p.liodn, false);
        }
    }
    regs.set_status(EV_SUCCESS);
}

// ── byte channels ───────────────────────────────────────────────────

fn hc_byte_channel_send(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    byte_chan::hcall_send(guest, regs);
}

fn hc_byte_channel_receive(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    byte_chan::hcall_receive(guest, regs);
}

fn hc_byte_channel_poll(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    byte_chan::hcall_poll(guest, regs);
}

// ── interrupts ──────────────────────────────────────────────────────

fn hc_int_set_config(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_int_set_config(guest, regs);
}

fn hc_int_get_config(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_int_get_config(guest, regs);
}

fn hc_int_set_mask(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_int_set_mask(guest, regs);
}

fn hc_int_get_mask(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_int_get_mask(guest, regs);
}

fn hc_int_eoi(gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_int_eoi(guest, gcpu, regs);
}

fn hc_int_iack(gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return regs.set_status(Error::NoDev.status()),
    };
    vmpic::hcall_int_iack(guest, gcpu, &hv.mpic, regs);
}

fn hc_int_get_activity(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_int_get_activity(guest, regs);
}

fn hc_vmpic_get_msir(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    vmpic::hcall_vmpic_get_msir(guest, regs);
}

// ── DMA / errors / devices ──────────────────────────────────────────

fn hc_dma_enable(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    crate::drivers::pamu::hcall_dma_enable(guest, regs, true);
}

fn hc_dma_disable(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    crate::drivers::pamu::hcall_dma_enable(guest, regs, false);
}

fn hc_err_get_info(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    crate::error::hcall_err_get_info(guest, regs);
}

fn hc_claim_device(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let owner = {
        let handles = guest.handles.lock();
        match handles.get(regs.gpregs[4] as usize).and_then(|h| h.as_dev()) {
            Some(o) => o.clone(),
            None => return regs.set_status(Error::Invalid.status()),
        }
    };

    match hv::claim_device(&owner) {
        Ok(()) => regs.set_status(EV_SUCCESS),
        Err(e) => regs.set_status(e.status()),
    }
}

/// Deliver an NMI to the vCPUs of a managed partition.
fn hc_send_nmi(_gcpu: &Arc<Gcpu>, guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let target = match handle_to_guest(guest, regs.gpregs[4]) {
        Some(t) => t,
        None => return regs.set_status(Error::Invalid.status()),
    };

    let vcpu_mask = regs.gpregs[5] as u32;
    if vcpu_mask == 0 || vcpu_mask & !((1u32 << target.gcpus.len()) - 1) != 0 {
        return regs.set_status(Error::Invalid.status());
    }

    for gcpu in &target.gcpus {
        if vcpu_mask & (1 << gcpu.gcpu_num) != 0 {
            events::setgevent(gcpu, GEV_NMI);
        }
    }
    regs.set_status(EV_SUCCESS);
}

fn hc_cpu_whoami(gcpu: &Arc<Gcpu>, _guest: &Arc<Guest>, regs: &mut TrapFrame) {
    regs.gpregs[4] = gcpu.gcpu_num as u64;
    regs.set_status(EV_SUCCESS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::Hypervisor;

    fn call(gcpu: &Arc<Gcpu>, num: u64, args: &[(usize, u64)]) -> TrapFrame {
        let mut regs = TrapFrame::default();
        regs.gpregs[3] = num;
        for &(r, v) in args {
            regs.gpregs[r] = v;
        }
        dispatch(gcpu, &mut regs);
        regs
    }

    fn started_guest(hv: &Arc<Hypervisor>, name: &str, lpid: u32) -> Arc<Guest> {
        let g = Guest::new_bare_with_hv(hv, name, lpid, &[lpid as usize - 1]);
        guest::start_guest(&g, false).unwrap();
        g
    }

    #[test]
    fn test_whoami() {
        let hv = Hypervisor::new_bare();
        let g = started_guest(&hv, "hc", 1);
        let regs = call(&g.gcpus[0], HC_CPU_WHOAMI, &[]);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(regs.gpregs[4], 0);
    }

    #[test]
    fn test_unknown_hypercall() {
        let hv = Hypervisor::new_bare();
        let g = started_guest(&hv, "hc", 1);
        let regs = call(&g.gcpus[0], 999, &[]);
        assert_eq!(regs.gpregs[3] as u32, Error::Unimplemented.status());
    }

    #[test]
    fn test_get_status_of_self() {
        let hv = Hypervisor::new_bare();
        let g = started_guest(&hv, "hc", 1);
        let regs = call(&g.gcpus[0], HC_PARTITION_GET_STATUS, &[(4, 0)]);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(regs.gpregs[4], GuestState::Running as u64);
        assert_eq!(regs.gpregs[5], 1);
    }

    #[test]
    fn test_manager_stops_and_restarts_partition() {
        let hv = Hypervisor::new_bare();
        let manager = started_guest(&hv, "manager", 1);
        let target = started_guest(&hv, "target", 2);

        let th = manager
            .handles
            .lock()
            .alloc(crate::guest::handles::Handle::Partition(Arc::downgrade(&target)))
            .unwrap();

        let regs = call(&manager.gcpus[0], HC_PARTITION_STOP, &[(4, th as u64)]);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(target.state(), GuestState::Stopped);
        assert_eq!(target.hypervisor_strprop("fsl,hv-stopped-by").as_deref(), Some("manager"));

        let regs = call(&manager.gcpus[0], HC_PARTITION_GET_STATUS, &[(4, th as u64)]);
        assert_eq!(regs.gpregs[4], GuestState::Stopped as u64);

        let regs = call(&manager.gcpus[0], HC_PARTITION_START, &[(4, th as u64)]);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(target.state(), GuestState::Running);
    }

    #[test]
    fn test_stopped_partition_gets_no_service() {
        let hv = Hypervisor::new_bare();
        let g = started_guest(&hv, "hc", 1);
        guest::stop_guest(&g, "test", "test").unwrap();

        let regs = call(&g.gcpus[0], HC_CPU_WHOAMI, &[]);
        assert_eq!(regs.gpregs[3] as u32, Error::InvalidState.status());
    }

    #[test]
    fn test_send_nmi() {
        let hv = Hypervisor::new_bare();
        let manager = started_guest(&hv, "manager", 1);
        let target = Guest::new_bare_with_hv(&hv, "t", 2, &[1, 2]);
        guest::start_guest(&target, false).unwrap();

        let th = manager
            .handles
            .lock()
            .alloc(crate::guest::handles::Handle::Partition(Arc::downgrade(&target)))
            .unwrap();

        let regs = call(&manager.gcpus[0], HC_SEND_NMI, &[(4, th as u64), (5, 0b10)]);
        assert_eq!(regs.gpregs[3], 0);

        events::return_hook(&target.gcpus[1]);
        assert_ne!(
            target.gcpus[1].mcsr.load(core::sync::atomic::Ordering::Relaxed)
                & crate::arch::MCSR_NMI,
            0
        );
        assert_eq!(
            target.gcpus[0].mcsr.load(core::sync::atomic::Ordering::Relaxed),
            0
        );

        // an out-of-range mask is rejected
        let regs = call(&manager.gcpus[0], HC_SEND_NMI, &[(4, th as u64), (5, 0b100)]);
        assert_eq!(regs.gpregs[3] as u32, Error::Invalid.status());
    }

    #[test]
    fn test_bad_partition_handle() {
        let hv = Hypervisor::new_bare();
        let g = started_guest(&hv, "hc", 1);
        let regs = call(&g.gcpus[0], HC_PARTITION_GET_STATUS, &[(4, 500)]);
        assert_eq!(regs.gpregs[3] as u32, Error::Invalid.status());
    }
}
