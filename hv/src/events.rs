//! Cross-core and return-to-guest events.
//!
//! Two small bitmaps per vCPU carry all asynchronous work. Hypervisor
//! events (`EV_*`) are posted with `setevent` and drained by the
//! doorbell handler at any trap boundary. Guest events (`GEV_*`) are
//! posted with `setgevent` and drained on return to guest, without
//! regard for the guest's MSR interrupt-enable bits.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::guest::gcpu::Gcpu;
use crate::guest::{self, Guest};
use crate::log::{LogLevel, LogType};
use crate::printlog;

// Hypervisor events, drained by the doorbell handler.
pub const EV_ASSERT_VINT: u32 = 0;
pub const EV_TLBIVAX: u32 = 1;
pub const EV_RESCHED: u32 = 2;
pub const EV_MCP: u32 = 3;
pub const EV_GUEST_CRIT_INT: u32 = 4;
pub const EV_DUMP_HV_QUEUE: u32 = 5;
pub const EV_DELIVER_PEND_VINT: u32 = 6;
/// Must run on the boot core.
pub const EV_SYNC_NAP: u32 = 7;

// Guest events, drained on return to guest.
pub const GEV_STOP: u32 = 0;
pub const GEV_START: u32 = 1;
pub const GEV_RESTART: u32 = 2;
pub const GEV_LOAD: u32 = 3;
pub const GEV_START_LOAD: u32 = 4;
pub const GEV_PAUSE: u32 = 5;
pub const GEV_RESUME: u32 = 6;
pub const GEV_NMI: u32 = 7;

/// Virtual interrupts queued from contexts that cannot take the vpic
/// lock (error interrupt cascades); drained by EV_DELIVER_PEND_VINT.
static PEND_VINT: Mutex<Vec<(Weak<Guest>, usize)>> = Mutex::new(Vec::new());

pub fn queue_pend_vint(guest: &Arc<Guest>, irq: usize) {
    PEND_VINT.lock().push((Arc::downgrade(guest), irq));
}

/// Post a hypervisor event; pairs a full barrier with the doorbell so
/// the receiver observes the event-bit store.
pub fn setevent(gcpu: &Gcpu, event: u32) {
    gcpu.dbell_pending.fetch_or(1 << event, Ordering::SeqCst);
    send_doorbell(gcpu);
}

/// Post a guest event and arm the target core's return hook. The
/// ordering here matters: a napping core that sees only one of the two
/// stores must still do the right thing, so the event bit is globally
/// visible before the hook.
pub fn setgevent(gcpu: &Gcpu, event: u32) {
    gcpu.gevent_pending.fetch_or(1 << event, Ordering::SeqCst);

    #[cfg(feature = "event-trace")]
    printlog!(LogType::Misc, LogLevel::Verbose,
              "setgevent {} -> core {}", event, gcpu.coreid);

    if let Some(guest) = gcpu.guest.upgrade() {
        if let Some(hv) = guest.hv.upgrade() {
            hv.core(gcpu.coreid).ret_hook.store(true, Ordering::SeqCst);
            send_doorbell(gcpu);

            if gcpu.napping.load(Ordering::Acquire) {
                hv.sync_nap_pending.store(true, Ordering::Release);
            }
        }
    }
}

fn send_doorbell(gcpu: &Gcpu) {
    if let Some(guest) = gcpu.guest.upgrade() {
        if let Some(hv) = guest.hv.upgrade() {
            hv.core(gcpu.coreid).dbell_raised.store(true, Ordering::Release);
        }
    }
}

/// Raise the machine-check-class guest doorbell (EV_MCP target).
pub fn raise_mchk_doorbell(gcpu: &Gcpu) {
    setevent(gcpu, EV_MCP);
}

/// The hardware doorbell handler: drain every pending hypervisor event
/// on this vCPU.
pub fn doorbell_int(gcpu: &Arc<Gcpu>) {
    loop {
        let pending = gcpu.dbell_pending.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }
        let bit = pending.trailing_zeros();
        gcpu.dbell_pending.fetch_and(!(1 << bit), Ordering::AcqRel);

        match bit {
            EV_ASSERT_VINT => gcpu.gdbell_line.store(true, Ordering::Release),
            EV_TLBIVAX => tlbivax_ipi(gcpu),
            EV_RESCHED => {}
            EV_MCP => gcpu.mchk_gdbell_line.store(true, Ordering::Release),
            EV_GUEST_CRIT_INT => gcpu.crit_gdbell_line.store(true, Ordering::Release),
            EV_DUMP_HV_QUEUE => {
                if let Some(hv) = gcpu.guest.upgrade().and_then(|g| g.hv.upgrade()) {
                    crate::error::dump_hv_queue(&hv);
                }
            }
            EV_DELIVER_PEND_VINT => deliver_pend_vint(),
            EV_SYNC_NAP => {
                if let Some(hv) = gcpu.guest.upgrade().and_then(|g| g.hv.upgrade()) {
                    crate::pm::sync_nap(&hv);
                }
            }
            _ => {
                printlog!(LogType::Misc, LogLevel::Error, "stray event bit {}", bit);
            }
        }
    }
}

fn deliver_pend_vint() {
    loop {
        let next = PEND_VINT.lock().pop();
        match next {
            Some((guest, irq)) => {
                if let Some(g) = guest.upgrade() {
                    printlog!(LogType::Misc, LogLevel::Error,
                              "error interrupt reflected, int={}, guest={}", irq, g.name);
                    crate::intr::vpic::assert_vint(&g, irq);
                }
            }
            None => return,
        }
    }
}

/// Broadcast TLB invalidation target for this guest, serviced locally.
fn tlbivax_ipi(gcpu: &Arc<Gcpu>) {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return,
    };

    let vaddr = guest.tlbivax_addr.load(Ordering::Acquire);
    {
        let mut tlb1 = gcpu.tlb1.lock();
        let mut hw = gcpu.hw_tlb1.lock();
        tlb1.invalidate_va(&mut hw, vaddr);
    }
    if let Some(hv) = guest.hv.upgrade() {
        let _sync = crate::tlb::TLBSYNC_LOCK.lock();
        hv.tlbcache.invalidate_lpid(guest.lpid);
    }

    guest.tlbivax_count.fetch_sub(1, Ordering::AcqRel);
}

/// Return-to-guest hook: drain guest events in bit order.
pub fn return_hook(gcpu: &Arc<Gcpu>) {
    if let Some(hv) = gcpu.guest.upgrade().and_then(|g| g.hv.upgrade()) {
        hv.core(gcpu.coreid).ret_hook.store(false, Ordering::SeqCst);
    }

    loop {
        let pending = gcpu.gevent_pending.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }
        let bit = pending.trailing_zeros();
        gcpu.gevent_pending.fetch_and(!(1 << bit), Ordering::AcqRel);

        match bit {
            GEV_STOP => guest::stop_core(gcpu),
            GEV_START => guest::start_core(gcpu, false),
            GEV_RESTART => guest::restart_core(gcpu),
            GEV_LOAD => {
                if let Some(g) = gcpu.guest.upgrade() {
                    if let Err(e) = crate::guest::loader::load_images(&g) {
                        printlog!(LogType::Partition, LogLevel::Error,
                                  "guest {}: load failed: {:?}", g.name, e);
                    }
                }
            }
            GEV_START_LOAD => guest::start_core(gcpu, true),
            GEV_PAUSE => guest::pause_core(gcpu),
            GEV_RESUME => guest::resume_core(gcpu),
            GEV_NMI => guest::deliver_nmi(gcpu),
            _ => {
                printlog!(LogType::Misc, LogLevel::Error, "stray gevent bit {}", bit);
            }
        }
    }
}

/// Drive every vCPU's pending guest events to completion. On silicon
/// each core drains its own word when the return hook fires; the
/// broadcast paths use this while waiting for the partition to settle.
pub fn drain_guest_gevents(guest: &Arc<Guest>) {
    loop {
        let mut any = false;
        for gcpu in &guest.gcpus {
            if gcpu.gevent_pending.load(Ordering::Acquire) != 0 {
                any = true;
                return_hook(gcpu);
            }
        }
        if !any {
            return;
        }
    }
}

/// Any wake-worthy work pending for this vCPU? Checked by the nap path
/// before committing to low power.
pub fn wake_pending(gcpu: &Gcpu) -> bool {
    gcpu.gevent_pending.load(Ordering::Acquire) != 0
        || gcpu.dbell_pending.load(Ordering::Acquire) != 0
        || gcpu.gdbell_pending.load(Ordering::Acquire) != 0
        || gcpu.mcsr.load(Ordering::Acquire) != 0
        || !gcpu.guest.upgrade().map_or(true, |g| g.error_queue.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setevent_accumulates_bits() {
        let guest = Guest::new_bare("ev", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        setevent(gcpu, EV_ASSERT_VINT);
        setevent(gcpu, EV_MCP);
        assert_eq!(gcpu.dbell_pending.load(Ordering::Relaxed), 0b1001);
    }

    #[test]
    fn test_doorbell_int_drains_and_raises_lines() {
        let guest = Guest::new_bare("ev", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        setevent(gcpu, EV_ASSERT_VINT);
        setevent(gcpu, EV_GUEST_CRIT_INT);
        setevent(gcpu, EV_MCP);

        doorbell_int(gcpu);
        assert_eq!(gcpu.dbell_pending.load(Ordering::Relaxed), 0);
        assert!(gcpu.gdbell_line.load(Ordering::Relaxed));
        assert!(gcpu.crit_gdbell_line.load(Ordering::Relaxed));
        assert!(gcpu.mchk_gdbell_line.load(Ordering::Relaxed));
    }

    #[test]
    fn test_tlbivax_event_invalidates() {
        use crate::arch::{PteAttr, MAS1_TSIZE_SHIFT, MAS1_VALID, MAS3_SR, TLB_TSIZE_4K};

        let guest = Guest::new_bare("ev-tlb", 1, &[0]);
        let gcpu = &guest.gcpus[0];

        {
            let mut gphys = guest.gphys.lock();
            gphys.map(0, 0x100, 4, PteAttr::VALID | PteAttr::SR);
        }
        {
            let gphys = guest.gphys.lock();
            let mut tlb1 = gcpu.tlb1.lock();
            let mut hw = gcpu.hw_tlb1.lock();
            tlb1.set_entry(
                &mut hw,
                0,
                MAS1_VALID | (TLB_TSIZE_4K << MAS1_TSIZE_SHIFT),
                2,
                2,
                0,
                MAS3_SR,
                &gphys,
                1,
            )
            .unwrap();
        }

        guest.tlbivax_addr.store(2 << 12, Ordering::Relaxed);
        guest.tlbivax_count.store(1, Ordering::Relaxed);
        setevent(gcpu, EV_TLBIVAX);
        doorbell_int(gcpu);

        assert_eq!(guest.tlbivax_count.load(Ordering::Relaxed), 0);
        assert!(!gcpu.tlb1.lock().gtlb1[0].is_valid());
    }

    #[test]
    fn test_gevent_nmi_sets_mcsr() {
        let guest = Guest::new_bare("ev-nmi", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        setgevent(gcpu, GEV_NMI);
        return_hook(gcpu);

        assert_ne!(gcpu.mcsr.load(Ordering::Relaxed) & crate::arch::MCSR_NMI, 0);
        // the machine-check doorbell event was posted
        assert_ne!(gcpu.dbell_pending.load(Ordering::Relaxed) & (1 << EV_MCP), 0);
    }

    #[test]
    fn test_pend_vint_queue() {
        let guest = Guest::new_bare("ev-pv", 1, &[0]);
        let irq = crate::intr::vpic::alloc_irq(&guest, 0).unwrap();
        crate::intr::vpic::unmask(&guest, irq);

        queue_pend_vint(&guest, irq);
        setevent(&guest.gcpus[0], EV_DELIVER_PEND_VINT);
        doorbell_int(&guest.gcpus[0]);

        assert_ne!(guest.gcpus[0].vpic.pending.load(Ordering::Relaxed), 0);
    }
}
