//! Timer virtualization: decrementer, fixed-interval timer, and the
//! per-vCPU watchdog emulation.
//!
//! Hardware timers run at whatever rate the hypervisor needs; the guest
//! only sees an edge when the bit selected by its own TCR period would
//! transition 0→1 in the timebase. Status bits accumulate in the
//! guest's TSR shadow and are reflected from the guest doorbell
//! handler, mimicking level-triggered hardware.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;

use crate::arch::{
    tcr_fit_bit, tcr_wd_bit, TCR_DIE, TCR_FIE, TCR_WIE, TCR_WRC_MASK, TSR_DIS, TSR_ENW,
    TSR_FIS, TSR_WIS,
};
use crate::guest::gcpu::{Gcpu, GcpuStat, GCPU_PEND_WATCHDOG};
use crate::guest::{self, WdAction};
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// The timebase. On silicon this is SPR TBL/TBU; platform code (and
/// tests) advance this rendering explicitly.
static TIMEBASE: AtomicU64 = AtomicU64::new(0);
static TIMEBASE_FREQ: AtomicU64 = AtomicU64::new(400_000_000);

pub fn timebase_now() -> u64 {
    TIMEBASE.load(Ordering::Relaxed)
}

pub fn timebase_advance(ticks: u64) -> u64 {
    TIMEBASE.fetch_add(ticks, Ordering::Relaxed) + ticks
}

pub fn timebase_freq() -> u64 {
    TIMEBASE_FREQ.load(Ordering::Relaxed)
}

pub fn set_timebase_freq(freq: u64) {
    TIMEBASE_FREQ.store(freq, Ordering::Relaxed);
}

/// Has the bit selected by `period_bit` (0 = MSB of the 64-bit
/// timebase) transitioned 0→1 between two timebase values?
fn period_edge(prev: u64, now: u64, period_bit: u32) -> bool {
    let mask = 1u64 << (63 - period_bit);
    (prev & mask) == 0 && (now & mask) != 0
}

/// Decrementer fired on this core. The guest keeps receiving reflected
/// decrementer interrupts from the doorbell handler until it clears its
/// own TSR[DIS].
pub fn decrementer(gcpu: &Gcpu) {
    gcpu.inc_stat(GcpuStat::Decr);
    gcpu.gtsr.fetch_or(TSR_DIS, Ordering::AcqRel);
    gcpu.gdbell_line.store(true, Ordering::Release);
}

/// Hardware FIT tick: reflect to the guest only on its own period edge.
pub fn fit(gcpu: &Gcpu, prev_tb: u64, now_tb: u64) {
    let tcr = gcpu.gtcr.load(Ordering::Acquire);
    if period_edge(prev_tb, now_tb, tcr_fit_bit(tcr)) {
        gcpu.gtsr.fetch_or(TSR_FIS, Ordering::AcqRel);
        if tcr & TCR_FIE != 0 {
            gcpu.gdbell_line.store(true, Ordering::Release);
        }
    }
}

/// What a watchdog period expiry did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogFire {
    /// First stage: ENW armed.
    Armed,
    /// Second stage: interrupt reflected (WIS set).
    Interrupt,
    /// Final stage: the configured action ran.
    FinalTimeout,
}

/// The guest's watchdog period elapsed on this vCPU. Implements the
/// three-stage Book-E watchdog state machine over the TSR shadow.
pub fn watchdog_expired(gcpu: &Arc<Gcpu>) -> WatchdogFire {
    let tsr = gcpu.gtsr.load(Ordering::Acquire);

    if tsr & TSR_ENW == 0 {
        gcpu.gtsr.fetch_or(TSR_ENW, Ordering::AcqRel);
        return WatchdogFire::Armed;
    }

    if tsr & TSR_WIS == 0 {
        gcpu.gtsr.fetch_or(TSR_WIS, Ordering::AcqRel);
        let tcr = gcpu.gtcr.load(Ordering::Acquire);
        if tcr & TCR_WIE != 0 {
            gcpu.gdbell_pending.fetch_or(GCPU_PEND_WATCHDOG, Ordering::AcqRel);
            gcpu.crit_gdbell_line.store(true, Ordering::Release);
        }
        return WatchdogFire::Interrupt;
    }

    watchdog_timeout(gcpu);
    WatchdogFire::FinalTimeout
}

/// Final watchdog timeout: act per the partition configuration. A zero
/// TCR[WRC] means the guest asked for no reset action.
fn watchdog_timeout(gcpu: &Arc<Gcpu>) {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return,
    };

    if gcpu.gtcr.load(Ordering::Acquire) & TCR_WRC_MASK == 0 {
        return;
    }

    let who = match gcpu.gcpu_num {
        0 => "vcpu-0",
        1 => "vcpu-1",
        2 => "vcpu-2",
        3 => "vcpu-3",
        4 => "vcpu-4",
        5 => "vcpu-5",
        6 => "vcpu-6",
        _ => "vcpu-n",
    };

    match guest.wd_action {
        WdAction::Notify => {
            printlog!(LogType::Partition, LogLevel::Normal, "watchdog: notifying manager");
            let dbell = guest.dbell_watchdog_expiration.lock().clone();
            if let Some(db) = dbell {
                crate::ipc::doorbell::send_doorbells(&db);
            }
        }
        WdAction::Stop => {
            printlog!(LogType::Partition, LogLevel::Normal, "watchdog: stopping partition");
            let _ = guest::stop_guest(&guest, "watchdog", who);
        }
        WdAction::Reset => {
            printlog!(LogType::Partition, LogLevel::Normal, "watchdog: restarting partition");
            let wrc = gcpu.gtcr.load(Ordering::Acquire) & TCR_WRC_MASK;
            gcpu.watchdog_tsr.store(wrc, Ordering::Release);
            let _ = guest::restart_guest(&guest, "watchdog", who);
        }
    }
}

/// Drive the watchdog from the timebase: fire when the guest's
/// watchdog period bit transitions.
pub fn watchdog_tick(gcpu: &Arc<Gcpu>, prev_tb: u64, now_tb: u64) -> Option<WatchdogFire> {
    let tcr = gcpu.gtcr.load(Ordering::Acquire);
    if tcr & (TCR_WIE | TCR_WRC_MASK) == 0 {
        return None;
    }
    if period_edge(prev_tb, now_tb, tcr_wd_bit(tcr)) {
        Some(watchdog_expired(gcpu))
    } else {
        None
    }
}

// ── TCR/TSR emulation ───────────────────────────────────────────────

/// Guest mtspr TCR. Once written, TCR[WRC] can only be cleared by a
/// reset, matching hardware.
pub fn set_tcr(gcpu: &Gcpu, val: u32) {
    let old = gcpu.gtcr.load(Ordering::Acquire);
    let sticky_wrc = old & TCR_WRC_MASK;
    let val = if sticky_wrc != 0 { (val & !TCR_WRC_MASK) | sticky_wrc } else { val };
    gcpu.gtcr.store(val, Ordering::Release);

    // Enabling DIE/FIE with a status bit already set re-arms delivery.
    let tsr = gcpu.gtsr.load(Ordering::Acquire);
    if (val & TCR_DIE != 0 && tsr & TSR_DIS != 0) || (val & TCR_FIE != 0 && tsr & TSR_FIS != 0) {
        gcpu.gdbell_line.store(true, Ordering::Release);
    }
}

/// Guest mtspr TSR: write-one-to-clear.
pub fn set_tsr(gcpu: &Gcpu, val: u32) {
    let mut old = gcpu.gtsr.load(Ordering::Acquire);
    loop {
        match gcpu.gtsr.compare_exchange(old, old & !val, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(cur) => old = cur,
        }
    }
}

pub fn get_tcr(gcpu: &Gcpu) -> u32 {
    gcpu.gtcr.load(Ordering::Acquire)
}

pub fn get_tsr(gcpu: &Gcpu) -> u32 {
    gcpu.gtsr.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{TCR_WRC_SHIFT, TSR_WRS_MASK};
    use crate::guest::{Guest, GuestState};

    #[test]
    fn test_period_edge() {
        // bit 63 (LSB-most period): toggles every tick
        assert!(period_edge(0, 1, 63));
        assert!(!period_edge(1, 2, 63));
        // 2^46 period: spec's watchdog scale
        let p = 63 - 46;
        assert!(period_edge(0, 1 << 46, p as u32));
        assert!(!period_edge(1 << 46, (1 << 46) + 1, p as u32));
    }

    #[test]
    fn test_decrementer_sets_dis() {
        let guest = Guest::new_bare("t", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        decrementer(gcpu);
        assert_ne!(get_tsr(gcpu) & TSR_DIS, 0);
        assert!(gcpu.gdbell_line.load(Ordering::Relaxed));
        assert_eq!(gcpu.stat(GcpuStat::Decr), 1);
    }

    #[test]
    fn test_tsr_write_one_to_clear() {
        let guest = Guest::new_bare("t", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        decrementer(gcpu);
        set_tsr(gcpu, TSR_DIS);
        assert_eq!(get_tsr(gcpu) & TSR_DIS, 0);
    }

    #[test]
    fn test_fit_only_on_period_edge() {
        let guest = Guest::new_bare("t", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        // FP bits select a fast period; FIE enabled
        set_tcr(gcpu, TCR_FIE | (3 << crate::arch::TCR_FP_SHIFT));
        let bit = crate::arch::tcr_fit_bit(get_tcr(gcpu));
        let mask = 1u64 << (63 - bit);

        fit(gcpu, 0, 1);
        assert_eq!(get_tsr(gcpu) & TSR_FIS, 0);
        fit(gcpu, 0, mask);
        assert_ne!(get_tsr(gcpu) & TSR_FIS, 0);
    }

    #[test]
    fn test_watchdog_three_stages() {
        let guest = Guest::new_bare("t", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        set_tcr(gcpu, TCR_WIE | (1 << TCR_WRC_SHIFT));

        assert_eq!(watchdog_expired(gcpu), WatchdogFire::Armed);
        assert_ne!(get_tsr(gcpu) & TSR_ENW, 0);

        assert_eq!(watchdog_expired(gcpu), WatchdogFire::Interrupt);
        assert_ne!(get_tsr(gcpu) & TSR_WIS, 0);
        assert_ne!(
            gcpu.gdbell_pending.load(Ordering::Relaxed) & GCPU_PEND_WATCHDOG,
            0
        );

        assert_eq!(watchdog_expired(gcpu), WatchdogFire::FinalTimeout);
    }

    #[test]
    fn test_watchdog_stop_action() {
        let g = Guest::new(
            alloc::sync::Weak::new(),
            "wd-stop",
            1,
            None,
            &[0],
            WdAction::Stop,
            false,
        );
        guest::start_guest(&g, false).unwrap();
        let gcpu = &g.gcpus[0];
        set_tcr(gcpu, 1 << TCR_WRC_SHIFT);

        watchdog_expired(gcpu);
        watchdog_expired(gcpu);
        watchdog_expired(gcpu);

        assert_eq!(g.state(), GuestState::Stopped);
        assert_eq!(g.hypervisor_strprop("fsl,hv-reason-stopped").as_deref(), Some("watchdog"));
        assert_eq!(g.hypervisor_strprop("fsl,hv-stopped-by").as_deref(), Some("vcpu-0"));
    }

    #[test]
    fn test_watchdog_reset_action_restores_wrs() {
        let g = Guest::new(
            alloc::sync::Weak::new(),
            "wd-reset",
            1,
            None,
            &[0],
            WdAction::Reset,
            false,
        );
        guest::start_guest(&g, false).unwrap();
        let gcpu = &g.gcpus[0];
        set_tcr(gcpu, 2 << TCR_WRC_SHIFT);

        watchdog_expired(gcpu);
        watchdog_expired(gcpu);
        watchdog_expired(gcpu);

        // restarted, with the reset cause visible in TSR[WRS]
        assert_eq!(g.state(), GuestState::Running);
        assert_eq!(get_tsr(gcpu) & TSR_WRS_MASK, 2 << TCR_WRC_SHIFT);
    }

    #[test]
    fn test_wrc_sticky_until_reset() {
        let guest = Guest::new_bare("t", 1, &[0]);
        let gcpu = &guest.gcpus[0];
        set_tcr(gcpu, 3 << TCR_WRC_SHIFT);
        set_tcr(gcpu, 0);
        assert_eq!(get_tcr(gcpu) & TCR_WRC_MASK, 3 << TCR_WRC_SHIFT);
    }
}
