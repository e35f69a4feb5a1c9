//! Virtual interrupt controller.
//!
//! Each guest has a vpic holding an array of virtual interrupt sources;
//! the index into the array is the vint number, allocated by
//! `alloc_irq`. The vpic routines are invoked by the `int_*` hypercalls
//! through the vmpic layer.
//!
//! Asserting a virtual interrupt puts it in the pending state and sends
//! a guest doorbell to the destination vCPU; the doorbell handler
//! reflects it through the guest's external-interrupt vector. Only one
//! virtual interrupt per vCPU is active at a time; it stays active
//! until EOI. The pending bit is sticky while the source is masked.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::events::{self, EV_ASSERT_VINT};
use crate::guest::gcpu::{Gcpu, GCPU_PEND_VIRQ};
use crate::guest::Guest;
use crate::log::{LogLevel, LogType};
use crate::printlog;

pub const MAX_VINT_CNT: usize = 64;

/// Per-vCPU pending/active bitmaps (one bit per vint).
pub struct VpicCpu {
    pub pending: AtomicU64,
    pub active: AtomicU64,
}

impl VpicCpu {
    pub fn new() -> Self {
        VpicCpu { pending: AtomicU64::new(0), active: AtomicU64::new(0) }
    }

    pub fn reset(&self) {
        self.pending.store(0, Ordering::Relaxed);
        self.active.store(0, Ordering::Relaxed);
    }
}

impl Default for VpicCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// One virtual interrupt source.
#[derive(Debug, Clone, Copy)]
pub struct VirqState {
    pub destcpu: u32,
    pub enable: bool,
    pub pending: bool,
    pub active: bool,
    pub config: u32,
    /// Hook run on EOI (error sub-interrupt cascades re-arm here).
    pub eoi_hook: Option<fn(usize)>,
}

impl VirqState {
    const fn unused() -> Self {
        VirqState {
            destcpu: 1,
            enable: false,
            pending: false,
            active: false,
            config: 0,
            eoi_hook: None,
        }
    }
}

struct VpicState {
    ints: [VirqState; MAX_VINT_CNT],
    alloc_next: usize,
}

/// Per-guest vpic: the source array and its lock.
pub struct Vpic {
    state: Mutex<VpicState>,
}

impl Vpic {
    pub fn new() -> Self {
        Vpic {
            state: Mutex::new(VpicState {
                ints: [VirqState::unused(); MAX_VINT_CNT],
                alloc_next: 0,
            }),
        }
    }

    /// Number of sources allocated so far.
    pub fn count(&self) -> usize {
        self.state.lock().alloc_next
    }

    pub fn irq_state(&self, irq: usize) -> VirqState {
        self.state.lock().ints[irq]
    }

    /// Re-zero all sources. Allocation order is deterministic, so vint
    /// numbers are stable across a partition restart.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.ints = [VirqState::unused(); MAX_VINT_CNT];
        s.alloc_next = 0;
    }
}

impl Default for Vpic {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate the next vint for `guest`; disabled, destined to vCPU 0.
pub fn alloc_irq(guest: &Guest, config: u32) -> Option<usize> {
    let mut s = guest.vpic.state.lock();
    if s.alloc_next >= MAX_VINT_CNT {
        return None;
    }
    let irq = s.alloc_next;
    s.alloc_next += 1;
    s.ints[irq] = VirqState { config, ..VirqState::unused() };
    Some(irq)
}

fn send_vint(gcpu: &Gcpu) {
    printlog!(LogType::Irq, LogLevel::Verbose, "sending vint to core {}", gcpu.coreid);
    gcpu.gdbell_pending.fetch_or(GCPU_PEND_VIRQ, Ordering::AcqRel);
    events::setevent(gcpu, EV_ASSERT_VINT);
}

fn assert_locked(guest: &Guest, s: &mut VpicState, irq: usize) {
    let destcpu = s.ints[irq].destcpu;
    debug_assert!(destcpu != 0);
    let dest = destcpu.trailing_zeros() as usize;
    debug_assert!(dest < guest.gcpus.len());

    let gcpu = &guest.gcpus[dest];
    s.ints[irq].pending = true;

    if gcpu.vpic.pending.load(Ordering::Acquire) & (1 << irq) == 0 {
        if s.ints[irq].enable {
            gcpu.vpic.pending.fetch_or(1 << irq, Ordering::AcqRel);
            send_vint(gcpu);
        } else {
            printlog!(LogType::Irq, LogLevel::Verbose, "vpic irq {} disabled", irq);
        }
    } else {
        printlog!(LogType::Irq, LogLevel::Verbose, "vpic irq {} already pending in cpu", irq);
    }
}

/// Assert a virtual interrupt.
pub fn assert_vint(guest: &Guest, irq: usize) {
    let mut s = guest.vpic.state.lock();

    #[cfg(feature = "irq-trace")]
    printlog!(LogType::Irq, LogLevel::Verbose, "assert virq {}", irq);

    if !s.ints[irq].pending {
        assert_locked(guest, &mut s, irq);
    }
}

/// Drop the pending state of a virtual interrupt.
pub fn deassert_vint(guest: &Guest, irq: usize) {
    let mut s = guest.vpic.state.lock();
    s.ints[irq].pending = false;
}

/// Interrupt acknowledge for the current vCPU: returns the vint that
/// moves to the active state, if any.
pub fn iack(guest: &Guest, gcpu: &Gcpu) -> Option<usize> {
    let mut s = guest.vpic.state.lock();
    gcpu.gdbell_pending.fetch_and(!GCPU_PEND_VIRQ, Ordering::AcqRel);

    let active = gcpu.vpic.active.load(Ordering::Acquire);
    if active != 0 {
        return Some(active.trailing_zeros() as usize);
    }

    loop {
        let pending = gcpu.vpic.pending.load(Ordering::Acquire);
        if pending == 0 {
            return None;
        }
        let irq = pending.trailing_zeros() as usize;

        if !s.ints[irq].pending || !s.ints[irq].enable {
            // de-asserted or masked since it was posted
            gcpu.vpic.pending.fetch_and(!(1 << irq), Ordering::AcqRel);
            continue;
        }

        if s.ints[irq].destcpu & (1 << gcpu.gcpu_num) != 0 {
            gcpu.vpic.active.fetch_or(1 << irq, Ordering::AcqRel);
            s.ints[irq].active = true;

            if s.ints[irq].config & super::mpic::IRQ_LEVEL == 0 {
                gcpu.vpic.pending.fetch_and(!(1 << irq), Ordering::AcqRel);
                s.ints[irq].pending = false;
            }

            return Some(irq);
        }

        // The destination mask changed while the interrupt was pending.
        // Reissue toward the new destination; edge interrupts may be
        // delivered more than once in this window.
        printlog!(LogType::Irq, LogLevel::Normal, "vpic iack: destcpu changed while pending");
        gcpu.vpic.pending.fetch_and(!(1 << irq), Ordering::AcqRel);
        if s.ints[irq].pending {
            s.ints[irq].pending = false;
            assert_locked(guest, &mut s, irq);
        }
    }
}

/// End of interrupt: clears active and redelivers if more are pending.
pub fn eoi(guest: &Guest, gcpu: &Gcpu, irq: usize) {
    let hook;
    {
        let mut s = guest.vpic.state.lock();
        gcpu.vpic.active.fetch_and(!(1 << irq), Ordering::AcqRel);
        s.ints[irq].active = false;
        hook = s.ints[irq].eoi_hook;

        if gcpu.vpic.active.load(Ordering::Acquire) == 0
            && gcpu.vpic.pending.load(Ordering::Acquire) != 0
        {
            send_vint(gcpu);
        }
    }

    if let Some(hook) = hook {
        hook(irq);
    }
}

pub fn mask(guest: &Guest, irq: usize) {
    let mut s = guest.vpic.state.lock();
    s.ints[irq].enable = false;
}

/// Unmask; a sticky pending source delivers immediately.
pub fn unmask(guest: &Guest, irq: usize) {
    let mut s = guest.vpic.state.lock();
    s.ints[irq].enable = true;

    if s.ints[irq].pending {
        s.ints[irq].pending = false;
        assert_locked(guest, &mut s, irq);
    }
}

pub fn is_disabled(guest: &Guest, irq: usize) -> bool {
    !guest.vpic.state.lock().ints[irq].enable
}

/// Drop any pending/active state left from a previous partition run.
pub fn clear_irq_state(guest: &Guest, irq: usize) {
    let mut s = guest.vpic.state.lock();
    s.ints[irq].pending = false;
    s.ints[irq].active = false;
}

pub fn set_destcpu(guest: &Guest, irq: usize, destcpu: u32) {
    debug_assert!(destcpu != 0 && destcpu & ((1 << guest.gcpus.len()) - 1) != 0);
    let mut s = guest.vpic.state.lock();
    s.ints[irq].destcpu = destcpu;
}

pub fn get_destcpu(guest: &Guest, irq: usize) -> u32 {
    guest.vpic.state.lock().ints[irq].destcpu
}

pub fn is_active(guest: &Guest, irq: usize) -> bool {
    let s = guest.vpic.state.lock();
    s.ints[irq].pending || s.ints[irq].active
}

pub fn get_config(guest: &Guest, irq: usize) -> u32 {
    guest.vpic.state.lock().ints[irq].config
}

pub fn set_config(guest: &Guest, irq: usize, config: u32) {
    guest.vpic.state.lock().ints[irq].config = config;
}

pub fn set_eoi_hook(guest: &Guest, irq: usize, hook: fn(usize)) {
    guest.vpic.state.lock().ints[irq].eoi_hook = Some(hook);
}
