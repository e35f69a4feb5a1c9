//! General Utilities (GUTS) block: reset control and reset status.
//!
//! The hypervisor owns the GUTS register window; guests that are
//! allowed a view get it through a virtualization-fault range so that
//! reset requests stay under hypervisor policy.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::TrapFrame;
use crate::guest::{Guest, VfRange};
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// RSTCR register offset within the GUTS window.
pub const GUTS_RSTCR: u64 = 0xb0;
/// RSTCR[RESET_REQ]
pub const RSTCR_RESET_REQ: u32 = 0x2;

/// Reset-request source recorded in RSTRSCR.
pub const RSTRSCR_SW: u32 = 0x0000_0200;

pub struct Guts {
    rstcr: AtomicU32,
    rstrscr: AtomicU32,
    /// Latched reset request; the platform reset path polls this.
    reset_requested: AtomicBool,
}

impl Default for Guts {
    fn default() -> Self {
        Self::new()
    }
}

impl Guts {
    pub fn new() -> Self {
        Guts {
            rstcr: AtomicU32::new(0),
            rstrscr: AtomicU32::new(0),
            reset_requested: AtomicBool::new(false),
        }
    }

    /// Request a whole-system reset through RSTCR.
    pub fn system_reset(&self) {
        printlog!(LogType::Misc, LogLevel::Normal, "system reset requested via RSTCR");
        self.rstcr.fetch_or(RSTCR_RESET_REQ, Ordering::AcqRel);
        self.rstrscr.fetch_or(RSTRSCR_SW, Ordering::AcqRel);
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested.load(Ordering::Acquire)
    }

    /// Reset cause, as the reset status register reports it.
    pub fn reset_status(&self) -> u32 {
        self.rstrscr.load(Ordering::Acquire)
    }
}

/// Guest accesses to the virtualized GUTS window. A store to RSTCR
/// with RESET_REQ becomes a hypervisor reset request; everything else
/// is a harmless read of the shadowed registers.
fn guts_vf_handler(guest: &Arc<Guest>, regs: &mut TrapFrame, paddr: u64) {
    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return,
    };

    let offset = paddr & 0xfff;
    if offset == GUTS_RSTCR {
        printlog!(LogType::Misc, LogLevel::Normal,
                  "guest {} wrote RSTCR; forwarding reset request", guest.name);
        hv.guts.system_reset();
    }

    // step past the faulting access
    regs.srr0 += 4;
}

/// Give `guest` an emulated GUTS window at `gphys_base`.
pub fn virtualized_guts_init(guest: &Arc<Guest>, gphys_base: u64) {
    guest.vf_ranges.lock().push(VfRange {
        start: gphys_base,
        end: gphys_base + 0xfff,
        handler: guts_vf_handler,
    });
}
