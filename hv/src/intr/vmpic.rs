//! VMPIC: the guest-handle layer over interrupt sources.
//!
//! Every interrupt a guest can see - physical (MPIC) or virtual (VPIC)
//! - is wrapped in a `VmpicInterrupt` carrying the owning guest, the
//! handle number returned to the guest, and the claim state. The `int_*`
//! hypercalls route through here; `iack` returns handles, not hardware
//! vectors, so guests treat all interrupts uniformly.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::TrapFrame;
use crate::errors::{Error, Result, EV_SUCCESS};
use crate::guest::gcpu::Gcpu;
use crate::guest::handles::Handle;
use crate::guest::Guest;
use crate::intr::mpic::{Mpic, IRQ_LEVEL};
use crate::intr::vpic;
use crate::log::{LogLevel, LogType};
use crate::printlog;
use crate::timers;

/// An interrupt source with a uniform operation set. Optional hardware
/// operations return `Unimplemented` on sources that lack them.
pub enum IntSrc {
    Vpic { guest: Weak<Guest>, irq: usize },
    Mpic { mpic: Arc<Mpic>, irq: usize },
}

impl IntSrc {
    fn with_guest<T>(guest: &Weak<Guest>, f: impl FnOnce(&Arc<Guest>) -> T) -> Option<T> {
        guest.upgrade().map(|g| f(&g))
    }

    pub fn eoi(&self, gcpu: &Gcpu) {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::eoi(g, gcpu, *irq));
            }
            IntSrc::Mpic { mpic, irq } => mpic.eoi(*irq),
        }
    }

    pub fn enable(&self) {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::unmask(g, *irq));
            }
            IntSrc::Mpic { mpic, irq } => mpic.unmask(*irq),
        }
    }

    pub fn disable(&self) {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::mask(g, *irq));
            }
            IntSrc::Mpic { mpic, irq } => mpic.mask(*irq),
        }
    }

    pub fn is_disabled(&self) -> bool {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::is_disabled(g, *irq)).unwrap_or(true)
            }
            IntSrc::Mpic { mpic, irq } => mpic.is_masked(*irq),
        }
    }

    pub fn set_cpu_dest_mask(&self, mask: u32) {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::set_destcpu(g, *irq, mask));
            }
            IntSrc::Mpic { mpic, irq } => mpic.set_destcpu(*irq, mask),
        }
    }

    pub fn cpu_dest_mask(&self) -> u32 {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::get_destcpu(g, *irq)).unwrap_or(1)
            }
            IntSrc::Mpic { mpic, irq } => mpic.destcpu(*irq),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::is_active(g, *irq)).unwrap_or(false)
            }
            IntSrc::Mpic { mpic, irq } => mpic.is_active(*irq),
        }
    }

    pub fn set_priority(&self, priority: u8) -> Result<()> {
        match self {
            IntSrc::Vpic { .. } => Err(Error::Unimplemented),
            IntSrc::Mpic { mpic, irq } => {
                mpic.set_priority(*irq, priority);
                Ok(())
            }
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            IntSrc::Vpic { .. } => 0,
            IntSrc::Mpic { mpic, irq } => mpic.priority(*irq),
        }
    }

    pub fn set_config(&self, config: u32) {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::set_config(g, *irq, config));
            }
            IntSrc::Mpic { mpic, irq } => mpic.set_config(*irq, config),
        }
    }

    pub fn config(&self) -> u32 {
        match self {
            IntSrc::Vpic { guest, irq } => {
                Self::with_guest(guest, |g| vpic::get_config(g, *irq)).unwrap_or(IRQ_LEVEL)
            }
            IntSrc::Mpic { mpic, irq } => mpic.config(*irq),
        }
    }

    pub fn msir(&self) -> Result<u32> {
        match self {
            IntSrc::Vpic { .. } => Err(Error::Unimplemented),
            IntSrc::Mpic { mpic, irq } => Ok(mpic.msir(*irq)),
        }
    }

    fn is_vpic(&self) -> bool {
        matches!(self, IntSrc::Vpic { .. })
    }
}

/// A guest's view of one interrupt source.
pub struct VmpicInterrupt {
    pub guest: Weak<Guest>,
    pub irq: IntSrc,
    pub config: u32,
    handle: AtomicUsize,
    claimed: AtomicBool,
}

impl VmpicInterrupt {
    pub fn handle(&self) -> usize {
        self.handle.load(Ordering::Acquire)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn set_claimed(&self, claimed: bool) {
        self.claimed.store(claimed, Ordering::Release);
    }

    /// Return the source to partition-boot state: masked, priority 0,
    /// destined to the partition's boot vCPU, configured per the
    /// original device tree.
    pub fn reset(&self) {
        self.irq.disable();
        let _ = self.irq.set_priority(0);

        if let IntSrc::Vpic { guest, irq } = &self.irq {
            self.irq.set_cpu_dest_mask(1);
            if let Some(g) = guest.upgrade() {
                vpic::clear_irq_state(&g, *irq);
            }
        } else if let Some(guest) = self.guest.upgrade() {
            self.irq.set_cpu_dest_mask(1 << guest.gcpus[0].coreid);
        }

        self.irq.set_config(self.config);
    }
}

/// A pre-claimed wrapper at a fixed (global) handle number; the caller
/// installs it into the handle table itself. Used by fast doorbells,
/// whose hardware vector is shared across partitions.
pub fn new_global(guest: &Arc<Guest>, irq: IntSrc, config: u32, handle: usize) -> Arc<VmpicInterrupt> {
    Arc::new(VmpicInterrupt {
        guest: Arc::downgrade(guest),
        irq,
        config,
        handle: AtomicUsize::new(handle),
        claimed: AtomicBool::new(true),
    })
}

/// Wrap an interrupt source in a vmpic interrupt and allocate a guest
/// handle for it. A standby wrapper (claimable device not yet owned)
/// stays unclaimed and does not touch the hardware.
pub fn alloc_handle(
    guest: &Arc<Guest>,
    irq: IntSrc,
    config: u32,
    standby: bool,
) -> Result<Arc<VmpicInterrupt>> {
    let vmirq = Arc::new(VmpicInterrupt {
        guest: Arc::downgrade(guest),
        irq,
        config,
        handle: AtomicUsize::new(0),
        claimed: AtomicBool::new(false),
    });

    if !standby {
        vmirq.reset();
        vmirq.set_claimed(true);
    }

    let handle = guest.handles.lock().alloc(Handle::VmpicInt(vmirq.clone()))?;
    vmirq.handle.store(handle, Ordering::Release);

    // Hardware sources return the guest handle directly at acknowledge.
    if !standby {
        if let IntSrc::Mpic { ref mpic, irq } = vmirq.irq {
            mpic.set_vector(irq, handle as u16);
        }
    }

    printlog!(LogType::Irq, LogLevel::Debug,
              "vmpic: handle {} in {}{}", handle, guest.name,
              if standby { " (standby)" } else { "" });

    Ok(vmirq)
}

/// Allocate a vpic source and wrap it; returns the interrupt and the
/// two-cell `interrupts` specifier for the guest device tree.
pub fn alloc_vpic_handle(
    guest: &Arc<Guest>,
    config: u32,
) -> Result<(Arc<VmpicInterrupt>, [u32; 2])> {
    let irq = vpic::alloc_irq(guest, config).ok_or(Error::NoMem)?;
    let vmirq = alloc_handle(
        guest,
        IntSrc::Vpic { guest: Arc::downgrade(guest), irq },
        config,
        false,
    )?;
    let spec = [vmirq.handle() as u32, config];
    Ok((vmirq, spec))
}

/// Spins this long (in timebase ticks) waiting for a claimed source to
/// quiesce: 100 ms at the platform timebase.
fn claim_timeout() -> u64 {
    timers::timebase_freq() / 10
}

/// Transfer a standby wrapper's source to its guest: the device-claim
/// action for interrupts.
///
/// The previous owner must be stopped, so the source is masked; wait
/// for the in-service bit to clear, reprogram the vector to the new
/// owner's handle, and swap the claim.
pub fn claim_int(new: &Arc<VmpicInterrupt>, prev: &Arc<VmpicInterrupt>) -> Result<()> {
    debug_assert!(new.irq.is_disabled());

    let start = timers::timebase_now();
    let mut spins = 0u32;
    while new.irq.is_active() {
        if timers::timebase_now().wrapping_sub(start) > claim_timeout() {
            printlog!(LogType::Irq, LogLevel::Error,
                      "claim_int: irq failed to become inactive");
            return Err(Error::Io);
        }
        spins += 1;
        if spins > 1_000_000 {
            return Err(Error::Io);
        }
        core::hint::spin_loop();
    }

    if let IntSrc::Mpic { ref mpic, irq } = new.irq {
        mpic.set_vector(irq, new.handle() as u16);
    }
    new.reset();

    debug_assert!(prev.is_claimed());
    prev.set_claimed(false);
    new.set_claimed(true);
    Ok(())
}

fn lookup(guest: &Guest, handle: u64) -> Result<Arc<VmpicInterrupt>> {
    let handles = guest.handles.lock();
    let h = handles.get(handle as usize).ok_or(Error::Invalid)?;
    let vmirq = h.as_vmpic().ok_or(Error::Invalid)?;
    if !vmirq.is_claimed() {
        return Err(Error::InvalidState);
    }
    Ok(vmirq.clone())
}

// ── int_* hypercalls ────────────────────────────────────────────────

pub fn hcall_int_set_config(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let config = regs.gpregs[5] as u32;
    let priority = regs.gpregs[6] as u8;
    let lcpu_dest = regs.gpregs[7] as usize;

    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    if lcpu_dest >= guest.gcpus.len() {
        return regs.set_status(Error::Invalid.status());
    }

    let _ = vmirq.irq.set_priority(priority);
    if vmirq.irq.is_vpic() {
        vmirq.irq.set_cpu_dest_mask(1 << lcpu_dest);
    } else {
        vmirq.irq.set_cpu_dest_mask(1 << guest.gcpus[lcpu_dest].coreid);
    }
    vmirq.irq.set_config(config);
    regs.set_status(EV_SUCCESS);
}

pub fn hcall_int_get_config(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    let mask = vmirq.irq.cpu_dest_mask();
    let lcpu_dest = if vmirq.irq.is_vpic() {
        mask.trailing_zeros() as usize
    } else {
        let pcpu = mask.trailing_zeros() as usize;
        guest
            .gcpus
            .iter()
            .position(|g| g.coreid == pcpu)
            .unwrap_or(0)
    };

    regs.gpregs[4] = vmirq.irq.config() as u64;
    regs.gpregs[5] = vmirq.irq.priority() as u64;
    regs.gpregs[6] = lcpu_dest as u64;
    regs.set_status(EV_SUCCESS);
}

pub fn hcall_int_set_mask(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let mask = regs.gpregs[5] != 0;

    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    printlog!(LogType::Irq, LogLevel::Verbose,
              "vmpic {}mask: {}", if mask { "" } else { "un" }, handle);

    if mask {
        vmirq.irq.disable();
    } else {
        vmirq.irq.enable();
    }
    regs.set_status(EV_SUCCESS);
}

pub fn hcall_int_get_mask(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    regs.gpregs[4] = vmirq.irq.is_disabled() as u64;
    regs.set_status(EV_SUCCESS);
}

pub fn hcall_int_eoi(guest: &Arc<Guest>, gcpu: &Gcpu, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    vmirq.irq.eoi(gcpu);
    regs.set_status(EV_SUCCESS);
}

/// IACK for guests running without EPR delivery: hardware sources first,
/// then virtual ones. Returns a handle in GPR4.
pub fn hcall_int_iack(
    guest: &Arc<Guest>,
    gcpu: &Gcpu,
    mpic: &Mpic,
    regs: &mut TrapFrame,
) {
    if mpic.coreint {
        return regs.set_status(Error::InvalidState.status());
    }

    let mut vector = mpic.iack(gcpu.coreid) as u64;
    if vector == crate::intr::mpic::MPIC_SPURIOUS as u64 {
        if let Some(irq) = vpic::iack(guest, gcpu) {
            // the vpic interrupt's guest handle is its vector
            if let Some(h) = guest.vmpic_handle_for_vpic(irq) {
                vector = h as u64;
            }
        }
    }

    printlog!(LogType::Irq, LogLevel::Verbose, "iack {:#x}", vector);
    regs.gpregs[4] = vector;
    regs.set_status(EV_SUCCESS);
}

pub fn hcall_int_get_activity(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    regs.gpregs[4] = vmirq.irq.is_active() as u64;
    regs.set_status(EV_SUCCESS);
}

pub fn hcall_vmpic_get_msir(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let vmirq = match lookup(guest, handle) {
        Ok(v) => v,
        Err(e) => return regs.set_status(e.status()),
    };

    match vmirq.irq.msir() {
        Ok(msir) => {
            regs.gpregs[4] = msir as u64;
            regs.set_status(EV_SUCCESS);
        }
        Err(e) => regs.set_status(e.status()),
    }
}
