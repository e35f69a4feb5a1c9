//! Inter-partition doorbell interrupts.
//!
//! A normal doorbell fans out to a list of receive endpoints, each a
//! vpic interrupt in some partition. A fast doorbell is backed by one
//! of the four hardware IPI sources and a system-wide global handle, so
//! ringing it is a single dispatch-register write.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::arch::TrapFrame;
use crate::errors::{Error, Result, EV_SUCCESS};
use crate::guest::handles::{Handle, MAX_HANDLES};
use crate::guest::Guest;
use crate::intr::mpic::{ipi_irq, Mpic};
use crate::intr::vmpic::{self, IntSrc};
use crate::intr::vpic;
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// Hardware limit on IPI-backed doorbells.
pub const MAX_FAST_DOORBELLS: usize = 4;

/// Global handles are carved from the top of every partition's handle
/// space so one number is valid in all of them.
static NEXT_GLOBAL_HANDLE: AtomicUsize = AtomicUsize::new(MAX_HANDLES - 1);

fn alloc_global_handle() -> usize {
    NEXT_GLOBAL_HANDLE.fetch_sub(1, Ordering::Relaxed)
}

pub enum DoorbellKind {
    Normal {
        /// (guest, vint) pairs asserted on each ring.
        receivers: Mutex<Vec<(Weak<Guest>, usize)>>,
    },
    Fast {
        mpic: Arc<Mpic>,
        ipi: usize,
        global_handle: usize,
    },
}

pub struct Doorbell {
    pub kind: DoorbellKind,
}

impl Doorbell {
    pub fn new_normal() -> Arc<Doorbell> {
        Arc::new(Doorbell {
            kind: DoorbellKind::Normal { receivers: Mutex::new(Vec::new()) },
        })
    }

    /// `ipi` is the IPI source index assigned by the caller, which also
    /// enforces the system-wide limit of four.
    pub fn new_fast(mpic: Arc<Mpic>, ipi: usize) -> Arc<Doorbell> {
        let global_handle = alloc_global_handle();
        mpic.set_vector(ipi_irq(ipi), global_handle as u16);
        Arc::new(Doorbell {
            kind: DoorbellKind::Fast { mpic, ipi, global_handle },
        })
    }

    pub fn global_handle(&self) -> Option<usize> {
        match self.kind {
            DoorbellKind::Fast { global_handle, .. } => Some(global_handle),
            DoorbellKind::Normal { .. } => None,
        }
    }
}

/// Ring a doorbell: returns the number of interrupts sent.
pub fn send_doorbells(dbell: &Doorbell) -> usize {
    match &dbell.kind {
        DoorbellKind::Fast { mpic, ipi, .. } => {
            mpic.assert_irq(ipi_irq(*ipi));
            1
        }
        DoorbellKind::Normal { receivers } => {
            let receivers = receivers.lock();
            let mut count = 0;
            for (guest, irq) in receivers.iter() {
                if let Some(g) = guest.upgrade() {
                    vpic::assert_vint(&g, *irq);
                    count += 1;
                }
            }
            count
        }
    }
}

/// Give `guest` a send handle for `dbell`.
pub fn attach_send_handle(guest: &Arc<Guest>, dbell: &Arc<Doorbell>) -> Result<usize> {
    guest.handles.lock().alloc(Handle::DbellSend(dbell.clone()))
}

/// Attach a receive endpoint in `guest`, stamping the `interrupts`
/// property onto the given guest-tree node. Normal doorbells get a
/// fresh vint; fast doorbells bind the IPI source at the global handle.
pub fn attach_receive_doorbell(
    guest: &Arc<Guest>,
    dbell: &Arc<Doorbell>,
    node_name: &str,
) -> Result<()> {
    let intspec: [u32; 2];

    match &dbell.kind {
        DoorbellKind::Fast { mpic, ipi, global_handle } => {
            let vmirq = vmpic::new_global(
                guest,
                IntSrc::Mpic { mpic: mpic.clone(), irq: ipi_irq(*ipi) },
                0,
                *global_handle,
            );
            guest
                .handles
                .lock()
                .set(*global_handle, Handle::VmpicInt(vmirq))?;
            intspec = [*global_handle as u32, 0];
        }
        DoorbellKind::Normal { receivers } => {
            let (vmirq, spec) = vmpic::alloc_vpic_handle(guest, 0)?;
            if let IntSrc::Vpic { irq, .. } = vmirq.irq {
                receivers.lock().push((Arc::downgrade(guest), irq));
            }
            intspec = spec;
        }
    }

    let mut gdt = guest.gdt.lock();
    let handles = guest.handles_node(&mut gdt);
    let gnode = match gdt.subnode(handles, node_name) {
        Some(n) => n,
        None => gdt.add_node(handles, node_name),
    };
    gdt.set_prop_str(gnode, "compatible", "epapr,hv-receive-doorbell");
    gdt.set_prop_cells(gnode, "interrupts", &intspec);
    Ok(())
}

/// Record a send handle node in the guest device tree.
pub fn attach_send_doorbell(
    guest: &Arc<Guest>,
    dbell: &Arc<Doorbell>,
    node_name: &str,
) -> Result<usize> {
    let ghandle = attach_send_handle(guest, dbell)?;

    let mut gdt = guest.gdt.lock();
    let handles = guest.handles_node(&mut gdt);
    let gnode = match gdt.subnode(handles, node_name) {
        Some(n) => n,
        None => gdt.add_node(handles, node_name),
    };
    gdt.set_prop_str(gnode, "compatible", "epapr,hv-send-doorbell");
    gdt.set_prop_u32(gnode, "reg", ghandle as u32);

    printlog!(LogType::Doorbell, LogLevel::Debug,
              "doorbell send handle {} in {}", ghandle, guest.name);
    Ok(ghandle)
}

/// `partition_send_dbell` hypercall: ring the doorbell behind a send
/// handle.
pub fn hcall_send_dbell(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];

    let dbell = {
        let handles = guest.handles.lock();
        match handles.get(handle as usize).and_then(|h| h.as_dbell_send()) {
            Some(db) => db.clone(),
            None => return regs.set_status(Error::Invalid.status()),
        }
    };

    send_doorbells(&dbell);
    regs.set_status(EV_SUCCESS);
}
