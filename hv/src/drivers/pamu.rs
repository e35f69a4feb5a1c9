//! PAMU (Peripheral Access Management Unit) - the SoC IOMMU.
//!
//! Each DMA-capable device carries a LIODN that selects a PAACE
//! translation window. The hypervisor programs windows out of the
//! guest-physical map, hands guests a per-LIODN handle for DMA
//! enable/disable, captures access violations into error records, and
//! preserves the tables across a warm reboot at a reserved physical
//! address.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::arch::TrapFrame;
use crate::errors::{Error, Result, EV_SUCCESS};
use crate::error::{self, ErrorDomain, ErrorInfo, HvError};
use crate::guest::Guest;
use crate::hv::Hypervisor;
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// Warm-reboot preservation header.
pub const PAMU_MEM_MAGIC: u32 = 0x98fe_f3ca;
pub const PAMU_MEM_VERSION: u32 = 1;

/// One primary translation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paace {
    pub liodn: u32,
    /// Window base in guest-physical space.
    pub wbase: u64,
    /// log2 of the window size.
    pub wse: u32,
    /// Translated base (real-physical).
    pub twbase: u64,
    pub valid: bool,
}

/// A guest's handle over one LIODN.
pub struct PamuHandle {
    pub liodn: u32,
    pub enabled: AtomicBool,
}

pub struct Pamu {
    /// PAACE table, guarded during add/remove; violation handling
    /// re-enables the unit afterward (erratum A-003638).
    paact: Mutex<Vec<Paace>>,
    enabled: AtomicBool,
}

impl Default for Pamu {
    fn default() -> Self {
        Self::new()
    }
}

impl Pamu {
    pub fn new() -> Self {
        Pamu { paact: Mutex::new(Vec::new()), enabled: AtomicBool::new(true) }
    }

    /// Program (or reprogram) the window for a LIODN.
    pub fn set_window(&self, liodn: u32, wbase: u64, wse: u32, twbase: u64) {
        let mut paact = self.paact.lock();
        if let Some(p) = paact.iter_mut().find(|p| p.liodn == liodn) {
            *p = Paace { liodn, wbase, wse, twbase, valid: true };
        } else {
            paact.push(Paace { liodn, wbase, wse, twbase, valid: true });
        }
    }

    pub fn window(&self, liodn: u32) -> Option<Paace> {
        self.paact.lock().iter().copied().find(|p| p.liodn == liodn)
    }

    pub fn set_valid(&self, liodn: u32, valid: bool) -> Result<()> {
        let mut paact = self.paact.lock();
        match paact.iter_mut().find(|p| p.liodn == liodn) {
            Some(p) => {
                p.valid = valid;
                Ok(())
            }
            None => Err(Error::NoDev),
        }
    }

    /// Would a DMA of `len` bytes at `addr` stay inside the window?
    pub fn check_access(&self, liodn: u32, addr: u64, len: u64) -> bool {
        match self.window(liodn) {
            Some(p) if p.valid => {
                let size = 1u64 << p.wse;
                addr >= p.wbase && addr + len <= p.wbase + size
            }
            _ => false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Serialize the tables behind the warm-reboot header.
    pub fn save(&self) -> Vec<u8> {
        let paact = self.paact.lock();
        let mut out = Vec::with_capacity(8 + paact.len() * 32);
        out.extend_from_slice(&PAMU_MEM_MAGIC.to_be_bytes());
        out.extend_from_slice(&PAMU_MEM_VERSION.to_be_bytes());
        out.extend_from_slice(&(paact.len() as u32).to_be_bytes());

        for p in paact.iter() {
            out.extend_from_slice(&p.liodn.to_be_bytes());
            out.extend_from_slice(&p.wbase.to_be_bytes());
            out.extend_from_slice(&p.wse.to_be_bytes());
            out.extend_from_slice(&p.twbase.to_be_bytes());
            out.push(p.valid as u8);
            out.extend_from_slice(&[0u8; 3]);
        }
        out
    }

    /// Restore tables preserved across a warm reboot.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        if data.len() < 12 {
            return Err(Error::Invalid);
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if magic != PAMU_MEM_MAGIC || version != PAMU_MEM_VERSION {
            return Err(Error::Invalid);
        }

        let count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        const ENTRY: usize = 4 + 8 + 4 + 8 + 4;
        if data.len() < 12 + count * ENTRY {
            return Err(Error::Invalid);
        }

        let mut paact = self.paact.lock();
        paact.clear();
        for i in 0..count {
            let b = &data[12 + i * ENTRY..];
            paact.push(Paace {
                liodn: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                wbase: u64::from_be_bytes([b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11]]),
                wse: u32::from_be_bytes([b[12], b[13], b[14], b[15]]),
                twbase: u64::from_be_bytes([
                    b[16], b[17], b[18], b[19], b[20], b[21], b[22], b[23],
                ]),
                valid: b[24] != 0,
            });
        }
        Ok(())
    }
}

/// A DMA access violation fired for `guest`'s LIODN: capture once into
/// the guest's queue (machine check) and once toward the error manager
/// (critical interrupt), then re-enable the unit.
pub fn access_violation(
    hv: &Arc<Hypervisor>,
    guest: &Arc<Guest>,
    liodn_handle: u32,
    av_addr: u64,
    avs1: u32,
    avs2: u32,
) {
    printlog!(LogType::Pamu, LogLevel::Error,
              "pamu access violation: guest {} addr {:#x}", guest.name, av_addr);

    let mut err = HvError::new(ErrorDomain::Pamu, "access violation");
    err.info = ErrorInfo::Pamu { avs1, avs2, av_addr, lpid: guest.lpid, liodn_handle };
    err.hdev_tree_path.push_str("/soc/pamu");

    error::log_guest_event(guest, err.clone());
    error::error_policy_action(hv, err, None);

    // Erratum A-003638: the unit must be re-enabled after each
    // violation capture.
    hv.pamu.enabled.store(true, Ordering::Release);
}

/// `dma_enable`/`dma_disable` hypercall body: gate the window behind a
/// guest's LIODN handle.
pub fn hcall_dma_enable(guest: &Arc<Guest>, regs: &mut TrapFrame, enable: bool) {
    let handle = regs.gpregs[4];

    let pamu_handle = {
        let handles = guest.handles.lock();
        match handles.get(handle as usize).and_then(|h| h.as_pamu()) {
            Some(p) => p.clone(),
            None => return regs.set_status(Error::Invalid.status()),
        }
    };

    pamu_handle.enabled.store(enable, Ordering::Release);
    if let Some(hv) = guest.hv.upgrade() {
        let _ = hv.pamu.set_valid(pamu_handle.liodn, enable);
    }
    regs.set_status(EV_SUCCESS);
}
