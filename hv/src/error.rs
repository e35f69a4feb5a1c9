//! Platform error records, event queues, and the error policy table.
//!
//! Errors are captured into fixed-shape records and logged whole or not
//! at all. Three queue identities exist: the hypervisor-internal queue
//! (drained to the log by the boot core), the global queue (delivered
//! to the error-manager partition by critical interrupt), and a
//! per-guest queue (delivered as a machine-check doorbell so a guest
//! sees its own faults).

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::arch::{TrapFrame, MCSR_MCP, PAGE_SHIFT};
use crate::errors::{Error, EV_SUCCESS};
use crate::events::{self, EV_DUMP_HV_QUEUE, EV_GUEST_CRIT_INT, EV_MCP};
use crate::guest::gcpu::GCPU_PEND_CRIT_INT;
use crate::guest::Guest;
use crate::hv::Hypervisor;
use crate::log::{LogLevel, LogType};
use crate::printlog;

/// Records held per queue; writes drop when full.
pub const ERROR_QUEUE_DEPTH: usize = 64;

/// Serialized record layout (bytes): domain[16], error[16],
/// hdev_tree_path[256], gdev_tree_path[256], payload words[24].
pub const ERROR_RECORD_BYTES: usize = 16 + 16 + 256 + 256 + 24 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Mcheck,
    Cpc,
    Ccf,
    Misc,
    Pamu,
    Ddr,
}

impl ErrorDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorDomain::Mcheck => "mcheck",
            ErrorDomain::Cpc => "cpc",
            ErrorDomain::Ccf => "ccf",
            ErrorDomain::Misc => "misc",
            ErrorDomain::Pamu => "pamu",
            ErrorDomain::Ddr => "ddr",
        }
    }

    pub fn from_str(s: &str) -> Option<ErrorDomain> {
        match s {
            "mcheck" => Some(ErrorDomain::Mcheck),
            "cpc" => Some(ErrorDomain::Cpc),
            "ccf" => Some(ErrorDomain::Ccf),
            "misc" => Some(ErrorDomain::Misc),
            "pamu" => Some(ErrorDomain::Pamu),
            "ddr" => Some(ErrorDomain::Ddr),
            _ => None,
        }
    }
}

/// Domain-specific capture registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorInfo {
    None,
    Mcheck { mcsr: u32, mcar: u64, mcsrr0: u64, mcsrr1: u32 },
    Cpc { errdet: u32, errdis: u32, erratt: u32, capt_ecc: u32, erraddr: u64, errctl: u32 },
    Ccf { cedr: u32, ceer: u32, cecar: u32, cmecar: u32, cecaddr: u64 },
    Pamu { avs1: u32, avs2: u32, av_addr: u64, lpid: u32, liodn_handle: u32 },
    Ddr { errdet: u32, errdis: u32, errint: u32, capt_ecc: u32, capt_addr: u64, err_attr: u32 },
}

/// One fault record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvError {
    pub domain: ErrorDomain,
    pub error: String,
    pub hdev_tree_path: String,
    pub gdev_tree_path: String,
    pub info: ErrorInfo,
}

impl HvError {
    pub fn new(domain: ErrorDomain, error: &str) -> HvError {
        HvError {
            domain,
            error: error.to_string(),
            hdev_tree_path: String::new(),
            gdev_tree_path: String::new(),
            info: ErrorInfo::None,
        }
    }

    /// Serialize into the guest-facing byte layout. Strings are
    /// truncated and nul-padded in place.
    pub fn to_bytes(&self) -> [u8; ERROR_RECORD_BYTES] {
        let mut out = [0u8; ERROR_RECORD_BYTES];

        fn put_str(dst: &mut [u8], s: &str) {
            let n = s.len().min(dst.len() - 1);
            dst[..n].copy_from_slice(&s.as_bytes()[..n]);
        }

        put_str(&mut out[0..16], self.domain.as_str());
        put_str(&mut out[16..32], &self.error);
        put_str(&mut out[32..288], &self.hdev_tree_path);
        put_str(&mut out[288..544], &self.gdev_tree_path);

        let mut words = [0u32; 24];
        match self.info {
            ErrorInfo::None => {}
            ErrorInfo::Mcheck { mcsr, mcar, mcsrr0, mcsrr1 } => {
                words[0] = mcsr;
                words[1] = (mcar >> 32) as u32;
                words[2] = mcar as u32;
                words[3] = (mcsrr0 >> 32) as u32;
                words[4] = mcsrr0 as u32;
                words[5] = mcsrr1;
            }
            ErrorInfo::Cpc { errdet, errdis, erratt, capt_ecc, erraddr, errctl } => {
                words[0] = errdet;
                words[1] = errdis;
                words[2] = erratt;
                words[3] = capt_ecc;
                words[4] = (erraddr >> 32) as u32;
                words[5] = erraddr as u32;
                words[6] = errctl;
            }
            ErrorInfo::Ccf { cedr, ceer, cecar, cmecar, cecaddr } => {
                words[0] = cedr;
                words[1] = ceer;
                words[2] = cecar;
                words[3] = cmecar;
                words[4] = (cecaddr >> 32) as u32;
                words[5] = cecaddr as u32;
            }
            ErrorInfo::Pamu { avs1, avs2, av_addr, lpid, liodn_handle } => {
                words[0] = avs1;
                words[1] = avs2;
                words[2] = (av_addr >> 32) as u32;
                words[3] = av_addr as u32;
                words[4] = lpid;
                words[5] = liodn_handle;
            }
            ErrorInfo::Ddr { errdet, errdis, errint, capt_ecc, capt_addr, err_attr } => {
                words[0] = errdet;
                words[1] = errdis;
                words[2] = errint;
                words[3] = capt_ecc;
                words[4] = (capt_addr >> 32) as u32;
                words[5] = capt_addr as u32;
                words[6] = err_attr;
            }
        }
        for (i, w) in words.iter().enumerate() {
            out[544 + i * 4..544 + i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
        out
    }
}

/// A bounded queue of whole records.
pub struct ErrorQueue {
    q: Mutex<VecDeque<HvError>>,
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorQueue {
    pub fn new() -> Self {
        ErrorQueue { q: Mutex::new(VecDeque::with_capacity(ERROR_QUEUE_DEPTH)) }
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    /// Log a whole record, or drop it if the queue is full.
    pub fn log(&self, err: HvError) -> bool {
        let mut q = self.q.lock();
        if q.len() >= ERROR_QUEUE_DEPTH {
            printlog!(LogType::Errorq, LogLevel::Debug,
                      "error event queue full, dropping errors");
            return false;
        }
        q.push_back(err);
        true
    }

    /// Pop (or peek) one record. When a pending flag is supplied, it is
    /// cleared if the queue drained and re-set otherwise, atomically
    /// with respect to concurrent producers.
    pub fn get(&self, flag: Option<(&AtomicU32, u32)>, peek: bool) -> Option<HvError> {
        let mut q = self.q.lock();
        let err = if peek { q.front().cloned() } else { q.pop_front() };

        if let Some((flag, mask)) = flag {
            flag.fetch_and(!mask, Ordering::AcqRel);
            if !q.is_empty() {
                flag.fetch_or(mask, Ordering::AcqRel);
            }
        }

        err
    }
}

// ── queue identities ────────────────────────────────────────────────

/// Log into the hypervisor-internal queue; the boot core dumps it.
pub fn log_hv_event(hv: &Hypervisor, err: HvError) {
    if !hv.hv_queue.log(err) {
        return;
    }
    match hv.boot_gcpu() {
        Some(gcpu) => events::setevent(&gcpu, EV_DUMP_HV_QUEUE),
        None => dump_hv_queue(hv),
    }
}

/// Log into the global queue and notify the error manager by critical
/// interrupt.
pub fn log_global_event(hv: &Hypervisor, err: HvError) {
    if !hv.global_queue.log(err) {
        return;
    }
    if let Some(manager) = hv.error_manager() {
        let gcpu = &manager.gcpus[0];
        gcpu.crit_gdbell_pending.fetch_or(GCPU_PEND_CRIT_INT, Ordering::AcqRel);
        events::setevent(gcpu, EV_GUEST_CRIT_INT);
    }
}

/// Log into a guest's own queue; the guest sees a machine check.
pub fn log_guest_event(guest: &Guest, err: HvError) {
    if !guest.error_queue.log(err) {
        return;
    }
    let gcpu = &guest.gcpus[0];
    gcpu.mcsr.fetch_or(MCSR_MCP, Ordering::AcqRel);
    events::setevent(gcpu, EV_MCP);
    crate::pm::wake_hcall_nap(gcpu);
}

/// EV_DUMP_HV_QUEUE: drain the internal queue into the log.
pub fn dump_hv_queue(hv: &Hypervisor) {
    while let Some(err) = hv.hv_queue.get(None, false) {
        printlog!(LogType::Errorq, LogLevel::Error,
                  "error: domain {} error {} path {}",
                  err.domain.as_str(), err.error, err.hdev_tree_path);
    }
}

// ── policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Disable,
    Notify,
    Halt,
    SystemReset,
}

impl Policy {
    pub fn from_str(s: &str) -> Option<Policy> {
        match s {
            "disable" => Some(Policy::Disable),
            "notify" => Some(Policy::Notify),
            "halt" => Some(Policy::Halt),
            "system-reset" => Some(Policy::SystemReset),
            _ => None,
        }
    }
}

struct PolicyEntry {
    domain: ErrorDomain,
    error: &'static str,
    policy: Policy,
}

/// (domain, error) → policy, seeded with defaults and overridden by
/// `error-config` nodes in the configuration tree.
pub struct ErrorPolicyTable {
    entries: Mutex<alloc::vec::Vec<(ErrorDomain, String, Policy)>>,
}

const DEFAULT_POLICIES: &[PolicyEntry] = &[
    PolicyEntry { domain: ErrorDomain::Cpc, error: "tag multi-way hit", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Cpc, error: "tag status multi-bit ecc", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Cpc, error: "tag status single-bit ecc", policy: Policy::Disable },
    PolicyEntry { domain: ErrorDomain::Cpc, error: "data multi-bit ecc", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Cpc, error: "data single-bit ecc", policy: Policy::Disable },
    PolicyEntry { domain: ErrorDomain::Cpc, error: "config", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ccf, error: "multiple intervention", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ccf, error: "local access", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Misc, error: "internal ram multi-bit ecc", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Pamu, error: "operation", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Pamu, error: "single-bit ecc", policy: Policy::Disable },
    PolicyEntry { domain: ErrorDomain::Pamu, error: "multi-bit ecc", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Pamu, error: "access violation", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ddr, error: "memory select", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ddr, error: "single-bit ecc", policy: Policy::Disable },
    PolicyEntry { domain: ErrorDomain::Ddr, error: "multi-bit ecc", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ddr, error: "corrupted data", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ddr, error: "auto calibration", policy: Policy::Notify },
    PolicyEntry { domain: ErrorDomain::Ddr, error: "address parity", policy: Policy::Notify },
];

impl Default for ErrorPolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorPolicyTable {
    pub fn new() -> Self {
        let entries = DEFAULT_POLICIES
            .iter()
            .map(|e| (e.domain, e.error.to_string(), e.policy))
            .collect();
        ErrorPolicyTable { entries: Mutex::new(entries) }
    }

    pub fn get(&self, domain: ErrorDomain, error: &str) -> Policy {
        self.entries
            .lock()
            .iter()
            .find(|(d, e, _)| *d == domain && e == error)
            .map(|(_, _, p)| *p)
            .unwrap_or(Policy::Notify)
    }

    pub fn set(&self, domain: ErrorDomain, error: &str, policy: Policy) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.iter_mut().find(|(d, e, _)| *d == domain && e == error) {
            e.2 = policy;
        } else {
            entries.push((domain, error.to_string(), policy));
        }
    }
}

/// Apply the configured policy for an error that just fired.
pub fn error_policy_action(hv: &Arc<Hypervisor>, err: HvError, owner: Option<&Arc<Guest>>) {
    let policy = hv.error_policies.get(err.domain, &err.error);

    printlog!(LogType::Errorq, LogLevel::Normal,
              "error {} / {}: policy {:?}", err.domain.as_str(), err.error, policy);

    match policy {
        Policy::Disable => {
            // Detection for this source was configured off; record only
            // in the internal queue for diagnostics.
            log_hv_event(hv, err);
        }
        Policy::Notify => {
            if let Some(guest) = owner {
                log_guest_event(guest, err.clone());
            }
            log_hv_event(hv, err.clone());
            log_global_event(hv, err);
        }
        Policy::Halt => {
            log_hv_event(hv, err);
            dump_hv_queue(hv);
            hv.halt();
        }
        Policy::SystemReset => {
            log_hv_event(hv, err);
            hv.guts.system_reset();
        }
    }
}

// ── err_get_info hypercall ──────────────────────────────────────────

/// Hand the next error record to the guest. GPR4 selects the queue
/// (0 = own, 1 = global, error manager only), GPR5/GPR6 the buffer
/// guest-physical address and length, GPR7 peek.
pub fn hcall_err_get_info(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let queue_sel = regs.gpregs[4];
    let gaddr = regs.gpregs[5];
    let len = regs.gpregs[6] as usize;
    let peek = regs.gpregs[7] != 0;

    if len < ERROR_RECORD_BYTES {
        return regs.set_status(Error::Invalid.status());
    }

    let hv = match guest.hv.upgrade() {
        Some(hv) => hv,
        None => return regs.set_status(Error::NoDev.status()),
    };

    let err = match queue_sel {
        0 => {
            let gcpu = &guest.gcpus[0];
            guest.error_queue.get(Some((&gcpu.mcsr, MCSR_MCP)), peek)
        }
        1 => {
            let is_manager = hv
                .error_manager()
                .map(|m| Arc::ptr_eq(&m, guest))
                .unwrap_or(false);
            if !is_manager {
                return regs.set_status(Error::Perm.status());
            }
            hv.global_queue.get(None, peek)
        }
        _ => return regs.set_status(Error::Invalid.status()),
    };

    let err = match err {
        Some(e) => e,
        None => return regs.set_status(Error::NotFound.status()),
    };

    // The buffer must be contiguous, DMA-mapped and writable.
    let grpn = gaddr >> PAGE_SHIFT;
    let last = (gaddr + ERROR_RECORD_BYTES as u64 - 1) >> PAGE_SHIFT;
    let rpn = { guest.gphys.lock().get_rpn(grpn, last - grpn + 1) };
    let rpn = match rpn {
        Some(r) => r,
        None => return regs.set_status(Error::Fault.status()),
    };

    let paddr = (rpn << PAGE_SHIFT) | (gaddr & 0xfff);
    hv.phys_mem.write(paddr, &err.to_bytes());
    regs.set_status(EV_SUCCESS);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32) -> HvError {
        let mut e = HvError::new(ErrorDomain::Pamu, "access violation");
        e.info = ErrorInfo::Pamu { avs1: n, avs2: 0, av_addr: 0xe00_0000, lpid: 1, liodn_handle: 7 };
        e
    }

    #[test]
    fn test_whole_records_only() {
        let q = ErrorQueue::new();
        for i in 0..ERROR_QUEUE_DEPTH as u32 {
            assert!(q.log(record(i)));
        }
        // full: the next record is dropped, not torn
        assert!(!q.log(record(999)));
        assert_eq!(q.len(), ERROR_QUEUE_DEPTH);

        for i in 0..ERROR_QUEUE_DEPTH as u32 {
            assert_eq!(q.get(None, false).unwrap(), record(i));
        }
        assert!(q.get(None, false).is_none());
    }

    #[test]
    fn test_pending_flag_tracks_queue() {
        let q = ErrorQueue::new();
        let flag = AtomicU32::new(MCSR_MCP);
        q.log(record(1));
        q.log(record(2));

        q.get(Some((&flag, MCSR_MCP)), false);
        assert_ne!(flag.load(Ordering::Relaxed) & MCSR_MCP, 0);
        q.get(Some((&flag, MCSR_MCP)), false);
        assert_eq!(flag.load(Ordering::Relaxed) & MCSR_MCP, 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let q = ErrorQueue::new();
        q.log(record(5));
        assert_eq!(q.get(None, true).unwrap(), record(5));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_serialization_layout() {
        let bytes = record(0xaabbccdd).to_bytes();
        assert_eq!(&bytes[0..4], b"pamu");
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[16..32], b"access violatio\0");
        // avs1 big-endian at the payload base
        assert_eq!(&bytes[544..548], &[0xaa, 0xbb, 0xcc, 0xdd]);
        // av_addr low word
        assert_eq!(&bytes[552..560], &[0, 0, 0, 0, 0x0e, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_guest_event_sets_mcheck() {
        let guest = Guest::new_bare("errg", 1, &[0]);
        log_guest_event(&guest, record(1));
        let gcpu = &guest.gcpus[0];
        assert_ne!(gcpu.mcsr.load(Ordering::Relaxed) & MCSR_MCP, 0);
        assert_ne!(gcpu.dbell_pending.load(Ordering::Relaxed) & (1 << EV_MCP), 0);
    }

    #[test]
    fn test_policy_defaults_and_override() {
        let t = ErrorPolicyTable::new();
        assert_eq!(t.get(ErrorDomain::Pamu, "access violation"), Policy::Notify);
        assert_eq!(t.get(ErrorDomain::Ddr, "single-bit ecc"), Policy::Disable);
        assert_eq!(t.get(ErrorDomain::Misc, "unknown thing"), Policy::Notify);

        t.set(ErrorDomain::Pamu, "access violation", Policy::Halt);
        assert_eq!(t.get(ErrorDomain::Pamu, "access violation"), Policy::Halt);
    }
}
