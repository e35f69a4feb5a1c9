//! MPIC-class hardware interrupt controller model.
//!
//! Per-source state mirrors the registers the hypervisor programs on the
//! real controller: vector (rewritten to guest handles), mask, priority,
//! destination-core mask, level/edge config, the in-service bit, and the
//! four IPI dispatch sources used by fast doorbells. On silicon, writes
//! through this type pair with stores into the PIC's CCSR window.

use alloc::vec::Vec;
use spin::Mutex;

/// Interrupt sources modeled (externals, internals, messaging, IPIs).
pub const MPIC_NUM_SRCS: usize = 256;
/// Number of IPI sources.
pub const MPIC_NUM_IPIS: usize = 4;
/// Spurious vector returned by IACK when nothing is pending.
pub const MPIC_SPURIOUS: u16 = 0xffff;

/// IRQ configuration bits shared with the VPIC and hypercall ABI.
pub const IRQ_LEVEL: u32 = 0x0000_0001;
pub const IRQ_ACTIVE_LOW: u32 = 0x0000_0002;

/// IPI source numbers live at the top of the source range.
#[inline]
pub const fn ipi_irq(ipi: usize) -> usize {
    MPIC_NUM_SRCS - MPIC_NUM_IPIS + ipi
}

#[derive(Debug, Clone)]
struct MpicSrc {
    vector: u16,
    masked: bool,
    pending: bool,
    active: bool,
    priority: u8,
    destcpu: u32,
    config: u32,
    msir: u32,
}

impl Default for MpicSrc {
    fn default() -> Self {
        MpicSrc {
            vector: MPIC_SPURIOUS,
            masked: true,
            pending: false,
            active: false,
            priority: 0,
            destcpu: 1,
            config: 0,
            msir: 0,
        }
    }
}

/// The controller. One per system; sources are individually locked so
/// per-IRQ reprogramming does not serialize unrelated devices.
pub struct Mpic {
    srcs: Vec<Mutex<MpicSrc>>,
    /// EPR delivery ("coreint") instead of IACK reads.
    pub coreint: bool,
}

impl Mpic {
    pub fn new(coreint: bool) -> Self {
        let mut srcs = Vec::with_capacity(MPIC_NUM_SRCS);
        srcs.resize_with(MPIC_NUM_SRCS, || Mutex::new(MpicSrc::default()));
        Mpic { srcs, coreint }
    }

    pub fn set_vector(&self, irq: usize, vector: u16) {
        self.srcs[irq].lock().vector = vector;
    }

    pub fn vector(&self, irq: usize) -> u16 {
        self.srcs[irq].lock().vector
    }

    pub fn mask(&self, irq: usize) {
        self.srcs[irq].lock().masked = true;
    }

    pub fn unmask(&self, irq: usize) {
        self.srcs[irq].lock().masked = false;
    }

    pub fn is_masked(&self, irq: usize) -> bool {
        self.srcs[irq].lock().masked
    }

    pub fn set_priority(&self, irq: usize, priority: u8) {
        self.srcs[irq].lock().priority = priority;
    }

    pub fn priority(&self, irq: usize) -> u8 {
        self.srcs[irq].lock().priority
    }

    pub fn set_destcpu(&self, irq: usize, mask: u32) {
        self.srcs[irq].lock().destcpu = mask;
    }

    pub fn destcpu(&self, irq: usize) -> u32 {
        self.srcs[irq].lock().destcpu
    }

    pub fn set_config(&self, irq: usize, config: u32) {
        self.srcs[irq].lock().config = config;
    }

    pub fn config(&self, irq: usize) -> u32 {
        self.srcs[irq].lock().config
    }

    pub fn set_msir(&self, irq: usize, msir: u32) {
        self.srcs[irq].lock().msir = msir;
    }

    pub fn msir(&self, irq: usize) -> u32 {
        self.srcs[irq].lock().msir
    }

    /// In-service bit: set between delivery and EOI.
    pub fn is_active(&self, irq: usize) -> bool {
        let s = self.srcs[irq].lock();
        s.active || s.pending
    }

    /// Assert a source (device interrupt line, or IPI dispatch).
    pub fn assert_irq(&self, irq: usize) {
        self.srcs[irq].lock().pending = true;
    }

    pub fn deassert_irq(&self, irq: usize) {
        let mut s = self.srcs[irq].lock();
        if s.config & IRQ_LEVEL != 0 {
            s.pending = false;
        }
    }

    /// Write the IPI dispatch register: asserts the IPI source toward
    /// the cores in `dest_mask`.
    pub fn ipi_dispatch(&self, ipi: usize, dest_mask: u32) {
        let mut s = self.srcs[ipi_irq(ipi)].lock();
        s.destcpu = dest_mask;
        s.pending = true;
    }

    /// Interrupt acknowledge from core `core`: the highest-priority
    /// pending, unmasked source destined to this core moves to
    /// in-service and its vector is returned.
    pub fn iack(&self, core: usize) -> u16 {
        let mut best: Option<usize> = None;
        let mut best_prio = 0u8;

        for irq in 0..MPIC_NUM_SRCS {
            let s = self.srcs[irq].lock();
            if s.pending && !s.masked && s.destcpu & (1 << core) != 0 {
                if best.is_none() || s.priority > best_prio {
                    best = Some(irq);
                    best_prio = s.priority;
                }
            }
        }

        match best {
            Some(irq) => {
                let mut s = self.srcs[irq].lock();
                if s.config & IRQ_LEVEL == 0 {
                    s.pending = false;
                }
                s.active = true;
                s.vector
            }
            None => MPIC_SPURIOUS,
        }
    }

    /// End-of-interrupt: drops the in-service bit.
    pub fn eoi(&self, irq: usize) {
        self.srcs[irq].lock().active = false;
    }

    /// Any source pending toward `core`?
    pub fn pending_for_core(&self, core: usize) -> bool {
        (0..MPIC_NUM_SRCS).any(|irq| {
            let s = self.srcs[irq].lock();
            s.pending && !s.masked && s.destcpu & (1 << core) != 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_masked_spurious() {
        let mpic = Mpic::new(false);
        assert!(mpic.is_masked(5));
        assert_eq!(mpic.iack(0), MPIC_SPURIOUS);
    }

    #[test]
    fn test_iack_eoi_cycle() {
        let mpic = Mpic::new(false);
        mpic.set_vector(10, 0x42);
        mpic.set_destcpu(10, 1);
        mpic.unmask(10);
        mpic.assert_irq(10);

        assert_eq!(mpic.iack(0), 0x42);
        assert!(mpic.is_active(10));
        // edge source: acknowledged means no longer pending
        assert_eq!(mpic.iack(0), MPIC_SPURIOUS);

        mpic.eoi(10);
        assert!(!mpic.is_active(10));
    }

    #[test]
    fn test_priority_ordering() {
        let mpic = Mpic::new(false);
        for (irq, prio, vec) in [(3usize, 1u8, 0x31u16), (4, 7, 0x47), (5, 3, 0x53)] {
            mpic.set_vector(irq, vec);
            mpic.set_destcpu(irq, 1);
            mpic.set_priority(irq, prio);
            mpic.unmask(irq);
            mpic.assert_irq(irq);
        }
        assert_eq!(mpic.iack(0), 0x47);
        assert_eq!(mpic.iack(0), 0x53);
        assert_eq!(mpic.iack(0), 0x31);
    }

    #[test]
    fn test_dest_mask_gates_delivery() {
        let mpic = Mpic::new(false);
        mpic.set_vector(7, 0x77);
        mpic.set_destcpu(7, 1 << 2);
        mpic.unmask(7);
        mpic.assert_irq(7);

        assert_eq!(mpic.iack(0), MPIC_SPURIOUS);
        assert_eq!(mpic.iack(2), 0x77);
    }

    #[test]
    fn test_level_source_stays_pending() {
        let mpic = Mpic::new(false);
        mpic.set_vector(9, 0x99);
        mpic.set_destcpu(9, 1);
        mpic.set_config(9, IRQ_LEVEL);
        mpic.unmask(9);
        mpic.assert_irq(9);

        assert_eq!(mpic.iack(0), 0x99);
        // still pending until the line deasserts
        assert_eq!(mpic.iack(0), 0x99);
        mpic.deassert_irq(9);
        assert_eq!(mpic.iack(0), MPIC_SPURIOUS);
    }

    #[test]
    fn test_ipi_dispatch() {
        let mpic = Mpic::new(false);
        let irq = ipi_irq(0);
        mpic.set_vector(irq, 0x100);
        mpic.unmask(irq);
        mpic.ipi_dispatch(0, 1 << 3);

        assert!(mpic.pending_for_core(3));
        assert!(!mpic.pending_for_core(1));
        assert_eq!(mpic.iack(3), 0x100);
    }
}
