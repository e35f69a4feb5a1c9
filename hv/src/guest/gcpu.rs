//! Per-vCPU state.
//!
//! Each vCPU is pinned 1:1 to a physical core. Event bitmaps are plain
//! atomics because remote cores post into them; the register shadow and
//! TLB state are only ever touched by the owning core and sit behind an
//! uncontended lock.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::sync::Weak;
use spin::Mutex;

use crate::arch::IVOR_COUNT;
use crate::intr::vpic::VpicCpu;
use crate::tlb::{GuestTlb1, HwTlb1};

use super::Guest;

// Guest doorbell causes, accumulated in `gdbell_pending`.
pub const GCPU_PEND_DECR: u32 = 0x0000_0001;
pub const GCPU_PEND_TCR_DIE: u32 = 0x0000_0002;
pub const GCPU_PEND_MSGSND: u32 = 0x0000_0004;
pub const GCPU_PEND_MSGSNDC: u32 = 0x0000_0008;
pub const GCPU_PEND_FIT: u32 = 0x0000_0010;
pub const GCPU_PEND_TCR_FIE: u32 = 0x0000_0020;
pub const GCPU_PEND_VIRQ: u32 = 0x0000_0040;
pub const GCPU_PEND_WATCHDOG: u32 = 0x0000_0080;
pub const GCPU_PEND_PERFMON: u32 = 0x0000_0100;
/// Critical interrupt (error-manager notification).
pub const GCPU_PEND_CRIT_INT: u32 = 0x0000_0200;
/// Non-maskable interrupt requested by a manager.
pub const GCPU_PEND_NMI: u32 = 0x0000_0400;

/// Per-vCPU counters, dumped by `partition-info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GcpuStat {
    EmuTotal = 0,
    EmuTlbwe = 1,
    EmuSpr = 2,
    Decr = 3,
}

pub const NUM_GCPU_STATS: usize = 4;

/// Shadowed guest SPRs. Hardware has guest variants only for SRR0/1;
/// the critical/machine-check/debug save-restore pairs and the MMU
/// assist scratch registers are kept here and presented to the guest by
/// the mfspr/mtspr emulation.
#[derive(Debug, Clone)]
pub struct GcpuRegs {
    pub ivpr: u64,
    pub ivor: [u32; IVOR_COUNT],
    pub sprg: [u64; 6],
    pub csrr0: u64,
    pub csrr1: u32,
    pub dsrr0: u64,
    pub dsrr1: u32,
    pub mcsrr0: u64,
    pub mcsrr1: u32,
    pub gsrr0: u64,
    pub gsrr1: u32,
    pub gesr: u32,
    pub gdear: u64,
    pub pid: u32,
    pub mas0: u32,
    pub mas1: u32,
    pub mas2: u64,
    pub mas3: u32,
    pub mas6: u32,
    pub mas7: u32,
}

impl Default for GcpuRegs {
    fn default() -> Self {
        GcpuRegs {
            ivpr: 0,
            ivor: [0; IVOR_COUNT],
            sprg: [0; 6],
            csrr0: 0,
            csrr1: 0,
            dsrr0: 0,
            dsrr1: 0,
            mcsrr0: 0,
            mcsrr1: 0,
            gsrr0: 0,
            gsrr1: 0,
            gesr: 0,
            gdear: 0,
            pid: 0,
            mas0: 0,
            mas1: 0,
            mas2: 0,
            mas3: 0,
            mas6: 0,
            mas7: 0,
        }
    }
}

/// One virtual CPU.
pub struct Gcpu {
    pub guest: Weak<Guest>,
    /// Logical vCPU number within the partition.
    pub gcpu_num: usize,
    /// Physical core this vCPU is pinned to; stable across restart.
    pub coreid: usize,

    /// Hypervisor-level events, drained by the doorbell handler.
    pub dbell_pending: AtomicU32,
    /// Guest events, drained on return to guest.
    pub gevent_pending: AtomicU32,
    /// Guest-visible doorbell causes.
    pub gdbell_pending: AtomicU32,
    /// Critical-class guest doorbell causes.
    pub crit_gdbell_pending: AtomicU32,
    /// Critical doorbell events.
    pub cdbell_pending: AtomicU32,
    /// Accumulated machine-check causes.
    pub mcsr: AtomicU32,
    pub mcar: AtomicU64,

    /// Guest timer control/status shadows (async writers: timer events).
    pub gtcr: AtomicU32,
    pub gtsr: AtomicU32,
    /// Saved TCR[WRC] across a watchdog-forced restart; folded into
    /// TSR[WRS] when the partition comes back so it sees the cause.
    pub watchdog_tsr: AtomicU32,
    /// Next watchdog expiry is final (ENW already set).
    pub watchdog_timeout: AtomicBool,

    pub napping: AtomicBool,
    pub waiting_for_gevent: AtomicBool,
    /// Timebase at the last FIT/watchdog evaluation on this vCPU.
    pub last_tb: AtomicU64,

    pub vpic: VpicCpu,
    pub regs: Mutex<GcpuRegs>,
    pub tlb1: Mutex<GuestTlb1>,
    /// Shadow of the pinned core's hardware TLB1 (1:1 pinning makes the
    /// core's TLB this vCPU's to manage).
    pub hw_tlb1: Mutex<HwTlb1>,

    /// Guest doorbell lines; raised by events, drained by the trap
    /// dispatcher when the guest can take the interrupt.
    pub gdbell_line: AtomicBool,
    pub crit_gdbell_line: AtomicBool,
    pub mchk_gdbell_line: AtomicBool,

    pub stats: [AtomicU32; NUM_GCPU_STATS],
}

impl Gcpu {
    pub fn new(guest: Weak<Guest>, gcpu_num: usize, coreid: usize) -> Self {
        Gcpu {
            guest,
            gcpu_num,
            coreid,
            dbell_pending: AtomicU32::new(0),
            gevent_pending: AtomicU32::new(0),
            gdbell_pending: AtomicU32::new(0),
            crit_gdbell_pending: AtomicU32::new(0),
            cdbell_pending: AtomicU32::new(0),
            mcsr: AtomicU32::new(0),
            mcar: AtomicU64::new(0),
            gtcr: AtomicU32::new(0),
            gtsr: AtomicU32::new(0),
            watchdog_tsr: AtomicU32::new(0),
            watchdog_timeout: AtomicBool::new(false),
            napping: AtomicBool::new(false),
            waiting_for_gevent: AtomicBool::new(false),
            last_tb: AtomicU64::new(0),
            vpic: VpicCpu::new(),
            regs: Mutex::new(GcpuRegs::default()),
            tlb1: Mutex::new(GuestTlb1::new()),
            hw_tlb1: Mutex::new(HwTlb1::default()),
            gdbell_line: AtomicBool::new(false),
            crit_gdbell_line: AtomicBool::new(false),
            mchk_gdbell_line: AtomicBool::new(false),
            stats: [const { AtomicU32::new(0) }; NUM_GCPU_STATS],
        }
    }

    #[inline]
    pub fn inc_stat(&self, stat: GcpuStat) {
        self.stats[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stat(&self, stat: GcpuStat) -> u32 {
        self.stats[stat as usize].load(Ordering::Relaxed)
    }

    /// Reset the fields derived from a partition run. Identity (pinning,
    /// vCPU number) is preserved across restart.
    pub fn reset(&self) {
        self.gdbell_pending.store(0, Ordering::Relaxed);
        self.crit_gdbell_pending.store(0, Ordering::Relaxed);
        self.cdbell_pending.store(0, Ordering::Relaxed);
        self.mcsr.store(0, Ordering::Relaxed);
        self.mcar.store(0, Ordering::Relaxed);
        self.gtcr.store(0, Ordering::Relaxed);

        // A watchdog-forced restart surfaces the reset cause in TSR[WRS].
        let wrs = self.watchdog_tsr.swap(0, Ordering::Relaxed);
        self.gtsr.store(wrs, Ordering::Relaxed);

        self.watchdog_timeout.store(false, Ordering::Relaxed);
        self.napping.store(false, Ordering::Relaxed);
        self.gdbell_line.store(false, Ordering::Relaxed);
        self.crit_gdbell_line.store(false, Ordering::Relaxed);
        self.mchk_gdbell_line.store(false, Ordering::Relaxed);
        self.vpic.reset();
        *self.regs.lock() = GcpuRegs::default();

        let mut tlb1 = self.tlb1.lock();
        *tlb1 = GuestTlb1::new();

        for s in &self.stats {
            s.store(0, Ordering::Relaxed);
        }
    }
}
