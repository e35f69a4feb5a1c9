//! Partitions: the guest structure, its life cycle, and the generated
//! guest device tree.
//!
//! A partition is declared in the configuration tree at boot and keeps
//! its identity (name, LPID, pinned cores, handles, interrupt numbers)
//! for the life of the hypervisor. Start, stop and restart only rebuild
//! derived state: register shadows, TLB state, the stop-reason
//! properties in the guest tree.

pub mod emu;
pub mod gcpu;
pub mod guestmem;
pub mod handles;
pub mod loader;

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::devtree::{DeviceTree, NodeId};
use crate::errors::{Error, Result};
use crate::error::ErrorQueue;
use crate::events::{self, GEV_PAUSE, GEV_RESTART, GEV_RESUME, GEV_START, GEV_START_LOAD, GEV_STOP};
use crate::hv::Hypervisor;
use crate::intr::vmpic::IntSrc;
use crate::intr::Vpic;
use crate::ipc::Doorbell;
use crate::log::{LogLevel, LogType};
use crate::mem::PageTable;
use crate::printlog;

use gcpu::Gcpu;
use handles::{Handle, HandleTable};

pub const MAX_PARTITIONS: usize = 8;

/// Partition states, ordered per the get-status hypercall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestState {
    Stopped = 0,
    Running = 1,
    Starting = 2,
    Stopping = 3,
}

/// What the watchdog's final expiration does to the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WdAction {
    /// Ring the watchdog-expiration doorbell toward the managers.
    Notify,
    /// Stop the partition with reason "watchdog".
    Stop,
    /// Restart the partition, preserving TCR[WRC] into TSR[WRS].
    Reset,
}

impl WdAction {
    pub fn from_config(s: &str) -> Option<WdAction> {
        match s {
            "manager-notify" => Some(WdAction::Notify),
            "partition-stop" => Some(WdAction::Stop),
            "partition-reset" => Some(WdAction::Reset),
            _ => None,
        }
    }
}

/// An image to (re)load into guest memory on start.
pub struct GuestImage {
    pub data: Arc<[u8]>,
    pub dest_gphys: u64,
}

/// A virtualization-fault range: guest accesses to [start, end] are
/// routed to a device-emulation handler instead of faulting.
pub struct VfRange {
    pub start: u64,
    pub end: u64,
    pub handler: fn(&Arc<Guest>, &mut crate::arch::TrapFrame, u64),
}

pub struct Guest {
    pub hv: Weak<Hypervisor>,
    pub name: String,
    /// 6-bit logical partition id tagging this guest's translations.
    pub lpid: u32,
    /// Partition node in the configuration tree.
    pub partition_node: Option<NodeId>,

    state: Mutex<GuestState>,
    paused: AtomicBool,
    restarting: AtomicBool,
    pub active_cpus: AtomicU32,

    pub gphys: Mutex<PageTable>,
    pub gphys_rev: Mutex<PageTable>,
    pub gdt: Mutex<DeviceTree>,
    pub handles: Mutex<HandleTable>,
    pub gcpus: Vec<Arc<Gcpu>>,
    pub vpic: Vpic,

    /// Guest physical/virtual address of the OS entry point.
    pub entry: AtomicU64,
    /// Guest physical address of the generated DTB image.
    pub dtb_gphys: AtomicU64,

    /// Broadcast tlbivax shootdown state.
    pub tlbivax_addr: AtomicU64,
    pub tlbivax_count: AtomicU32,

    pub wd_action: WdAction,
    pub auto_start: bool,

    pub dbell_state_change: Mutex<Option<Arc<Doorbell>>>,
    pub dbell_watchdog_expiration: Mutex<Option<Arc<Doorbell>>>,
    pub dbell_restart_request: Mutex<Option<Arc<Doorbell>>>,

    /// Faults reported to this guest itself (machine-check doorbell).
    pub error_queue: ErrorQueue,

    pub images: Mutex<Vec<GuestImage>>,

    /// Emulated register windows (GUTS, PCIe config) for this guest.
    pub vf_ranges: Mutex<Vec<VfRange>>,
}

impl Guest {
    /// Build a partition skeleton: vCPUs pinned to `coreids`, empty
    /// translation tables, a fresh guest device tree.
    pub fn new(
        hv: Weak<Hypervisor>,
        name: &str,
        lpid: u32,
        partition_node: Option<NodeId>,
        coreids: &[usize],
        wd_action: WdAction,
        auto_start: bool,
    ) -> Arc<Guest> {
        let guest = Arc::new_cyclic(|weak: &Weak<Guest>| Guest {
            hv,
            name: name.to_string(),
            lpid: lpid & 0x3f,
            partition_node,
            state: Mutex::new(GuestState::Stopped),
            paused: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            active_cpus: AtomicU32::new(0),
            gphys: Mutex::new(PageTable::new()),
            gphys_rev: Mutex::new(PageTable::new()),
            gdt: Mutex::new(DeviceTree::new()),
            handles: Mutex::new(HandleTable::new(weak.clone())),
            gcpus: coreids
                .iter()
                .enumerate()
                .map(|(num, &core)| Arc::new(Gcpu::new(weak.clone(), num, core)))
                .collect(),
            vpic: Vpic::new(),
            entry: AtomicU64::new(0),
            dtb_gphys: AtomicU64::new(0),
            tlbivax_addr: AtomicU64::new(0),
            tlbivax_count: AtomicU32::new(0),
            wd_action,
            auto_start,
            dbell_state_change: Mutex::new(None),
            dbell_watchdog_expiration: Mutex::new(None),
            dbell_restart_request: Mutex::new(None),
            error_queue: ErrorQueue::new(),
            images: Mutex::new(Vec::new()),
            vf_ranges: Mutex::new(Vec::new()),
        });

        guest.init_gdt();
        guest
    }

    /// A minimal guest with no hypervisor context; used by subsystem
    /// unit tests.
    pub fn new_bare(name: &str, lpid: u32, coreids: &[usize]) -> Arc<Guest> {
        Guest::new(Weak::new(), name, lpid, None, coreids, WdAction::Notify, false)
    }

    /// A minimal guest registered with a hypervisor context.
    pub fn new_bare_with_hv(
        hv: &Arc<Hypervisor>,
        name: &str,
        lpid: u32,
        coreids: &[usize],
    ) -> Arc<Guest> {
        let guest = Guest::new(
            Arc::downgrade(hv),
            name,
            lpid,
            None,
            coreids,
            WdAction::Notify,
            false,
        );
        hv.register_guest(&guest);
        guest
    }

    pub fn state(&self) -> GuestState {
        *self.state.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Seed the guest device tree's /hypervisor node.
    fn init_gdt(&self) {
        let mut gdt = self.gdt.lock();
        let root = gdt.root();
        let hvnode = gdt.add_node(root, "hypervisor");
        gdt.set_prop(hvnode, "compatible", b"fsl,hv\0epapr,hypervisor-1\0");
        gdt.set_prop_str(hvnode, "fsl,hv-partition-label", &self.name);
        gdt.add_node(hvnode, "handles");
    }

    /// The /hypervisor/handles node of the guest tree.
    pub fn handles_node(&self, gdt: &mut DeviceTree) -> NodeId {
        let root = gdt.root();
        let hvnode = match gdt.subnode(root, "hypervisor") {
            Some(n) => n,
            None => gdt.add_node(root, "hypervisor"),
        };
        match gdt.subnode(hvnode, "handles") {
            Some(n) => n,
            None => gdt.add_node(hvnode, "handles"),
        }
    }

    /// Stamp a string property onto the /hypervisor node.
    pub fn set_hypervisor_strprop(&self, prop: &str, value: &str) {
        let mut gdt = self.gdt.lock();
        let root = gdt.root();
        if let Some(hvnode) = gdt.subnode(root, "hypervisor") {
            gdt.set_prop_str(hvnode, prop, value);
        }
    }

    pub fn hypervisor_strprop(&self, prop: &str) -> Option<String> {
        let gdt = self.gdt.lock();
        let hvnode = gdt.subnode(gdt.root(), "hypervisor")?;
        gdt.get_prop_str(hvnode, prop).map(|s| s.to_string())
    }

    /// Find the guest handle wrapping a given vpic interrupt.
    pub fn vmpic_handle_for_vpic(&self, irq: usize) -> Option<usize> {
        let handles = self.handles.lock();
        for (idx, h) in handles.iter() {
            if let Handle::VmpicInt(vmirq) = h {
                if let IntSrc::Vpic { irq: i, .. } = vmirq.irq {
                    if i == irq {
                        return Some(idx);
                    }
                }
            }
        }
        None
    }

    /// Mask every claimed vmpic interrupt, quiescing the hardware PIC
    /// before another owner claims the sources.
    fn deactivate_ints(&self) {
        let handles = self.handles.lock();
        for (_, h) in handles.iter() {
            if let Handle::VmpicInt(vmirq) = h {
                if vmirq.is_claimed() {
                    vmirq.irq.disable();
                }
            }
        }
    }

    /// Return every claimed vmpic interrupt to partition-boot state.
    fn reset_handles(&self) {
        let handles = self.handles.lock();
        for (_, h) in handles.iter() {
            if let Handle::VmpicInt(vmirq) = h {
                if vmirq.is_claimed() {
                    vmirq.reset();
                }
            }
        }
    }

    fn notify_state_change(&self) {
        let dbell = self.dbell_state_change.lock().clone();
        if let Some(db) = dbell {
            crate::ipc::doorbell::send_doorbells(&db);
        }
    }
}

// ── life cycle ──────────────────────────────────────────────────────

/// Start a stopped partition. With `load` set, the registered images
/// are (re)loaded into guest-physical memory by the boot vCPU.
pub fn start_guest(guest: &Arc<Guest>, load: bool) -> Result<()> {
    {
        let mut state = guest.state.lock();
        if *state != GuestState::Stopped {
            return Err(Error::InvalidState);
        }
        *state = GuestState::Starting;
    }

    printlog!(LogType::Partition, LogLevel::Normal, "starting guest {}", guest.name);

    guest.paused.store(false, Ordering::Release);
    for (i, gcpu) in guest.gcpus.iter().enumerate() {
        events::setgevent(gcpu, if i == 0 && load { GEV_START_LOAD } else { GEV_START });
    }

    events::drain_guest_gevents(guest);
    Ok(())
}

/// Stop a running partition: stamp the reason, broadcast the stop
/// event, and wait for every vCPU to come to rest.
pub fn stop_guest(guest: &Arc<Guest>, reason: &str, who: &str) -> Result<()> {
    {
        let mut state = guest.state.lock();
        match *state {
            GuestState::Running | GuestState::Starting => *state = GuestState::Stopping,
            _ => return Err(Error::InvalidState),
        }
    }

    printlog!(LogType::Partition, LogLevel::Normal,
              "stopping guest {}: {} by {}", guest.name, reason, who);

    guest.set_hypervisor_strprop("fsl,hv-reason-stopped", reason);
    guest.set_hypervisor_strprop("fsl,hv-stopped-by", who);

    for gcpu in &guest.gcpus {
        events::setgevent(gcpu, GEV_STOP);
    }

    events::drain_guest_gevents(guest);
    Ok(())
}

/// Restart: stop every vCPU, then reload and start again.
pub fn restart_guest(guest: &Arc<Guest>, reason: &str, who: &str) -> Result<()> {
    {
        let state = guest.state.lock();
        if *state != GuestState::Running {
            return Err(Error::InvalidState);
        }
    }

    guest.set_hypervisor_strprop("fsl,hv-reason-stopped", reason);
    guest.set_hypervisor_strprop("fsl,hv-stopped-by", who);
    guest.restarting.store(true, Ordering::Release);

    for gcpu in &guest.gcpus {
        events::setgevent(gcpu, GEV_RESTART);
    }
    events::drain_guest_gevents(guest);
    Ok(())
}

/// Temporarily suspend execution; vCPUs sit in wait_for_gevent.
pub fn pause_guest(guest: &Arc<Guest>) -> Result<()> {
    if guest.state() != GuestState::Running || guest.is_paused() {
        return Err(Error::InvalidState);
    }
    guest.paused.store(true, Ordering::Release);
    for gcpu in &guest.gcpus {
        events::setgevent(gcpu, GEV_PAUSE);
    }
    events::drain_guest_gevents(guest);
    Ok(())
}

pub fn resume_guest(guest: &Arc<Guest>) -> Result<()> {
    if !guest.is_paused() {
        return Err(Error::InvalidState);
    }
    for gcpu in &guest.gcpus {
        events::setgevent(gcpu, GEV_RESUME);
    }
    events::drain_guest_gevents(guest);
    guest.paused.store(false, Ordering::Release);
    Ok(())
}

// ── per-vCPU gevent handlers ────────────────────────────────────────

/// GEV_STOP: tear down this vCPU's run state; the last one out moves
/// the partition to Stopped.
pub fn stop_core(gcpu: &Arc<Gcpu>) {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return,
    };

    // Drop every TLB resource this vCPU holds.
    {
        let mut tlb1 = gcpu.tlb1.lock();
        let mut hw = gcpu.hw_tlb1.lock();
        for entry in 0..crate::arch::TLB1_GSIZE {
            tlb1.free_entry(&mut hw, entry);
        }
    }
    if let Some(hv) = guest.hv.upgrade() {
        hv.tlbcache.invalidate_lpid(guest.lpid);
    }

    gcpu.reset();

    if guest.active_cpus.fetch_sub(1, Ordering::AcqRel) == 1 {
        *guest.state.lock() = GuestState::Stopped;
        guest.deactivate_ints();
        guest.notify_state_change();

        printlog!(LogType::Partition, LogLevel::Normal, "guest {} stopped", guest.name);

        if let Some(hv) = guest.hv.upgrade() {
            hv.maybe_system_reset_on_stop();
        }
    }
}

/// GEV_START / GEV_START_LOAD: bring this vCPU up; the boot vCPU loads
/// images first, the last one in moves the partition to Running.
pub fn start_core(gcpu: &Arc<Gcpu>, load: bool) {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return,
    };

    // A failed image load on the boot vCPU aborts the whole start.
    if guest.state() != GuestState::Starting {
        return;
    }

    if gcpu.gcpu_num == 0 {
        guest.reset_handles();
        guest.vpic_cpu_reset();

        if load {
            if let Err(e) = loader::load_images(&guest) {
                printlog!(LogType::Partition, LogLevel::Error,
                          "guest {}: image load failed: {:?}", guest.name, e);
                *guest.state.lock() = GuestState::Stopped;
                return;
            }

            // place the generated device tree where the guest expects it
            let dtb = guest.dtb_gphys.load(Ordering::Acquire);
            if dtb != 0 {
                let blob = guest.gdt.lock().flatten();
                if let Err(e) = guestmem::copy_to_gphys(&guest, dtb, &blob) {
                    printlog!(LogType::Partition, LogLevel::Error,
                              "guest {}: device tree copy failed: {:?}", guest.name, e);
                }
            }
        }
    }

    if guest.active_cpus.fetch_add(1, Ordering::AcqRel) + 1 == guest.gcpus.len() as u32 {
        *guest.state.lock() = GuestState::Running;
        guest.notify_state_change();
        printlog!(LogType::Partition, LogLevel::Normal, "guest {} running", guest.name);
    }
}

/// GEV_RESTART: stop this core; whichever core completes the stop
/// re-enters load and start on the primary's behalf.
pub fn restart_core(gcpu: &Arc<Gcpu>) {
    let guest = match gcpu.guest.upgrade() {
        Some(g) => g,
        None => return,
    };

    {
        let mut state = guest.state.lock();
        if *state == GuestState::Running {
            *state = GuestState::Stopping;
        }
    }

    stop_core(gcpu);

    if guest.state() == GuestState::Stopped
        && guest.restarting.swap(false, Ordering::AcqRel)
    {
        let _ = start_guest(&guest, true);
    }
}

pub fn pause_core(gcpu: &Arc<Gcpu>) {
    gcpu.waiting_for_gevent.store(true, Ordering::Release);
}

pub fn resume_core(gcpu: &Arc<Gcpu>) {
    gcpu.waiting_for_gevent.store(false, Ordering::Release);
}

/// GEV_NMI: deliver a non-maskable interrupt to this vCPU as a
/// machine-check-class doorbell with MCSR[NMI].
pub fn deliver_nmi(gcpu: &Arc<Gcpu>) {
    gcpu.mcsr.fetch_or(crate::arch::MCSR_NMI, Ordering::AcqRel);
    events::raise_mchk_doorbell(gcpu);
}

impl Guest {
    fn vpic_cpu_reset(&self) {
        for gcpu in &self.gcpus {
            gcpu.vpic.reset();
        }
    }
}
