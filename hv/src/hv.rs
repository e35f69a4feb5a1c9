//! The hypervisor context: global state threaded through every
//! subsystem, and boot-time construction of the partition set from the
//! configuration tree.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::devtree::{DeviceTree, NodeId};
use crate::drivers::pamu::PamuHandle;
use crate::drivers::{Guts, Pamu};
use crate::errors::{Error, Result};
use crate::error::{ErrorDomain, ErrorPolicyTable, ErrorQueue, Policy};
use crate::guest::gcpu::Gcpu;
use crate::guest::handles::Handle;
use crate::guest::{self, Guest, GuestImage, GuestState, WdAction, MAX_PARTITIONS};
use crate::intr::vmpic::{self, VmpicInterrupt};
use crate::intr::Mpic;
use crate::ipc::byte_chan::{self, ByteChan};
use crate::ipc::doorbell::{self, Doorbell, MAX_FAST_DOORBELLS};
use crate::log::{LogLevel, LogType};
use crate::mem::PhysMem;
use crate::pm::Rcpm;
use crate::printlog;
use crate::tlb::cache::TLBC_MIN_IDX_BITS;
use crate::tlb::TlbCache;

use crate::arch::PteAttr;

pub const MAX_CORES: usize = 24;

/// Per-physical-core state the hypervisor tracks outside any guest.
pub struct PhysCore {
    pub coreid: usize,
    /// Hardware doorbell line toward this core.
    pub dbell_raised: AtomicBool,
    /// Return hook armed: drain gevents before re-entering the guest.
    pub ret_hook: AtomicBool,
    pub nap_request: AtomicBool,
}

impl PhysCore {
    fn new(coreid: usize) -> Self {
        PhysCore {
            coreid,
            dbell_raised: AtomicBool::new(false),
            ret_hook: AtomicBool::new(false),
            nap_request: AtomicBool::new(false),
        }
    }
}

// ── claimable devices ───────────────────────────────────────────────

/// A device whose ownership can move between partitions at run time.
pub struct ClaimableDev {
    pub name: String,
    active: Mutex<Weak<DevOwner>>,
}

/// One claim step, run in order during `claim_device`.
pub enum ClaimAction {
    /// Transfer the interrupt source to this owner's standby wrapper.
    Int { vmirq: Arc<VmpicInterrupt> },
    /// Re-point the DMA window at this owner's LIODN handle.
    Pamu { handle: Arc<PamuHandle> },
}

/// One partition's stake in a claimable device.
pub struct DevOwner {
    pub guest: Weak<Guest>,
    pub dev: Arc<ClaimableDev>,
    pub actions: Mutex<Vec<ClaimAction>>,
}

impl ClaimableDev {
    pub fn new(name: &str) -> Arc<ClaimableDev> {
        Arc::new(ClaimableDev { name: name.to_string(), active: Mutex::new(Weak::new()) })
    }

    pub fn active_owner(&self) -> Option<Arc<DevOwner>> {
        self.active.lock().upgrade()
    }

    pub fn set_active(&self, owner: &Arc<DevOwner>) {
        *self.active.lock() = Arc::downgrade(owner);
    }
}

/// Transfer a claimable device to `owner`. Exactly one concurrent
/// caller wins; the device lock serializes the whole transfer.
pub fn claim_device(owner: &Arc<DevOwner>) -> Result<()> {
    let dev = owner.dev.clone();
    let mut active = dev.active.lock();

    let prev = active.upgrade();
    if let Some(ref prev) = prev {
        if Arc::ptr_eq(prev, owner) {
            return Err(Error::InvalidState);
        }
        // The current owner must be stopped before its devices can be
        // claimed away.
        if let Some(prev_guest) = prev.guest.upgrade() {
            if prev_guest.state() != GuestState::Stopped {
                return Err(Error::InvalidState);
            }
        }
    }

    let my_actions = owner.actions.lock();
    for action in my_actions.iter() {
        match action {
            ClaimAction::Int { vmirq } => {
                let prev_vmirq = prev.as_ref().and_then(|p| {
                    p.actions.lock().iter().find_map(|a| match a {
                        ClaimAction::Int { vmirq } => Some(vmirq.clone()),
                        _ => None,
                    })
                });
                match prev_vmirq {
                    Some(prev_vmirq) => vmpic::claim_int(vmirq, &prev_vmirq)?,
                    None => {
                        vmirq.reset();
                        vmirq.set_claimed(true);
                    }
                }
            }
            ClaimAction::Pamu { handle } => {
                handle.enabled.store(true, Ordering::Release);
            }
        }
    }
    drop(my_actions);

    *active = Arc::downgrade(owner);
    Ok(())
}

// ── the context ─────────────────────────────────────────────────────

pub struct Hypervisor {
    pub config_tree: Mutex<DeviceTree>,
    pub hw_tree: Mutex<DeviceTree>,

    guests: Mutex<Vec<Arc<Guest>>>,
    cores: Vec<PhysCore>,

    pub mpic: Arc<Mpic>,
    pub tlbcache: TlbCache,
    pub phys_mem: PhysMem,
    pub guts: Guts,
    pub pamu: Pamu,
    pub rcpm: Rcpm,

    pub hv_queue: ErrorQueue,
    pub global_queue: ErrorQueue,
    error_manager: Mutex<Weak<Guest>>,
    pub error_policies: ErrorPolicyTable,

    /// Byte channels and doorbells declared in the config tree, keyed
    /// by their config node.
    byte_channels: Mutex<BTreeMap<usize, Arc<ByteChan>>>,
    doorbells: Mutex<BTreeMap<usize, Arc<Doorbell>>>,
    fast_doorbells: AtomicUsize,

    pub sync_nap_pending: AtomicBool,
    pub auto_sys_reset_on_stop: AtomicBool,
    pub guest_debug_disable: AtomicBool,
    pub guest_cache_lock_disable: AtomicBool,

    halted: AtomicBool,
}

impl Hypervisor {
    pub fn new(num_cores: usize) -> Arc<Hypervisor> {
        let num_cores = num_cores.min(MAX_CORES).max(1);
        Arc::new(Hypervisor {
            config_tree: Mutex::new(DeviceTree::new()),
            hw_tree: Mutex::new(DeviceTree::new()),
            guests: Mutex::new(Vec::new()),
            cores: (0..num_cores).map(PhysCore::new).collect(),
            mpic: Arc::new(Mpic::new(false)),
            tlbcache: TlbCache::new(TLBC_MIN_IDX_BITS),
            phys_mem: PhysMem::new(),
            guts: Guts::new(),
            pamu: Pamu::new(),
            rcpm: Rcpm::new(),
            hv_queue: ErrorQueue::new(),
            global_queue: ErrorQueue::new(),
            error_manager: Mutex::new(Weak::new()),
            error_policies: ErrorPolicyTable::new(),
            byte_channels: Mutex::new(BTreeMap::new()),
            doorbells: Mutex::new(BTreeMap::new()),
            fast_doorbells: AtomicUsize::new(0),
            sync_nap_pending: AtomicBool::new(false),
            auto_sys_reset_on_stop: AtomicBool::new(false),
            guest_debug_disable: AtomicBool::new(false),
            guest_cache_lock_disable: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        })
    }

    /// A context with a full complement of cores for subsystem tests.
    pub fn new_bare() -> Arc<Hypervisor> {
        Hypervisor::new(8)
    }

    pub fn core(&self, coreid: usize) -> &PhysCore {
        &self.cores[coreid]
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn register_guest(&self, guest: &Arc<Guest>) {
        self.guests.lock().push(guest.clone());
    }

    pub fn guests(&self) -> Vec<Arc<Guest>> {
        self.guests.lock().clone()
    }

    pub fn guest_by_name(&self, name: &str) -> Option<Arc<Guest>> {
        self.guests.lock().iter().find(|g| g.name == name).cloned()
    }

    pub fn guest_by_lpid(&self, lpid: u32) -> Option<Arc<Guest>> {
        self.guests.lock().iter().find(|g| g.lpid == lpid).cloned()
    }

    /// The vCPU pinned to the boot core, if any partition owns it.
    pub fn boot_gcpu(&self) -> Option<Arc<Gcpu>> {
        self.guests
            .lock()
            .iter()
            .flat_map(|g| g.gcpus.iter())
            .find(|c| c.coreid == 0)
            .cloned()
    }

    pub fn error_manager(&self) -> Option<Arc<Guest>> {
        self.error_manager.lock().upgrade()
    }

    pub fn set_error_manager(&self, guest: &Arc<Guest>) {
        *self.error_manager.lock() = Arc::downgrade(guest);
    }

    pub fn halt(&self) {
        printlog!(LogType::Misc, LogLevel::Always, "hypervisor halting");
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// If configured, the last partition to stop resets the system.
    pub fn maybe_system_reset_on_stop(&self) {
        if !self.auto_sys_reset_on_stop.load(Ordering::Acquire) {
            return;
        }
        let guests = self.guests.lock();
        if !guests.is_empty() && guests.iter().all(|g| g.state() == GuestState::Stopped) {
            self.guts.system_reset();
        }
    }

    /// Allocate one of the four hardware IPI-backed doorbells.
    pub fn alloc_fast_doorbell(self: &Arc<Self>) -> Result<Arc<Doorbell>> {
        let ipi = self.fast_doorbells.fetch_add(1, Ordering::AcqRel);
        if ipi >= MAX_FAST_DOORBELLS {
            self.fast_doorbells.fetch_sub(1, Ordering::AcqRel);
            printlog!(LogType::Doorbell, LogLevel::Error,
                      "cannot create more than {} fast doorbells", MAX_FAST_DOORBELLS);
            return Err(Error::Invalid);
        }
        Ok(Doorbell::new_fast(self.mpic.clone(), ipi))
    }

    pub fn doorbell_by_node(&self, node: NodeId) -> Option<Arc<Doorbell>> {
        self.doorbells.lock().get(&node.0).cloned()
    }

    // ── configuration-driven bring-up ───────────────────────────────

    /// Build the partition set from a configuration tree: doorbells
    /// and byte channels first, then partitions with their memory,
    /// vCPUs, IPC endpoints and device handles, then error policies.
    /// Partitions marked auto-start are started last.
    pub fn init_from_config(self: &Arc<Self>, config: DeviceTree) -> Result<()> {
        *self.config_tree.lock() = config;

        self.init_global_options();
        self.init_doorbells();
        self.init_byte_channels();
        self.init_error_policies();
        self.init_partitions()?;

        let autostart: Vec<Arc<Guest>> = self
            .guests()
            .into_iter()
            .filter(|g| g.auto_start)
            .collect();
        for g in autostart {
            if let Err(e) = guest::start_guest(&g, true) {
                printlog!(LogType::Partition, LogLevel::Error,
                          "auto-start of {} failed: {:?}", g.name, e);
            }
        }
        Ok(())
    }

    fn init_global_options(&self) {
        let config = self.config_tree.lock();
        let root = config.root();

        if config.get_prop(root, "sys-reset-on-partition-stop").is_some() {
            self.auto_sys_reset_on_stop.store(true, Ordering::Release);
        }
        if config.get_prop(root, "fsl,hv-guest-debug-disable").is_some() {
            self.guest_debug_disable.store(true, Ordering::Release);
        }
        if config.get_prop(root, "fsl,hv-guest-cache-lock-disable").is_some() {
            self.guest_cache_lock_disable.store(true, Ordering::Release);
        }
    }

    fn init_doorbells(self: &Arc<Self>) {
        let (normals, fasts) = {
            let config = self.config_tree.lock();
            (config.find_compatible("doorbell"), config.find_compatible("fast-doorbell"))
        };

        let mut doorbells = self.doorbells.lock();
        for node in normals {
            doorbells.insert(node.0, Doorbell::new_normal());
        }
        drop(doorbells);

        for node in fasts {
            match self.alloc_fast_doorbell() {
                Ok(db) => {
                    self.doorbells.lock().insert(node.0, db);
                }
                Err(_) => {}
            }
        }
    }

    fn init_byte_channels(&self) {
        let config = self.config_tree.lock();
        let mut channels = self.byte_channels.lock();

        for node in config.find_compatible("byte-channel") {
            if channels.contains_key(&node.0) {
                continue;
            }
            let bc = ByteChan::new();
            channels.insert(node.0, bc.clone());

            // a byte-channel endpoint shares the channel object
            if let Some(ep) = config.get_prop_u32(node, "endpoint") {
                if let Some(epnode) = config.lookup_phandle(ep) {
                    if config.is_compatible(epnode, "byte-channel") {
                        channels.insert(epnode.0, bc);
                    }
                }
            }
        }
    }

    fn init_error_policies(&self) {
        let config = self.config_tree.lock();
        for node in config.find_compatible("error-config") {
            for &sub in &config.node(node).children {
                let domain = config.get_prop_str(sub, "domain");
                let error = config.get_prop_str(sub, "error");
                let policy = config.get_prop_str(sub, "policy");

                match (
                    domain.and_then(ErrorDomain::from_str),
                    error,
                    policy.and_then(Policy::from_str),
                ) {
                    (Some(d), Some(e), Some(p)) => self.error_policies.set(d, e, p),
                    _ => {
                        printlog!(LogType::Errorq, LogLevel::Error,
                                  "bad error-config entry {}", config.name(sub));
                    }
                }
            }
        }
    }

    fn init_partitions(self: &Arc<Self>) -> Result<()> {
        let partitions = { self.config_tree.lock().find_compatible("partition") };
        let mut last_lpid = 0u32;

        for node in partitions {
            if self.guests.lock().len() >= MAX_PARTITIONS {
                printlog!(LogType::Partition, LogLevel::Error,
                          "too many partitions; ignoring extras");
                break;
            }

            last_lpid += 1;
            if let Err(e) = self.init_one_partition(node, last_lpid) {
                printlog!(LogType::Partition, LogLevel::Error,
                          "partition {} init failed: {:?}; skipping",
                          self.config_tree.lock().name(node), e);
            }
        }

        // second pass: manager relationships need every guest to exist
        let partitions = { self.config_tree.lock().find_compatible("partition") };
        for node in partitions {
            self.init_partition_managers(node);
        }
        Ok(())
    }

    fn init_one_partition(self: &Arc<Self>, node: NodeId, lpid: u32) -> Result<()> {
        let (name, coreids, wd_action, auto_start, is_err_mgr) = {
            let config = self.config_tree.lock();

            let name = config
                .get_prop_str(node, "label")
                .unwrap_or(config.name(node))
                .to_string();

            let cpus = config.get_prop(node, "cpus").ok_or(Error::BadTree)?;
            if cpus.len() % 8 != 0 || cpus.is_empty() {
                return Err(Error::BadTree);
            }
            let mut coreids = Vec::new();
            for pair in cpus.chunks(8) {
                let start = u32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]) as usize;
                let count = u32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]) as usize;
                for c in start..start + count {
                    if c >= self.cores.len() {
                        return Err(Error::BadTree);
                    }
                    coreids.push(c);
                }
            }

            let wd_action = config
                .get_prop_str(node, "watchdog-action")
                .and_then(WdAction::from_config)
                .unwrap_or(WdAction::Notify);
            let auto_start = config.get_prop(node, "auto-start").is_some();
            let is_err_mgr = config.get_prop(node, "error-manager").is_some();

            (name, coreids, wd_action, auto_start, is_err_mgr)
        };

        // cores may not be shared between partitions
        for g in self.guests().iter() {
            for gcpu in &g.gcpus {
                if coreids.contains(&gcpu.coreid) {
                    printlog!(LogType::Partition, LogLevel::Error,
                              "partition {}: core {} already owned by {}",
                              name, gcpu.coreid, g.name);
                    return Err(Error::BadTree);
                }
            }
        }

        let guest = Guest::new(
            Arc::downgrade(self),
            &name,
            lpid,
            Some(node),
            &coreids,
            wd_action,
            auto_start,
        );
        self.register_guest(&guest);

        if is_err_mgr {
            self.set_error_manager(&guest);
        }

        self.init_partition_memory(&guest, node)?;
        self.init_partition_images(&guest, node);
        self.init_partition_ipc(&guest, node)?;

        printlog!(LogType::Partition, LogLevel::Normal,
                  "partition {} (lpid {}) on cores {:?}", guest.name, guest.lpid, coreids);
        Ok(())
    }

    /// Map the partition's physical memory areas into its gphys table
    /// (and the reverse table).
    fn init_partition_memory(&self, guest: &Arc<Guest>, node: NodeId) -> Result<()> {
        let areas: Vec<(u64, u64, u64)> = {
            let config = self.config_tree.lock();
            let mut areas = Vec::new();

            let pma_refs = match config.get_prop(node, "phys-mem-area") {
                Some(p) => p.to_vec(),
                None => Vec::new(),
            };
            for chunk in pma_refs.chunks(4) {
                if chunk.len() != 4 {
                    return Err(Error::BadTree);
                }
                let phandle = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let pma = config.lookup_phandle(phandle).ok_or(Error::BadTree)?;

                let addr = read_u64_cells(&config, pma, "addr").ok_or(Error::BadTree)?;
                let size = read_u64_cells(&config, pma, "size").ok_or(Error::BadTree)?;
                let gaddr = read_u64_cells(&config, pma, "guest-addr").unwrap_or(0);

                if addr & 0xfff != 0 || size & 0xfff != 0 || size == 0 {
                    return Err(Error::BadTree);
                }
                areas.push((gaddr, addr, size));
            }
            areas
        };

        let attr = PteAttr::VALID
            | PteAttr::DMA
            | PteAttr::GS
            | PteAttr::M
            | PteAttr::SR
            | PteAttr::SW
            | PteAttr::SX
            | PteAttr::UR
            | PteAttr::UW
            | PteAttr::UX;

        let mut gphys = guest.gphys.lock();
        let mut rev = guest.gphys_rev.lock();
        for (gaddr, addr, size) in areas {
            let pages = size >> 12;
            gphys.map(gaddr >> 12, addr >> 12, pages, attr);
            rev.map(addr >> 12, gaddr >> 12, pages, attr);
        }
        Ok(())
    }

    /// Record image sources for (re)load at start.
    fn init_partition_images(&self, guest: &Arc<Guest>, node: NodeId) {
        let config = self.config_tree.lock();
        // guest-image = <phys-addr size guest-addr> (3 x u64 as 6 cells)
        if let Some(prop) = config.get_prop(node, "guest-image") {
            if prop.len() == 24 {
                let src = u64::from_be_bytes(prop[0..8].try_into().unwrap_or([0; 8]));
                let size = u64::from_be_bytes(prop[8..16].try_into().unwrap_or([0; 8]));
                let dest = u64::from_be_bytes(prop[16..24].try_into().unwrap_or([0; 8]));

                let mut data = alloc::vec![0u8; size as usize];
                self.phys_mem.read(src, &mut data);
                guest.images.lock().push(GuestImage { data: Arc::from(data), dest_gphys: dest });
            }
        }

        if let Some(dtb) = read_u64_cells(&config, node, "dtb-window") {
            guest.dtb_gphys.store(dtb, Ordering::Release);
        }
    }

    /// Wire the partition's declared IPC endpoints: byte channels and
    /// doorbell handles.
    fn init_partition_ipc(self: &Arc<Self>, guest: &Arc<Guest>, node: NodeId) -> Result<()> {
        struct Endpoint {
            name: String,
            kind: EndpointKind,
        }
        enum EndpointKind {
            ByteChan(usize),
            SendDbell(usize),
            RecvDbell(usize),
        }

        let endpoints: Vec<Endpoint> = {
            let config = self.config_tree.lock();
            let mut out = Vec::new();

            for &child in &config.node(node).children {
                let name = config.name(child).to_string();

                if config.is_compatible(child, "byte-channel") {
                    out.push(Endpoint { name, kind: EndpointKind::ByteChan(child.0) });
                } else if config.is_compatible(child, "send-doorbell")
                    || config.is_compatible(child, "receive-doorbell")
                {
                    let global = config
                        .get_prop_u32(child, "global-doorbell")
                        .and_then(|ph| config.lookup_phandle(ph));
                    let dbnode = match global {
                        Some(n) => n,
                        None => {
                            printlog!(LogType::Doorbell, LogLevel::Error,
                                      "{}: no global-doorbell", name);
                            continue;
                        }
                    };
                    if config.is_compatible(child, "send-doorbell") {
                        out.push(Endpoint { name, kind: EndpointKind::SendDbell(dbnode.0) });
                    } else {
                        out.push(Endpoint { name, kind: EndpointKind::RecvDbell(dbnode.0) });
                    }
                }
            }
            out
        };

        for ep in endpoints {
            match ep.kind {
                EndpointKind::ByteChan(bcnode) => {
                    let bc = self.byte_channels.lock().get(&bcnode).cloned();
                    if let Some(bc) = bc {
                        if let Err(e) = byte_chan::attach_guest(guest, &bc, &ep.name) {
                            printlog!(LogType::ByteChan, LogLevel::Error,
                                      "{}: byte channel attach failed: {:?}", ep.name, e);
                        }
                    }
                }
                EndpointKind::SendDbell(dbnode) => {
                    let db = self.doorbells.lock().get(&dbnode).cloned();
                    if let Some(db) = db {
                        let _ = doorbell::attach_send_doorbell(guest, &db, &ep.name);
                    }
                }
                EndpointKind::RecvDbell(dbnode) => {
                    let db = self.doorbells.lock().get(&dbnode).cloned();
                    if let Some(db) = db {
                        let _ = doorbell::attach_receive_doorbell(guest, &db, &ep.name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Second pass: wire manager relationships. A manager partition
    /// names its managed partitions; it receives their state-change and
    /// watchdog-expiration doorbells and a partition handle for each.
    fn init_partition_managers(self: &Arc<Self>, node: NodeId) {
        let (mgr_name, managed): (String, Vec<u32>) = {
            let config = self.config_tree.lock();
            let name = config
                .get_prop_str(node, "label")
                .unwrap_or(config.name(node))
                .to_string();
            let managed = match config.get_prop(node, "managed-partitions") {
                Some(p) => p
                    .chunks(4)
                    .filter(|c| c.len() == 4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                None => Vec::new(),
            };
            (name, managed)
        };

        if managed.is_empty() {
            return;
        }

        let manager = match self.guest_by_name(&mgr_name) {
            Some(g) => g,
            None => return,
        };

        for phandle in managed {
            let target_node = { self.config_tree.lock().lookup_phandle(phandle) };
            let target = target_node.and_then(|n| {
                self.guests.lock().iter().find(|g| g.partition_node == Some(n)).cloned()
            });
            let target = match target {
                Some(t) => t,
                None => {
                    printlog!(LogType::Partition, LogLevel::Error,
                              "{}: managed partition phandle {} not found", mgr_name, phandle);
                    continue;
                }
            };

            // partition handle, named in the manager's guest tree
            let ghandle = manager
                .handles
                .lock()
                .alloc(Handle::Partition(Arc::downgrade(&target)));
            if let Ok(ghandle) = ghandle {
                let mut gdt = manager.gdt.lock();
                let handles = manager.handles_node(&mut gdt);
                let gnode = gdt.add_node(handles, &target.name);
                gdt.set_prop_str(gnode, "compatible", "fsl,hv-partition-handle");
                gdt.set_prop_u32(gnode, "reg", ghandle as u32);
                gdt.set_prop_str(gnode, "label", &target.name);
            }

            // state-change and watchdog doorbells toward the manager
            let state_db = Doorbell::new_normal();
            let _ = doorbell::attach_receive_doorbell(&manager, &state_db, "state-change");
            *target.dbell_state_change.lock() = Some(state_db);

            let wd_db = Doorbell::new_normal();
            let _ = doorbell::attach_receive_doorbell(&manager, &wd_db, "watchdog-expiration");
            *target.dbell_watchdog_expiration.lock() = Some(wd_db);

            let restart_db = Doorbell::new_normal();
            let _ = doorbell::attach_receive_doorbell(&manager, &restart_db, "restart-request");
            *target.dbell_restart_request.lock() = Some(restart_db);
        }
    }
}

/// Two 32-bit cells forming a 64-bit value.
fn read_u64_cells(config: &DeviceTree, node: NodeId, name: &str) -> Option<u64> {
    let data = config.get_prop(node, name)?;
    if data.len() != 8 {
        return None;
    }
    Some(u64::from_be_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]))
}

/// Resolve a partition handle to a guest; handle 0 is the caller.
pub fn handle_to_guest(guest: &Arc<Guest>, handle: u64) -> Option<Arc<Guest>> {
    let handles = guest.handles.lock();
    handles.get(handle as usize)?.as_partition()
}
