//! Embedded hypervisor core for multi-core e500mc (Book-E) SoCs.
//!
//! Partitions a machine into isolated guest partitions, each running an
//! unmodified OS on virtual CPUs pinned 1:1 to physical cores. The
//! four core subsystems are partition lifecycle and the vCPU trap
//! loop, two-stage memory virtualization (guest-physical tables, TLB0
//! cache, TLB1 multiplexer), interrupt virtualization (vpic/vmpic over
//! the hardware PIC), and inter-partition communication (byte channels,
//! doorbells, error event queues).
//!
//! The boot core unflattens the configuration tree, builds the
//! partition set, and releases the secondaries into their vCPU loops;
//! everything after that is driven by traps and events.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod devtree;
pub mod drivers;
pub mod error;
pub mod errors;
pub mod events;
pub mod guest;
pub mod hcall;
pub mod hv;
pub mod intr;
pub mod ipc;
pub mod log;
pub mod mem;
pub mod pm;
pub mod shell;
pub mod timers;
pub mod tlb;
pub mod trap;

use alloc::sync::Arc;

pub use errors::{Error, Result};
pub use hv::Hypervisor;

/// Boot-core entry: parse the configuration tree and bring up the
/// partition set. The heap must already be initialized
/// (`mem::heap::init`).
pub fn init(num_cores: usize, config_fdt: &[u8]) -> Result<Arc<Hypervisor>> {
    log::set_sink(drivers::ns16550::console_sink);

    let config = devtree::DeviceTree::parse(config_fdt)?;
    let hypervisor = Hypervisor::new(num_cores);
    hypervisor.init_from_config(config)?;
    Ok(hypervisor)
}

#[cfg(test)]
mod scenario_tests {
    //! End-to-end scenarios across subsystems, driven through the
    //! public interfaces the way a running system would be.

    use super::*;
    use crate::arch::TrapFrame;
    use crate::devtree::DeviceTree;
    use crate::guest::{self, Guest, GuestState, WdAction};
    use crate::hcall;
    use crate::intr::vpic;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::Ordering;

    fn hcall(gcpu: &Arc<guest::gcpu::Gcpu>, num: u64, args: &[(usize, u64)]) -> TrapFrame {
        let mut regs = TrapFrame::default();
        regs.gpregs[3] = num;
        for &(r, v) in args {
            regs.gpregs[r] = v;
        }
        hcall::dispatch(gcpu, &mut regs);
        regs
    }

    /// Two partitions exchange data over a 4096-byte channel; the
    /// receiver then fills its own TX queue until EAGAIN and observes
    /// a full queue via poll.
    #[test]
    fn scenario_byte_channel_round_trip() {
        let mut config = DeviceTree::new();
        let root = config.root();

        for (i, name) in ["pma-a", "pma-b"].iter().enumerate() {
            let pma = config.add_node(root, name);
            config.set_prop_str(pma, "compatible", "phys-mem-area");
            config.set_prop(pma, "addr", &((0x1000_0000 + i as u64 * 0x10_0000).to_be_bytes()));
            config.set_prop(pma, "size", &0x10_0000u64.to_be_bytes());
            config.set_prop_u32(pma, "phandle", 10 + i as u32);
        }

        let pa = config.add_node(root, "part-a");
        config.set_prop_str(pa, "compatible", "partition");
        config.set_prop_cells(pa, "cpus", &[0, 1]);
        config.set_prop_cells(pa, "phys-mem-area", &[10]);
        let bca = config.add_node(pa, "bc@0");
        config.set_prop_str(bca, "compatible", "byte-channel");
        config.set_prop_u32(bca, "phandle", 40);
        config.set_prop_u32(bca, "endpoint", 41);

        let pb = config.add_node(root, "part-b");
        config.set_prop_str(pb, "compatible", "partition");
        config.set_prop_cells(pb, "cpus", &[1, 1]);
        config.set_prop_cells(pb, "phys-mem-area", &[11]);
        let bcb = config.add_node(pb, "bc@0");
        config.set_prop_str(bcb, "compatible", "byte-channel");
        config.set_prop_u32(bcb, "phandle", 41);
        config.set_prop_u32(bcb, "endpoint", 40);

        let hv = Hypervisor::new(8);
        hv.init_from_config(config).unwrap();

        let a = hv.guest_by_name("part-a").unwrap();
        let b = hv.guest_by_name("part-b").unwrap();
        guest::start_guest(&a, false).unwrap();
        guest::start_guest(&b, false).unwrap();

        let handle_of = |g: &Arc<Guest>| {
            let handles = g.handles.lock();
            let found = handles
                .iter()
                .find_map(|(i, h)| h.as_byte_chan().map(|_| i))
                .expect("byte channel handle");
            found
        };
        let ha = handle_of(&a) as u64;
        let hb = handle_of(&b) as u64;

        // B unmasks its receive interrupt, named by its guest tree
        let rx_handle = {
            let gdt = b.gdt.lock();
            let node = gdt.lookup("/hypervisor/handles/bc@0").unwrap();
            let prop = gdt.get_prop(node, "interrupts").unwrap();
            u32::from_be_bytes([prop[0], prop[1], prop[2], prop[3]]) as u64
        };
        let regs = hcall(&b.gcpus[0], hcall::HC_INT_SET_MASK, &[(4, rx_handle), (5, 0)]);
        assert_eq!(regs.gpregs[3], 0);

        // A sends 16 bytes
        let msg = b"byte-channel:-A!";
        let mut args: Vec<(usize, u64)> = alloc::vec![(4, ha), (5, 16)];
        for i in 0..4 {
            args.push((
                6 + i,
                u32::from_be_bytes([msg[i * 4], msg[i * 4 + 1], msg[i * 4 + 2], msg[i * 4 + 3]])
                    as u64,
            ));
        }
        let regs = hcall(&a.gcpus[0], hcall::HC_BYTE_CHANNEL_SEND, &args);
        assert_eq!(regs.gpregs[3], 0);

        // B's RX interrupt fired; B receives exactly those 16 bytes
        assert_ne!(b.gcpus[0].vpic.pending.load(Ordering::Relaxed), 0);
        let regs = hcall(&b.gcpus[0], hcall::HC_BYTE_CHANNEL_RECEIVE, &[(4, hb), (5, 16)]);
        assert_eq!(regs.gpregs[4], 16);
        let mut got = [0u8; 16];
        for i in 0..4 {
            got[i * 4..i * 4 + 4].copy_from_slice(&(regs.gpregs[6 + i] as u32).to_be_bytes());
        }
        assert_eq!(&got, msg);

        // B fills its TX queue until EAGAIN
        let mut sent = 0u64;
        loop {
            let regs = hcall(&b.gcpus[0], hcall::HC_BYTE_CHANNEL_SEND, &[(4, hb), (5, 16)]);
            if regs.gpregs[3] as u32 == Error::Again.status() {
                break;
            }
            assert_eq!(regs.gpregs[3], 0);
            sent += 16;
        }
        assert_eq!(sent, 4080);

        let regs = hcall(&b.gcpus[0], hcall::HC_BYTE_CHANNEL_POLL, &[(4, hb)]);
        let txavail = regs.gpregs[5];
        assert_eq!(txavail, 4095 - sent);
        assert!(txavail < 16);
    }

    /// A watchdog-action=stop partition times out; the manager's
    /// get_status reports it stopped with reason "watchdog".
    #[test]
    fn scenario_watchdog_partition_stop() {
        let hv = Hypervisor::new_bare();
        let manager = Guest::new_bare_with_hv(&hv, "manager", 1, &[0]);
        let target = Guest::new(
            Arc::downgrade(&hv),
            "wd-target",
            2,
            None,
            &[1],
            WdAction::Stop,
            false,
        );
        hv.register_guest(&target);

        guest::start_guest(&manager, false).unwrap();
        guest::start_guest(&target, false).unwrap();

        let th = manager
            .handles
            .lock()
            .alloc(guest::handles::Handle::Partition(Arc::downgrade(&target)))
            .unwrap() as u64;

        // guest arms a ~2^46-tick watchdog with a reset count
        let gcpu = &target.gcpus[0];
        timers::set_tcr(
            gcpu,
            (1 << crate::arch::TCR_WRC_SHIFT)
                | crate::arch::TCR_WIE
                | (1 << crate::arch::TCR_WP_SHIFT)
                | (4 << crate::arch::TCR_WPEXT_SHIFT),
        );

        // three period edges: arm, interrupt, final timeout. The bit
        // transitions 0 -> 1 as the timebase crosses each odd multiple
        // of the period.
        let period_bit = crate::arch::tcr_wd_bit(timers::get_tcr(gcpu));
        assert_eq!(63 - period_bit, 46);
        let step = 1u64 << 46;
        for i in 0..3u64 {
            timers::watchdog_tick(gcpu, 2 * i * step, (2 * i + 1) * step);
        }

        assert_eq!(target.state(), GuestState::Stopped);
        assert_eq!(
            target.hypervisor_strprop("fsl,hv-reason-stopped").as_deref(),
            Some("watchdog")
        );

        let regs = hcall(&manager.gcpus[0], hcall::HC_PARTITION_GET_STATUS, &[(4, th)]);
        assert_eq!(regs.gpregs[3], 0);
        assert_eq!(regs.gpregs[4], GuestState::Stopped as u64);
    }

    /// A DMA outside the guest's window: exactly one machine check to
    /// the guest and exactly one record to the error manager, both
    /// carrying the same capture registers.
    #[test]
    fn scenario_pamu_access_violation() {
        let hv = Hypervisor::new_bare();
        let guest = Guest::new_bare_with_hv(&hv, "dma-guest", 1, &[0]);
        let manager = Guest::new_bare_with_hv(&hv, "err-manager", 2, &[1]);
        hv.set_error_manager(&manager);
        guest::start_guest(&guest, false).unwrap();
        guest::start_guest(&manager, false).unwrap();

        // window covers 16 MiB at 0x1000_0000; destination 0x0e00_0000
        // is outside it
        hv.pamu.set_window(5, 0x1000_0000, 24, 0x8000_0000);
        assert!(!hv.pamu.check_access(5, 0x0e00_0000, 256));

        drivers::pamu::access_violation(&hv, &guest, 7, 0x0e00_0000, 0x8000_0001, 0x500);

        // guest: one machine-check-flagged record in its own queue
        let gcpu = &guest.gcpus[0];
        assert_ne!(gcpu.mcsr.load(Ordering::Relaxed) & crate::arch::MCSR_MCP, 0);
        assert_eq!(guest.error_queue.len(), 1);

        // manager: one critical interrupt and one global record
        assert_ne!(
            manager.gcpus[0].crit_gdbell_pending.load(Ordering::Relaxed)
                & guest::gcpu::GCPU_PEND_CRIT_INT,
            0
        );
        assert_eq!(hv.global_queue.len(), 1);

        let rec = hv.global_queue.get(None, true).unwrap();
        assert_eq!(rec.domain, error::ErrorDomain::Pamu);
        match rec.info {
            error::ErrorInfo::Pamu { av_addr, liodn_handle, lpid, .. } => {
                assert_eq!(av_addr, 0x0e00_0000);
                assert_eq!(liodn_handle, 7);
                assert_eq!(lpid, 1);
            }
            other => panic!("wrong capture: {:?}", other),
        }

        // the guest drains its queue through err_get_info once its
        // buffer is mapped
        guest.gphys.lock().map(
            0,
            0x2000,
            4,
            crate::arch::PteAttr::VALID
                | crate::arch::PteAttr::DMA
                | crate::arch::PteAttr::SR
                | crate::arch::PteAttr::SW,
        );
        let regs = hcall(
            gcpu,
            hcall::HC_ERR_GET_INFO,
            &[(4, 0), (5, 0x100), (6, error::ERROR_RECORD_BYTES as u64)],
        );
        assert_eq!(regs.gpregs[3], 0);
        // queue drained: the pending machine-check cause clears
        assert_eq!(gcpu.mcsr.load(Ordering::Relaxed) & crate::arch::MCSR_MCP, 0);

        let mut domain = [0u8; 4];
        hv.phys_mem.read((0x2000u64 << 12) | 0x100, &mut domain);
        assert_eq!(&domain, b"pamu");
    }

    /// 100 back-to-back doorbell rings deliver 100 acknowledged
    /// interrupts of the same vector through the full hypercall path.
    #[test]
    fn scenario_doorbell_delivery() {
        let hv = Hypervisor::new_bare();
        let sender = Guest::new_bare_with_hv(&hv, "send", 1, &[0]);
        let receiver = Guest::new_bare_with_hv(&hv, "recv", 2, &[1]);
        guest::start_guest(&sender, false).unwrap();
        guest::start_guest(&receiver, false).unwrap();

        let db = ipc::Doorbell::new_normal();
        ipc::doorbell::attach_receive_doorbell(&receiver, &db, "dbell@0").unwrap();
        let sh = ipc::doorbell::attach_send_doorbell(&sender, &db, "dbell@0").unwrap() as u64;

        // the receiver's tree names the vector it will see
        let expected_vector = {
            let gdt = receiver.gdt.lock();
            let node = gdt.lookup("/hypervisor/handles/dbell@0").unwrap();
            let prop = gdt.get_prop(node, "interrupts").unwrap();
            u32::from_be_bytes([prop[0], prop[1], prop[2], prop[3]]) as u64
        };

        // unmask via the interrupt hypercalls
        let regs = hcall(&receiver.gcpus[0], hcall::HC_INT_SET_MASK,
                         &[(4, expected_vector), (5, 0)]);
        assert_eq!(regs.gpregs[3], 0);

        for _ in 0..100 {
            let regs = hcall(&sender.gcpus[0], hcall::HC_PARTITION_SEND_DBELL, &[(4, sh)]);
            assert_eq!(regs.gpregs[3], 0);

            let regs = hcall(&receiver.gcpus[0], hcall::HC_INT_IACK, &[]);
            assert_eq!(regs.gpregs[3], 0);
            assert_eq!(regs.gpregs[4], expected_vector);

            let regs = hcall(&receiver.gcpus[0], hcall::HC_INT_EOI, &[(4, expected_vector)]);
            assert_eq!(regs.gpregs[3], 0);
        }

        // nothing left pending
        assert!(vpic::iack(&receiver, &receiver.gcpus[0]).is_none());
    }

    /// Odd vCPUs nap, even ones keep running; RCPM reflects the set.
    #[test]
    fn scenario_nap_wake() {
        let hv = Hypervisor::new_bare();
        let guest = Guest::new_bare_with_hv(&hv, "napper", 1, &[0, 1, 2, 3]);
        guest::start_guest(&guest, false).unwrap();

        for vcpu in [1usize, 3] {
            let regs = hcall(&guest.gcpus[vcpu], hcall::HC_PARTITION_ENTER_NAP,
                             &[(4, 0), (5, vcpu as u64)]);
            assert_eq!(regs.gpregs[3], 0);
        }

        for (vcpu, expect) in [(0, pm::FH_VCPU_RUN), (1, pm::FH_VCPU_NAP),
                               (2, pm::FH_VCPU_RUN), (3, pm::FH_VCPU_NAP)] {
            let regs = hcall(&guest.gcpus[0], hcall::HC_PARTITION_GET_CORE_STATE,
                             &[(4, 0), (5, vcpu as u64)]);
            assert_eq!(regs.gpregs[4] as u32, expect, "vcpu {}", vcpu);
        }
        assert_eq!(hv.rcpm.nap_mask(), 0b1010);

        let regs = hcall(&guest.gcpus[0], hcall::HC_PARTITION_EXIT_NAP, &[(4, 0), (5, 1)]);
        assert_eq!(regs.gpregs[3], 0);
        let regs = hcall(&guest.gcpus[0], hcall::HC_PARTITION_GET_CORE_STATE,
                         &[(4, 0), (5, 1)]);
        assert_eq!(regs.gpregs[4] as u32, pm::FH_VCPU_RUN);
    }

    /// Reset-on-stop: the last partition to stop pulls the system
    /// reset line through GUTS.
    #[test]
    fn scenario_reset_on_last_stop() {
        let hv = Hypervisor::new_bare();
        hv.auto_sys_reset_on_stop.store(true, Ordering::Release);

        let a = Guest::new_bare_with_hv(&hv, "a", 1, &[0]);
        let b = Guest::new_bare_with_hv(&hv, "b", 2, &[1]);
        guest::start_guest(&a, false).unwrap();
        guest::start_guest(&b, false).unwrap();

        guest::stop_guest(&a, "shutdown", "shell").unwrap();
        assert!(!hv.guts.reset_requested());

        guest::stop_guest(&b, "shutdown", "shell").unwrap();
        assert!(hv.guts.reset_requested());
    }
}
