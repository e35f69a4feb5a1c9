//! Byte channels: bidirectional bounded pipes between two endpoints.
//!
//! A channel is two queues and two endpoint handles, each claimable
//! exactly once. Endpoints bind to another guest, to a character device
//! (console UART), or to a byte-channel mux carrying several channels
//! over one downstream link.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::arch::TrapFrame;
use crate::errors::{Error, Result, EV_SUCCESS};
use crate::guest::handles::Handle;
use crate::guest::Guest;
use crate::intr::vmpic;
use crate::ipc::queue::{Notify, Queue};
use crate::log::{LogLevel, LogType};
use crate::printlog;
use core::sync::atomic::{AtomicBool, Ordering};

/// Queue size per direction; must be a power of two. Sized so a gdb
/// remote-protocol register write fits in one receive.
pub const BC_QUEUE_SIZE: usize = 4096;

/// One claimable end of a byte channel.
pub struct BcEndpoint {
    pub tx: Arc<Queue>,
    pub rx: Arc<Queue>,
    attached: AtomicBool,
}

impl BcEndpoint {
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

pub struct ByteChan {
    endpoints: [Arc<BcEndpoint>; 2],
}

impl ByteChan {
    pub fn new() -> Arc<ByteChan> {
        let q0 = Queue::new(BC_QUEUE_SIZE);
        let q1 = Queue::new(BC_QUEUE_SIZE);

        Arc::new(ByteChan {
            endpoints: [
                Arc::new(BcEndpoint {
                    tx: q0.clone(),
                    rx: q1.clone(),
                    attached: AtomicBool::new(false),
                }),
                Arc::new(BcEndpoint {
                    tx: q1,
                    rx: q0,
                    attached: AtomicBool::new(false),
                }),
            ],
        })
    }

    pub fn with_queue_size(size: usize) -> Arc<ByteChan> {
        let q0 = Queue::new(size);
        let q1 = Queue::new(size);
        Arc::new(ByteChan {
            endpoints: [
                Arc::new(BcEndpoint {
                    tx: q0.clone(),
                    rx: q1.clone(),
                    attached: AtomicBool::new(false),
                }),
                Arc::new(BcEndpoint {
                    tx: q1,
                    rx: q0,
                    attached: AtomicBool::new(false),
                }),
            ],
        })
    }

    /// Claim an unclaimed endpoint; each side can be claimed once.
    pub fn claim(&self) -> Option<Arc<BcEndpoint>> {
        for ep in &self.endpoints {
            if ep
                .attached
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ep.clone());
            }
        }
        None
    }
}

/// Character devices that can back a byte-channel endpoint.
pub trait CharDev: Send + Sync {
    /// Queue the device transmits from (the endpoint's rx).
    fn set_tx_queue(&self, q: Option<Arc<Queue>>) -> Result<()>;
    /// Queue the device receives into (the endpoint's tx).
    fn set_rx_queue(&self, q: Option<Arc<Queue>>) -> Result<()>;
}

/// Bind one end of `bc` to a character device.
pub fn attach_chardev(bc: &ByteChan, cd: &dyn CharDev) -> Result<Arc<BcEndpoint>> {
    let ep = bc.claim().ok_or(Error::Again)?;

    if let Err(e) = cd.set_tx_queue(Some(ep.rx.clone())) {
        ep.attached.store(false, Ordering::Release);
        return Err(e);
    }
    if let Err(e) = cd.set_rx_queue(Some(ep.tx.clone())) {
        let _ = cd.set_tx_queue(None);
        ep.attached.store(false, Ordering::Release);
        return Err(e);
    }

    Ok(ep)
}

/// Claim an endpoint for a guest: allocate rx/tx interrupts, wire them
/// as queue notify hooks, allocate the guest handle, and stamp the
/// guest device tree. Returns the handle.
pub fn attach_guest(guest: &Arc<Guest>, bc: &ByteChan, node_name: &str) -> Result<usize> {
    let ep = bc.claim().ok_or(Error::Again)?;

    let (rxirq, rxspec) = vmpic::alloc_vpic_handle(guest, 0)?;
    let (txirq, txspec) = vmpic::alloc_vpic_handle(guest, 0)?;

    let ghandle = guest.handles.lock().alloc(Handle::ByteChan(ep.clone()))?;

    if let vmpic::IntSrc::Vpic { irq, .. } = rxirq.irq {
        ep.rx.set_data_avail(Some(Notify::Vint { guest: Arc::downgrade(guest), irq }));
    }
    if let vmpic::IntSrc::Vpic { irq, .. } = txirq.irq {
        ep.tx.set_space_avail(Some(Notify::Vint { guest: Arc::downgrade(guest), irq }));
    }

    let intspec = [rxspec[0], rxspec[1], txspec[0], txspec[1]];
    {
        let mut gdt = guest.gdt.lock();
        let handles = guest.handles_node(&mut gdt);
        let gnode = match gdt.subnode(handles, node_name) {
            Some(n) => n,
            None => gdt.add_node(handles, node_name),
        };
        gdt.set_prop_str(gnode, "compatible", "epapr,hv-byte-channel");
        gdt.set_prop_u32(gnode, "reg", ghandle as u32);
        gdt.set_prop_u32(gnode, "hv-handle", ghandle as u32);
        gdt.set_prop_cells(gnode, "interrupts", &intspec);
    }

    Ok(ghandle)
}

// ── byte-channel mux ────────────────────────────────────────────────

pub const MAX_MUX_CHANNELS: u32 = 32;

/// Multiplexes several byte channels over one downstream endpoint using
/// a small tag/length framing.
pub struct BcMux {
    downstream: Arc<BcEndpoint>,
    channels: Mutex<BTreeMap<u32, Arc<BcEndpoint>>>,
}

impl BcMux {
    pub fn new(downstream: Arc<BcEndpoint>) -> Arc<BcMux> {
        Arc::new(BcMux { downstream, channels: Mutex::new(BTreeMap::new()) })
    }

    /// Attach `bc` as sub-channel `num`.
    pub fn add(&self, bc: &ByteChan, num: u32) -> Result<()> {
        if num >= MAX_MUX_CHANNELS {
            return Err(Error::Invalid);
        }
        let mut channels = self.channels.lock();
        if channels.contains_key(&num) {
            return Err(Error::Again);
        }
        let ep = bc.claim().ok_or(Error::Again)?;
        channels.insert(num, ep);
        Ok(())
    }

    /// Drain sub-channel tx queues into the downstream link, one frame
    /// per sub-channel per pump: `[0xb5, chan, len, payload...]`.
    pub fn pump_tx(&self) {
        let channels = self.channels.lock();
        for (&num, ep) in channels.iter() {
            let mut payload = [0u8; 64];
            let n = ep.rx.read(&mut payload, true);
            if n == 0 {
                continue;
            }
            if self.downstream.tx.space() < n + 3 {
                continue;
            }
            let hdr = [0xb5, num as u8, n as u8];
            self.downstream.tx.write(&hdr);
            self.downstream.tx.write(&payload[..n]);
            ep.rx.read(&mut payload[..n], false);
            ep.rx.notify_producer();
        }
        self.downstream.tx.notify_consumer();
    }

    /// Deliver one downstream frame to its sub-channel, if complete.
    pub fn pump_rx(&self) {
        let mut hdr = [0u8; 3];
        if self.downstream.rx.read(&mut hdr, true) < 3 || hdr[0] != 0xb5 {
            return;
        }
        let len = hdr[2] as usize;
        if self.downstream.rx.avail() < 3 + len {
            return;
        }

        let channels = self.channels.lock();
        let mut frame = [0u8; 67];
        self.downstream.rx.read(&mut frame[..3 + len], false);

        if let Some(ep) = channels.get(&(hdr[1] as u32)) {
            ep.tx.write(&frame[3..3 + len]);
            ep.tx.notify_consumer();
        }
    }
}

// ── hypercalls ──────────────────────────────────────────────────────

/// Bytes carried per send/receive hypercall in GPR6..GPR9.
pub const BC_HCALL_MAX: usize = 16;

fn lookup(guest: &Guest, handle: u64) -> Result<Arc<BcEndpoint>> {
    let handles = guest.handles.lock();
    let h = handles.get(handle as usize).ok_or(Error::Invalid)?;
    Ok(h.as_byte_chan().ok_or(Error::Invalid)?.clone())
}

/// Send from the register window. Whole-message: fails with EAGAIN if
/// the queue cannot take all `count` bytes.
pub fn hcall_send(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let count = regs.gpregs[5] as usize;

    let ep = match lookup(guest, handle) {
        Ok(ep) => ep,
        Err(e) => return regs.set_status(e.status()),
    };

    if count > BC_HCALL_MAX {
        return regs.set_status(Error::Invalid.status());
    }

    let mut buf = [0u8; BC_HCALL_MAX];
    for i in 0..count {
        let reg = regs.gpregs[6 + i / 4] as u32;
        buf[i] = reg.to_be_bytes()[i % 4];
    }

    if ep.tx.space() < count {
        return regs.set_status(Error::Again.status());
    }

    let sent = ep.tx.write(&buf[..count]);
    debug_assert_eq!(sent, count);
    ep.tx.notify_consumer();

    printlog!(LogType::ByteChan, LogLevel::Verbose, "bc send {} bytes", sent);
    regs.set_status(EV_SUCCESS);
}

/// Receive into the register window; returns up to `count` bytes and
/// the actual count in GPR4.
pub fn hcall_receive(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];
    let count = (regs.gpregs[5] as usize).min(BC_HCALL_MAX);

    let ep = match lookup(guest, handle) {
        Ok(ep) => ep,
        Err(e) => return regs.set_status(e.status()),
    };

    let mut buf = [0u8; BC_HCALL_MAX];
    let n = ep.rx.read(&mut buf[..count], false);
    if n > 0 {
        ep.rx.notify_producer();
    }

    regs.gpregs[4] = n as u64;
    for i in 0..4 {
        let word = u32::from_be_bytes([
            buf[i * 4],
            buf[i * 4 + 1],
            buf[i * 4 + 2],
            buf[i * 4 + 3],
        ]);
        regs.gpregs[6 + i] = word as u64;
    }
    regs.set_status(EV_SUCCESS);
}

/// Poll: RX bytes waiting in GPR4, TX space in GPR5.
pub fn hcall_poll(guest: &Arc<Guest>, regs: &mut TrapFrame) {
    let handle = regs.gpregs[4];

    let ep = match lookup(guest, handle) {
        Ok(ep) => ep,
        Err(e) => return regs.set_status(e.status()),
    };

    regs.gpregs[4] = ep.rx.avail() as u64;
    regs.gpregs[5] = ep.tx.space() as u64;
    regs.set_status(EV_SUCCESS);
}
