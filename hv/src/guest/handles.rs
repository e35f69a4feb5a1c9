//! Per-partition handle table.
//!
//! Guests name every hypervisor object they can operate on by a small
//! integer handle. Index 0 is reserved for the partition's own handle.
//! Allocation is monotonic until the table has been fully used once,
//! then first-free.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::drivers::pamu::PamuHandle;
use crate::errors::{Error, Result};
use crate::hv::DevOwner;
use crate::intr::vmpic::VmpicInterrupt;
use crate::ipc::byte_chan::BcEndpoint;
use crate::ipc::doorbell::Doorbell;

use super::Guest;

pub const MAX_HANDLES: usize = 1024;

/// Everything a guest handle can refer to.
pub enum Handle {
    /// The partition's own handle (index 0) or a managed partition.
    Partition(Weak<Guest>),
    VmpicInt(Arc<VmpicInterrupt>),
    ByteChan(Arc<BcEndpoint>),
    DbellSend(Arc<Doorbell>),
    DbellRecv(Arc<Doorbell>),
    Pamu(Arc<PamuHandle>),
    /// A stake in a claimable device.
    Dev(Arc<DevOwner>),
    /// Per-partition id handle (DMA stashing ids and the like).
    Ppid(u32),
}

impl Handle {
    pub fn as_partition(&self) -> Option<Arc<Guest>> {
        match self {
            Handle::Partition(g) => g.upgrade(),
            _ => None,
        }
    }

    pub fn as_vmpic(&self) -> Option<&Arc<VmpicInterrupt>> {
        match self {
            Handle::VmpicInt(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_byte_chan(&self) -> Option<&Arc<BcEndpoint>> {
        match self {
            Handle::ByteChan(bc) => Some(bc),
            _ => None,
        }
    }

    pub fn as_dbell_send(&self) -> Option<&Arc<Doorbell>> {
        match self {
            Handle::DbellSend(db) => Some(db),
            _ => None,
        }
    }

    pub fn as_pamu(&self) -> Option<&Arc<PamuHandle>> {
        match self {
            Handle::Pamu(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_dev(&self) -> Option<&Arc<DevOwner>> {
        match self {
            Handle::Dev(d) => Some(d),
            _ => None,
        }
    }
}

pub struct HandleTable {
    entries: Vec<Option<Handle>>,
    next: usize,
}

impl HandleTable {
    /// A fresh table with slot 0 bound to the owning partition.
    pub fn new(owner: Weak<Guest>) -> Self {
        let mut entries: Vec<Option<Handle>> = Vec::with_capacity(16);
        entries.push(Some(Handle::Partition(owner)));
        HandleTable { entries, next: 1 }
    }

    /// Allocate the next free handle.
    pub fn alloc(&mut self, handle: Handle) -> Result<usize> {
        if self.next < MAX_HANDLES {
            let idx = self.next;
            self.next += 1;
            if idx == self.entries.len() {
                self.entries.push(Some(handle));
            } else {
                self.entries[idx] = Some(handle);
            }
            return Ok(idx);
        }

        match self.entries.iter().position(|e| e.is_none()) {
            Some(idx) => {
                self.entries[idx] = Some(handle);
                Ok(idx)
            }
            None => Err(Error::NoMem),
        }
    }

    /// Install a handle at a fixed index (fast-doorbell global handles).
    pub fn set(&mut self, idx: usize, handle: Handle) -> Result<()> {
        if idx >= MAX_HANDLES {
            return Err(Error::Invalid);
        }
        while self.entries.len() <= idx {
            self.entries.push(None);
        }
        if self.entries[idx].is_some() {
            return Err(Error::Again);
        }
        self.entries[idx] = Some(handle);
        if self.next <= idx {
            self.next = idx + 1;
        }
        Ok(())
    }

    pub fn get(&self, idx: usize) -> Option<&Handle> {
        self.entries.get(idx)?.as_ref()
    }

    pub fn close(&mut self, idx: usize) {
        if idx != 0 {
            if let Some(e) = self.entries.get_mut(idx) {
                *e = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Handle)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| e.as_ref().map(|h| (i, h)))
    }
}
