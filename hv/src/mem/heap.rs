//! Boot-time heap.
//!
//! The hypervisor owns a fixed private region carved out by the boot
//! core before secondary cores are released; everything allocated with
//! `alloc` comes from here. Hosted test builds use the system allocator
//! instead.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the private memory region to the allocator. Called exactly once,
/// by the boot core, before any allocation.
///
/// # Safety
///
/// `start..start+size` must be unused, mapped, and exclusively owned by
/// the hypervisor.
#[cfg(not(test))]
pub unsafe fn init(start: *mut u8, size: usize) {
    ALLOCATOR.lock().init(start, size);
}

#[cfg(test)]
pub unsafe fn init(_start: *mut u8, _size: usize) {}
