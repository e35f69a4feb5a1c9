//! TLB virtualization: the TLB1 multiplexer and the software TLB0 cache.

pub mod cache;
pub mod tlb1;

pub use cache::{TlbCache, TlbcEntry};
pub use tlb1::{GuestTlb1, HwTlb1, Tlb1Error};

/// Only one `tlbsync` may be outstanding on the coherence fabric; every
/// broadcast invalidation sequence holds this lock across it.
pub static TLBSYNC_LOCK: spin::Mutex<()> = spin::Mutex::new(());
