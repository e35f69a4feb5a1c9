//! Hypervisor memory management: the boot heap and the guest-physical
//! translation tables.

pub mod gphys;
pub mod heap;
pub mod phys;

pub use gphys::{PageTable, Pte, Xlate};
pub use phys::PhysMem;
