//! Interrupt virtualization: the hardware PIC model, the per-guest
//! virtual PIC, and the vmpic handle layer over both.

pub mod mpic;
pub mod vmpic;
pub mod vpic;

pub use mpic::Mpic;
pub use vmpic::{IntSrc, VmpicInterrupt};
pub use vpic::Vpic;
