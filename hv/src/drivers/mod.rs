//! SoC block drivers the core programs directly: reset control (GUTS),
//! the IOMMU (PAMU), and the NS16550 console UART.

pub mod guts;
pub mod ns16550;
pub mod pamu;

pub use guts::Guts;
pub use ns16550::Ns16550;
pub use pamu::Pamu;
