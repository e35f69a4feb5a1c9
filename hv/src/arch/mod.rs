//! PowerPC Book-E (e500mc) architecture definitions.
//!
//! Register encodings in this module are bit-exact with the Book-E
//! architecture and the e500mc core reference; nothing here is
//! re-abstracted. Higher layers consume these constants directly.

pub mod booke;
pub mod trapframe;

pub use booke::*;
pub use trapframe::{Exception, TrapFrame, IVOR_COUNT};
