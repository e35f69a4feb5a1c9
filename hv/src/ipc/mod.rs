//! Inter-partition communication: bounded byte queues, byte channels,
//! and doorbells.

pub mod byte_chan;
pub mod doorbell;
pub mod queue;

pub use byte_chan::{BcEndpoint, ByteChan};
pub use doorbell::Doorbell;
pub use queue::Queue;
