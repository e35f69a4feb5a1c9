//! NS16550 UART character device.
//!
//! The console UART backs one byte-channel endpoint: the channel's rx
//! queue feeds the transmitter, received characters land in the
//! channel's tx queue. On silicon the pump routines run from the UART
//! interrupt; tests drive them directly.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::errors::Result;
use crate::ipc::byte_chan::CharDev;
use crate::ipc::queue::Queue;

/// Line status register bits.
pub const LSR_DR: u8 = 0x01;
pub const LSR_THRE: u8 = 0x20;

pub struct Ns16550 {
    /// Queue we transmit from (byte channel's device-side rx).
    tx_queue: Mutex<Option<Arc<Queue>>>,
    /// Queue we receive into (byte channel's device-side tx).
    rx_queue: Mutex<Option<Arc<Queue>>>,
    /// Bytes pushed out the wire; the register window on silicon.
    wire_out: Mutex<Vec<u8>>,
    lsr: Mutex<u8>,
}

impl Default for Ns16550 {
    fn default() -> Self {
        Self::new()
    }
}

impl Ns16550 {
    pub fn new() -> Self {
        Ns16550 {
            tx_queue: Mutex::new(None),
            rx_queue: Mutex::new(None),
            wire_out: Mutex::new(Vec::new()),
            lsr: Mutex::new(LSR_THRE),
        }
    }

    /// Transmit interrupt: drain pending bytes to the wire and wake the
    /// producer side of the channel.
    pub fn tx_pump(&self) {
        let q = self.tx_queue.lock().clone();
        let q = match q {
            Some(q) => q,
            None => return,
        };

        let mut buf = [0u8; 64];
        loop {
            let n = q.read(&mut buf, false);
            if n == 0 {
                break;
            }
            self.wire_out.lock().extend_from_slice(&buf[..n]);
            q.notify_producer();
        }
        *self.lsr.lock() |= LSR_THRE;
    }

    /// Receive interrupt: characters arrived on the wire.
    pub fn rx_inject(&self, data: &[u8]) {
        let q = self.rx_queue.lock().clone();
        if let Some(q) = q {
            q.write(data);
            *self.lsr.lock() |= LSR_DR;
            q.notify_consumer();
        }
    }

    pub fn lsr(&self) -> u8 {
        *self.lsr.lock()
    }

    /// Everything transmitted so far.
    pub fn wire_output(&self) -> Vec<u8> {
        self.wire_out.lock().clone()
    }
}

impl CharDev for Ns16550 {
    fn set_tx_queue(&self, q: Option<Arc<Queue>>) -> Result<()> {
        *self.tx_queue.lock() = q;
        Ok(())
    }

    fn set_rx_queue(&self, q: Option<Arc<Queue>>) -> Result<()> {
        *self.rx_queue.lock() = q;
        Ok(())
    }
}

lazy_static::lazy_static! {
    /// The boot console UART; the log sink writes here until a byte
    /// channel takes over.
    pub static ref CONSOLE: Ns16550 = Ns16550::new();
}

/// Log-sink adapter for the boot console.
pub fn console_sink(s: &str) {
    CONSOLE.wire_out.lock().extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::byte_chan::{attach_chardev, ByteChan};

    #[test]
    fn test_uart_backs_byte_channel() {
        let uart = Ns16550::new();
        let bc = ByteChan::new();
        attach_chardev(&bc, &uart).unwrap();
        let user = bc.claim().expect("user endpoint");

        // user -> uart wire
        user.tx.write(b"hello, wire");
        uart.tx_pump();
        assert_eq!(uart.wire_output(), b"hello, wire");

        // wire -> user
        uart.rx_inject(b"input");
        let mut buf = [0u8; 8];
        let n = user.rx.read(&mut buf, false);
        assert_eq!(&buf[..n], b"input");
        assert_ne!(uart.lsr() & LSR_DR, 0);
    }

    #[test]
    fn test_both_endpoints_claimed_fails_attach() {
        let uart = Ns16550::new();
        let bc = ByteChan::new();
        bc.claim();
        bc.claim();
        assert!(attach_chardev(&bc, &uart).is_err());
    }
}
