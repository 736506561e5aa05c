//! Byte-level link between the bus engine and the host computer.
//!
//! The engine only ever talks to a [`Transport`]. A physical binding drives a
//! UART plus the command/motor GPIO lines; the tunneled binding
//! ([`netsio::NetSioTransport`]) carries the same bytes and synthetic line
//! changes over UDP. [`TransportProxy`] lets the application switch between a
//! local and a tunneled binding at runtime without the engine noticing.

pub mod memory;
pub mod netsio;

pub use memory::MemoryTransport;
pub use netsio::NetSioTransport;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// UART/SPI driver with real line sensing and a clock output.
    Serial,
    /// Bus-over-IP: line state and data are synthesized from datagrams.
    NetSio,
}

/// Input lines sensed from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Command,
    Motor,
}

/// Output lines driven towards the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    Interrupt,
    Proceed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("timed out: expected {expected} bytes, received {received}")]
    Timeout { expected: usize, received: usize },

    #[error("checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("command line still asserted after {retries} retries")]
    LineStuck { retries: u32 },

    #[error("transport not connected")]
    NotConnected,

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("operation not supported by {0:?} transport")]
    Unsupported(TransportKind),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e.to_string())
    }
}

pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Open the link at `baud`. Failure here is the only fatal bus error.
    fn begin(&mut self, baud: u32) -> Result<(), LinkError>;

    fn end(&mut self);

    /// Read up to `buf.len()` bytes, waiting at most `timeout` in total.
    /// Returns the number of bytes actually read, which is short on timeout.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Non-blocking single byte read.
    fn read_byte(&mut self) -> nb::Result<u8, LinkError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError>;

    fn available(&mut self) -> usize;

    fn is_line_asserted(&mut self, line: Line) -> bool;

    fn flush(&mut self) -> Result<(), LinkError>;

    fn discard_input(&mut self);

    fn set_baud(&mut self, baud: u32) -> Result<(), LinkError>;

    fn set_output_line(&mut self, _line: OutputLine, _asserted: bool) -> Result<(), LinkError> {
        Ok(())
    }

    /// Drive the external clock pin at `hz`, or stop it with `None`.
    fn set_clock_out(&mut self, _hz: Option<u32>) -> Result<(), LinkError> {
        Err(LinkError::Unsupported(self.kind()))
    }

    /// Called once per command cycle after dispatch. `acknowledged` is false
    /// when no Ack/Nak was written, which lets a tunnel release its peer.
    fn end_cycle(&mut self, _acknowledged: bool) {}

    /// Inter-byte protocol delay. Tunneled bindings leave timing to the hub.
    fn delay_us(&mut self, us: u32) {
        if us > 0 {
            std::thread::sleep(Duration::from_micros(u64::from(us)));
        }
    }

    /// True once after the host asked for a cold reset of the peripherals.
    fn take_host_reset(&mut self) -> bool {
        false
    }

    /// Switch binding, for transports that carry more than one.
    fn select(&mut self, kind: TransportKind) -> Result<(), LinkError> {
        if kind == self.kind() {
            Ok(())
        } else {
            Err(LinkError::Unsupported(kind))
        }
    }
}

/// Holds a local and a tunneled binding and forwards to whichever is selected.
pub struct TransportProxy<L: Transport, N: Transport> {
    local: L,
    tunnel: N,
    selected: TransportKind,
    baud: u32,
}

impl<L: Transport, N: Transport> TransportProxy<L, N> {
    pub fn new(local: L, tunnel: N, selected: TransportKind) -> Self {
        Self {
            local,
            tunnel,
            selected,
            baud: 0,
        }
    }

    pub fn selected(&self) -> TransportKind {
        self.selected
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut L {
        &mut self.local
    }

    pub fn tunnel(&self) -> &N {
        &self.tunnel
    }

    pub fn tunnel_mut(&mut self) -> &mut N {
        &mut self.tunnel
    }

    fn active(&mut self) -> &mut dyn Transport {
        if self.selected == self.tunnel.kind() {
            &mut self.tunnel
        } else {
            &mut self.local
        }
    }
}

impl<L: Transport, N: Transport> Transport for TransportProxy<L, N> {
    fn kind(&self) -> TransportKind {
        self.selected
    }

    fn begin(&mut self, baud: u32) -> Result<(), LinkError> {
        self.baud = baud;
        self.active().begin(baud)
    }

    fn end(&mut self) {
        self.active().end();
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        self.active().read(buf, timeout)
    }

    fn read_byte(&mut self) -> nb::Result<u8, LinkError> {
        self.active().read_byte()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        self.active().write(buf)
    }

    fn available(&mut self) -> usize {
        self.active().available()
    }

    fn is_line_asserted(&mut self, line: Line) -> bool {
        self.active().is_line_asserted(line)
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        self.active().flush()
    }

    fn discard_input(&mut self) {
        self.active().discard_input();
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), LinkError> {
        self.baud = baud;
        self.active().set_baud(baud)
    }

    fn set_output_line(&mut self, line: OutputLine, asserted: bool) -> Result<(), LinkError> {
        self.active().set_output_line(line, asserted)
    }

    fn set_clock_out(&mut self, hz: Option<u32>) -> Result<(), LinkError> {
        self.active().set_clock_out(hz)
    }

    fn end_cycle(&mut self, acknowledged: bool) {
        self.active().end_cycle(acknowledged);
    }

    fn delay_us(&mut self, us: u32) {
        self.active().delay_us(us);
    }

    fn take_host_reset(&mut self) -> bool {
        self.active().take_host_reset()
    }

    fn select(&mut self, kind: TransportKind) -> Result<(), LinkError> {
        if kind == self.selected {
            return Ok(());
        }
        if kind != self.local.kind() && kind != self.tunnel.kind() {
            return Err(LinkError::Unsupported(kind));
        }

        // The tunnel must not be left connected to the hub while idle.
        if self.selected == self.tunnel.kind() {
            self.tunnel.end();
        }
        self.selected = kind;
        let baud = self.baud;
        tracing::info!("Transport switched to {:?} at {} baud", kind, baud);
        self.active().begin(baud)
    }
}
