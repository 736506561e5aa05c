//! Bus-over-IP binding. Bytes and line changes arrive as NetSIO datagrams
//! from a hub; the engine sees the same [`Transport`] behavior it gets from a
//! UART, including garbled bytes when the two ends disagree on the baud rate.

use super::{Line, LinkError, OutputLine, Transport, TransportKind};
use crate::netsio::{Direction, NetSioMessage, SyncKind, MAX_BLOCK_LEN, MAX_DATAGRAM_LEN};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const INITIAL_CREDIT: u8 = 3;
const ALIVE_INTERVAL: Duration = Duration::from_millis(1000);
const ALIVE_EXPIRE: Duration = Duration::from_millis(5000);
const PING_WAIT: Duration = Duration::from_millis(50);
const CREDIT_WAIT: Duration = Duration::from_millis(500);
// Peer baud within this many percent of ours reads clean
const BAUD_TOLERANCE_PCT: u64 = 10;

pub struct NetSioTransport {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
    fifo: VecDeque<u8>,

    command: bool,
    // A whole command can arrive within one poll; the engine must still see it
    command_latched: bool,
    motor: bool,
    baud: u32,
    peer_baud: u32,
    sync_pending: Option<u8>,
    credit: u8,
    host_reset: bool,

    connected: bool,
    last_rx: Instant,
    last_alive_sent: Instant,
}

impl NetSioTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let now = Instant::now();
        Self {
            host: host.into(),
            port,
            socket: None,
            fifo: VecDeque::new(),
            command: false,
            command_latched: false,
            motor: false,
            baud: 0,
            peer_baud: 0,
            sync_pending: None,
            credit: INITIAL_CREDIT,
            host_reset: false,
            connected: false,
            last_rx: now,
            last_alive_sent: now,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn peer_baud(&self) -> u32 {
        self.peer_baud
    }

    /// Handle every datagram already waiting, then run keep-alive.
    pub fn poll(&mut self) {
        loop {
            match self.receive(Duration::ZERO) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    debug!("NetSIO receive failed: {}", e);
                    break;
                }
            }
        }
        self.keep_alive();
    }

    fn receive(&mut self, wait: Duration) -> Result<bool, LinkError> {
        let socket = self.socket.as_ref().ok_or(LinkError::NotConnected)?;
        let mut buf = [0u8; MAX_DATAGRAM_LEN];

        if wait.is_zero() {
            socket.set_nonblocking(true)?;
        } else {
            socket.set_nonblocking(false)?;
            socket.set_read_timeout(Some(wait))?;
        }

        let received = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return Ok(false),
            // Hub not listening yet; the next send will retry
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        self.handle_datagram(&buf[..received]);
        Ok(true)
    }

    fn handle_datagram(&mut self, bytes: &[u8]) {
        self.last_rx = Instant::now();
        if !self.connected {
            info!("NetSIO hub at {}:{} is talking", self.host, self.port);
            self.connected = true;
        }

        let message = match NetSioMessage::decode(bytes, Direction::HubToDevice) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping NetSIO datagram: {}", e);
                return;
            }
        };
        trace!("<- {:?}", message);

        match message {
            NetSioMessage::DataByte(b) => {
                let b = self.garble(b);
                self.fifo.push_back(b);
            }
            NetSioMessage::DataBlock { data, .. } => {
                for b in data {
                    let b = self.garble(b);
                    self.fifo.push_back(b);
                }
            }
            NetSioMessage::DataByteSync { byte, seq } => {
                let b = self.garble(byte);
                self.fifo.push_back(b);
                self.sync_pending = Some(seq);
            }
            NetSioMessage::CommandOn => {
                self.command = true;
                self.command_latched = true;
                self.fifo.clear();
                self.sync_pending = None;
            }
            NetSioMessage::CommandOff => self.command = false,
            NetSioMessage::CommandOffSync { seq } => {
                self.command = false;
                self.sync_pending = Some(seq);
            }
            NetSioMessage::MotorOn => self.motor = true,
            NetSioMessage::MotorOff => self.motor = false,
            NetSioMessage::SpeedChange(baud) => {
                debug!("Hub speed now {} baud", baud);
                self.peer_baud = baud;
            }
            NetSioMessage::PingRequest => self.send_raw(&NetSioMessage::PingResponse),
            NetSioMessage::AliveRequest => self.send_raw(&NetSioMessage::AliveResponse),
            NetSioMessage::CreditUpdate(credit) => self.credit = credit,
            NetSioMessage::ColdReset => {
                warn!("Hub requested cold reset");
                self.host_reset = true;
            }
            NetSioMessage::WarmReset => info!("Hub reports warm reset"),
            NetSioMessage::DeviceDisconnect => {
                info!("Hub disconnected us");
                self.connected = false;
            }
            _ => {}
        }
    }

    // A UART at the wrong rate reads garbage; reproduce that so the engine's
    // bad-frame counter drives speed negotiation over the tunnel too.
    fn garble(&self, b: u8) -> u8 {
        if self.peer_baud == 0 || self.baud == 0 {
            return b;
        }
        let ours = u64::from(self.baud);
        let peer = u64::from(self.peer_baud);
        let low = ours * (100 - BAUD_TOLERANCE_PCT) / 100;
        let high = ours * (100 + BAUD_TOLERANCE_PCT) / 100;

        if peer < low || peer > high {
            b ^ (self.peer_baud as u8) ^ (self.baud as u8)
        } else {
            b
        }
    }

    fn keep_alive(&mut self) {
        if self.socket.is_none() {
            return;
        }
        let silent = self.last_rx.elapsed();

        if self.connected && silent > ALIVE_EXPIRE {
            warn!("NetSIO hub silent for {:?}, connection lost", silent);
            self.connected = false;
        }

        if silent >= ALIVE_INTERVAL && self.last_alive_sent.elapsed() >= ALIVE_INTERVAL {
            self.last_alive_sent = Instant::now();
            if self.connected {
                self.send_raw(&NetSioMessage::AliveRequest);
            } else {
                self.send_raw(&NetSioMessage::DeviceConnect);
            }
        }
    }

    fn send(&mut self, message: &NetSioMessage) -> Result<(), LinkError> {
        if message.needs_credit() {
            self.wait_for_credit()?;
            self.credit -= 1;
        }
        self.transmit(message)
    }

    fn send_raw(&mut self, message: &NetSioMessage) {
        if let Err(e) = self.transmit(message) {
            debug!("NetSIO send of {:?} failed: {}", message, e);
        }
    }

    fn transmit(&mut self, message: &NetSioMessage) -> Result<(), LinkError> {
        let socket = self.socket.as_ref().ok_or(LinkError::NotConnected)?;
        trace!("-> {:?}", message);
        match socket.send(&message.encode()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_for_credit(&mut self) -> Result<(), LinkError> {
        if self.credit > 0 {
            return Ok(());
        }

        self.transmit(&NetSioMessage::CreditStatus(0))?;
        let deadline = Instant::now() + CREDIT_WAIT;
        while self.credit == 0 {
            let now = Instant::now();
            if now >= deadline {
                // Hub fell behind or went away; don't stall the bus on it
                warn!("No NetSIO credit after {:?}, sending anyway", CREDIT_WAIT);
                self.credit = 1;
                break;
            }
            self.receive(deadline - now)?;
        }
        Ok(())
    }
}

impl Transport for NetSioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NetSio
    }

    fn begin(&mut self, baud: u32) -> Result<(), LinkError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((self.host.as_str(), self.port))?;
        info!("NetSIO connecting to {}:{}", self.host, self.port);

        self.socket = Some(socket);
        self.baud = baud;
        self.peer_baud = baud;
        self.credit = INITIAL_CREDIT;
        self.fifo.clear();
        self.sync_pending = None;
        self.command_latched = false;

        for _ in 0..2 {
            self.transmit(&NetSioMessage::PingRequest)?;
            // A missing hub is not fatal; keep-alive reconnects later
            let _ = self.receive(PING_WAIT);
        }

        self.transmit(&NetSioMessage::DeviceConnect)?;
        self.transmit(&NetSioMessage::SpeedChange(baud))?;
        self.last_rx = Instant::now();
        self.last_alive_sent = self.last_rx;
        Ok(())
    }

    fn end(&mut self) {
        if self.socket.is_some() {
            self.send_raw(&NetSioMessage::DeviceDisconnect);
            info!("NetSIO disconnected from {}:{}", self.host, self.port);
        }
        self.socket = None;
        self.connected = false;
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut n = 0;

        loop {
            while n < buf.len() {
                match self.fifo.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }

            let now = Instant::now();
            if n == buf.len() || now >= deadline {
                return Ok(n);
            }
            self.receive(deadline - now)?;
        }
    }

    fn read_byte(&mut self) -> nb::Result<u8, LinkError> {
        if self.fifo.is_empty() {
            self.poll();
        }
        self.fifo.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        if buf.is_empty() {
            return Ok(0);
        }

        // The hub holds the host until it hears how the sync'd command went
        if buf.len() == 1 && matches!(buf[0], b'A' | b'N') {
            if let Some(seq) = self.sync_pending.take() {
                self.send(&NetSioMessage::SyncResponse {
                    seq,
                    kind: SyncKind::Ack,
                    ack: buf[0],
                    write_size: 0,
                })?;
                return Ok(1);
            }
        }

        for chunk in buf.chunks(MAX_BLOCK_LEN) {
            let message = NetSioMessage::data_block(chunk, None).map_err(|e| LinkError::Io(e.to_string()))?;
            self.send(&message)?;
        }
        Ok(buf.len())
    }

    fn available(&mut self) -> usize {
        self.poll();
        self.fifo.len()
    }

    fn is_line_asserted(&mut self, line: Line) -> bool {
        self.poll();
        match line {
            Line::Command => self.command || std::mem::take(&mut self.command_latched),
            Line::Motor => self.motor,
        }
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn discard_input(&mut self) {
        self.poll();
        self.fifo.clear();
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), LinkError> {
        self.baud = baud;
        if self.socket.is_some() {
            self.transmit(&NetSioMessage::SpeedChange(baud))?;
        }
        Ok(())
    }

    fn set_output_line(&mut self, line: OutputLine, asserted: bool) -> Result<(), LinkError> {
        let message = match (line, asserted) {
            (OutputLine::Interrupt, true) => NetSioMessage::InterruptOn,
            (OutputLine::Interrupt, false) => NetSioMessage::InterruptOff,
            (OutputLine::Proceed, true) => NetSioMessage::ProceedOn,
            (OutputLine::Proceed, false) => NetSioMessage::ProceedOff,
        };
        self.send(&message)
    }

    fn end_cycle(&mut self, _acknowledged: bool) {
        if let Some(seq) = self.sync_pending.take() {
            let empty = NetSioMessage::SyncResponse {
                seq,
                kind: SyncKind::Empty,
                ack: 0,
                write_size: 0,
            };
            if let Err(e) = self.send(&empty) {
                debug!("Empty sync failed: {}", e);
            }
        }
    }

    // No wire timing to honour; spend the time servicing the socket instead
    fn delay_us(&mut self, us: u32) {
        if self.socket.is_some() {
            let _ = self.receive(Duration::from_micros(u64::from(us)));
        }
    }

    fn take_host_reset(&mut self) -> bool {
        std::mem::take(&mut self.host_reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garble_only_outside_tolerance() {
        let mut transport = NetSioTransport::new("localhost", 9997);
        transport.baud = 19_200;
        transport.peer_baud = 20_000;
        assert_eq!(transport.garble(0x31), 0x31);

        transport.peer_baud = 67_431;
        assert_eq!(transport.garble(0x31), 0x31 ^ 0x67 ^ 0x00);
    }

    #[test]
    fn test_command_on_clears_fifo_and_sync() {
        let mut transport = NetSioTransport::new("localhost", 9997);
        transport.handle_datagram(&[crate::netsio::DATA_BYTE, 0x55]);
        transport.handle_datagram(&[crate::netsio::COMMAND_OFF_SYNC, 9]);
        assert_eq!(transport.sync_pending, Some(9));

        transport.handle_datagram(&[crate::netsio::COMMAND_ON]);
        assert!(transport.command);
        assert!(transport.fifo.is_empty());
        assert_eq!(transport.sync_pending, None);
    }

    #[test]
    fn test_command_seen_even_if_already_dropped() {
        let mut transport = NetSioTransport::new("localhost", 9997);
        transport.handle_datagram(&[crate::netsio::COMMAND_ON]);
        transport.handle_datagram(&[crate::netsio::DATA_BLOCK, 0x31, 0x53, 0x00, 0x00, 0x84, 0x01]);
        transport.handle_datagram(&[crate::netsio::COMMAND_OFF_SYNC, 1]);

        assert!(transport.is_line_asserted(Line::Command));
        assert_eq!(transport.fifo.len(), 5);
        assert!(!transport.is_line_asserted(Line::Command));
    }
}
