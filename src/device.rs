//! The contract every virtual peripheral implements, and the [`DeviceLink`]
//! through which a device talks back to the host while it handles a command.
//!
//! Devices never touch bus-owned state. Anything that changes the link (baud,
//! high speed index, stream ownership) is asked for with
//! [`DeviceLink::request`] and applied by the engine once `process()` returns.

use crate::checksum::ChecksumPolicy;
use crate::config::TimingConfig;
use crate::frame::Handshake;
use crate::transport::{LinkError, OutputLine, Transport, TransportKind};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::{trace, warn};

pub const MAX_BUS_REQUESTS: usize = 8;

/// Shared, non-owning handle the chain and the engine keep to a device.
pub type DeviceHandle = Rc<RefCell<dyn Device>>;

/// Wrap a concrete device into a [`DeviceHandle`].
pub fn handle<D: Device + 'static>(device: D) -> DeviceHandle {
    Rc::new(RefCell::new(device))
}

/// Changes to bus-owned state a device may ask for during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusRequest {
    SetBaud(u32),
    ToggleSpeed,
    /// `persist` asks the application to store the index in its config.
    SetHighSpeedIndex { index: i32, persist: bool },
    /// Make the requesting device the active stream consumer.
    ClaimStream,
    ReleaseStream,
    EndConfigBoot,
    SetUltraHigh { enabled: bool, baud: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTurn {
    Continue,
    /// The consumer is done; the engine drops it as the active stream.
    Finished,
}

/// Read-only view of the link published to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub baud: u32,
    pub high_speed_index: i32,
    pub high_speed_baud: u32,
    pub poll_count: u32,
    pub transport: TransportKind,
}

pub trait Device {
    fn id(&self) -> u8;
    fn set_id(&mut self, id: u8);

    fn is_active(&self) -> bool;
    fn set_active(&mut self, active: bool);

    /// Handle one command frame. The engine has already sent Ack.
    ///
    /// Before returning the device must have written exactly one terminal
    /// byte (Complete or Error) through `link`, unless it deliberately
    /// leaves the host to time out.
    fn process(&mut self, link: &mut DeviceLink<'_>, command_data: u32, checksum: u8);

    /// Answer a status command. Devices without a meaningful status report
    /// four zero bytes.
    fn status(&mut self, link: &mut DeviceLink<'_>) {
        link.bus_to_computer(&[0; 4], false);
    }

    /// Opt into Type-3 broadcast polls.
    fn listens_to_broadcast(&self) -> bool {
        false
    }

    fn is_config_boot_device(&self) -> bool {
        false
    }

    fn reset(&mut self) {}

    fn shutdown(&mut self) {}

    /// One bounded turn while this device owns the line as the active stream.
    fn service_stream(&mut self, _link: &mut DeviceLink<'_>) -> StreamTurn {
        StreamTurn::Finished
    }

    /// The stream was pre-empted by the command line or released.
    fn stream_stopped(&mut self) {}

    /// Called once per idle tick; network devices raise the interrupt line here.
    fn poll_interrupt(&mut self, _link: &mut DeviceLink<'_>) {}

    fn name(&self) -> &'static str {
        "device"
    }
}

/// What a device left behind after the engine handed it the link.
#[derive(Debug, Default)]
pub struct LinkReport {
    pub requests: Vec<BusRequest, MAX_BUS_REQUESTS>,
    pub terminal: Option<Handshake>,
    /// Ack or Nak written by the device itself.
    pub acknowledged: bool,
}

/// Borrowed access to the transport for the duration of one device call.
pub struct DeviceLink<'a> {
    transport: &'a mut dyn Transport,
    policy: ChecksumPolicy,
    snapshot: LinkSnapshot,
    timing: TimingConfig,
    io_timeout: Duration,
    report: LinkReport,
}

impl<'a> DeviceLink<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        policy: ChecksumPolicy,
        snapshot: LinkSnapshot,
        timing: TimingConfig,
        io_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            snapshot,
            timing,
            io_timeout,
            report: LinkReport::default(),
        }
    }

    pub fn state(&self) -> &LinkSnapshot {
        &self.snapshot
    }

    pub fn policy(&self) -> ChecksumPolicy {
        self.policy
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.snapshot.transport
    }

    pub fn terminal(&self) -> Option<Handshake> {
        self.report.terminal
    }

    pub fn ack(&mut self) {
        self.send_handshake(Handshake::Ack);
    }

    pub fn nak(&mut self) {
        self.send_handshake(Handshake::Nak);
    }

    pub fn complete(&mut self) {
        self.transport.delay_us(self.timing.t5_us);
        self.send_handshake(Handshake::Complete);
    }

    pub fn error(&mut self) {
        self.transport.delay_us(self.timing.t5_us);
        self.send_handshake(Handshake::Error);
    }

    /// Send a data frame to the host: `C` (or `E` when `err`), the data,
    /// then its checksum.
    pub fn bus_to_computer(&mut self, data: &[u8], err: bool) {
        self.transport.delay_us(self.timing.t5_us);
        self.send_handshake(if err { Handshake::Error } else { Handshake::Complete });

        let checksum = self.policy.checksum(data);
        if let Err(e) = self.write_all(data).and_then(|_| self.write_all(&[checksum])) {
            warn!("Data frame to host failed: {}", e);
        }
        if let Err(e) = self.transport.flush() {
            warn!("Flush failed: {}", e);
        }
    }

    /// Receive a data frame from the host into `buf`. Answers Ack when the
    /// trailing checksum matches and Nak otherwise.
    pub fn bus_to_peripheral(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        let received = self.transport.read(buf, self.io_timeout)?;
        if received != buf.len() {
            return Err(LinkError::Timeout {
                expected: buf.len() + 1,
                received,
            });
        }

        let mut trailer = [0u8; 1];
        if self.transport.read(&mut trailer, self.io_timeout)? != 1 {
            return Err(LinkError::Timeout {
                expected: buf.len() + 1,
                received: buf.len(),
            });
        }

        let computed = self.policy.checksum(buf);
        self.transport.delay_us(self.timing.t4_us);

        if computed != trailer[0] {
            self.nak();
            return Err(LinkError::ChecksumMismatch {
                computed,
                received: trailer[0],
            });
        }

        self.ack();
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        self.transport.read(buf, timeout)
    }

    pub fn read_byte(&mut self) -> nb::Result<u8, LinkError> {
        self.transport.read_byte()
    }

    pub fn available(&mut self) -> usize {
        self.transport.available()
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        self.transport.write(buf)
    }

    pub fn flush(&mut self) -> Result<(), LinkError> {
        self.transport.flush()
    }

    pub fn set_interrupt(&mut self, asserted: bool) -> Result<(), LinkError> {
        self.transport.set_output_line(OutputLine::Interrupt, asserted)
    }

    pub fn set_proceed(&mut self, asserted: bool) -> Result<(), LinkError> {
        self.transport.set_output_line(OutputLine::Proceed, asserted)
    }

    pub fn request(&mut self, request: BusRequest) {
        if self.report.requests.push(request).is_err() {
            warn!("Bus request queue full, dropping {:?}", request);
        }
    }

    pub fn finish(self) -> LinkReport {
        self.report
    }

    fn send_handshake(&mut self, code: Handshake) {
        trace!("-> {:?}", code);
        if let Err(e) = self.write_all(&[code.as_byte()]) {
            warn!("Failed to send {:?}: {}", code, e);
            return;
        }
        if let Err(e) = self.transport.flush() {
            warn!("Flush failed: {}", e);
        }

        if code.is_terminal() {
            self.report.terminal = Some(code);
        } else {
            self.report.acknowledged = true;
        }
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), LinkError> {
        while !buf.is_empty() {
            let written = self.transport.write(buf)?;
            if written == 0 {
                return Err(LinkError::Io("transport accepted no bytes".into()));
            }
            buf = &buf[written..];
        }
        Ok(())
    }
}
