//! The bus protocol engine.
//!
//! One [`BusEngine::service`] call is one scheduler tick. A tick either runs a
//! complete command cycle
//!
//! ```text
//! Idle -> FrameAssert -> FrameRead -> FrameValidate -> Dispatch
//!      -> Ack|Nak -> device processing -> Complete|Error (device) -> Idle
//! ```
//!
//! or, with the command line idle, gives the active stream consumer one turn.
//! Asserting the command line always pre-empts a stream.
//!
//! Nothing that goes wrong inside a cycle is fatal: timeouts, bad checksums
//! and unroutable ids are reported as a [`CycleOutcome`] and the engine is
//! back in `Idle` for the next tick. Only [`BusEngine::setup`] can fail.

use crate::chain::{ChainError, DaisyChain, MAX_DEVICES};
use crate::config::{LinkConfig, ProtocolConfig, TimingConfig};
use crate::device::{BusRequest, Device, DeviceHandle, DeviceLink, LinkReport, LinkSnapshot, StreamTurn};
use crate::frame::{read_frame, validate, CommandFrame, Handshake};
use crate::link::{LinkNegotiator, LinkState, STANDARD_BAUD};
use crate::transport::{Line, LinkError, OutputLine, Transport, TransportKind};
use heapless::spsc::Queue;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const MAX_ROTATE_IDS: usize = 8;
// spsc::Queue keeps one slot free, so this holds 8 messages
const MESSAGE_QUEUE_DEPTH: usize = 9;

type DeviceList = heapless::Vec<DeviceHandle, MAX_DEVICES>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub link: LinkConfig,
    pub protocol: ProtocolConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport failed to start: {0}")]
    TransportInit(LinkError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("bus message queue is full")]
    MessageQueueFull,
    #[error("bus engine is not running")]
    NotRunning,
}

/// Application requests handled at the start of the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Disk swap across the listed ids, see [`DaisyChain::rotate_ids`].
    RotateDeviceIds(heapless::Vec<u8, MAX_ROTATE_IDS>),
    SelectTransport(TransportKind),
    Shutdown,
}

/// What one `service()` tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Stopped,
    Idle,
    Streamed { device_id: u8 },
    /// Frame read timed out or the command line never dropped; no handshake sent.
    Discarded(LinkError),
    ChecksumMismatch { failures: u32, toggled: bool },
    Unroutable { device_id: u8 },
    Dispatched { device_id: u8, terminal: Option<Handshake> },
    HighSpeedQuery { device_id: u8 },
    Broadcast { delivered: usize },
    PollReset { full: bool },
    HostReset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub frames: u32,
    pub checksum_failures: u32,
    pub timeouts: u32,
    pub acks: u32,
    pub naks: u32,
    pub broadcasts: u32,
    pub speed_toggles: u32,
    pub stream_turns: u32,
    pub unterminated_commands: u32,
    pub high_speed_queries: u32,
    pub host_resets: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub running: bool,
    pub shut_down: bool,
    pub config_boot: bool,
    pub poll_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub devices_shut_down: usize,
}

pub struct BusEngine<T: Transport> {
    transport: T,
    chain: DaisyChain,
    link: LinkNegotiator,
    config: EngineConfig,

    // At most one device owns the line outside the command cycle
    active_stream: Option<DeviceHandle>,
    motor_consumer: Option<DeviceHandle>,

    state: EngineState,
    stats: BusStats,
    messages: Queue<BusMessage, MESSAGE_QUEUE_DEPTH>,
    pending_persist: Option<i32>,
    cycle_acknowledged: bool,
}

impl<T: Transport> BusEngine<T> {
    pub fn new(transport: T, config: EngineConfig) -> Self {
        let link = LinkNegotiator::new(
            config.link.baud,
            config.link.high_speed_index,
            config.link.oscillator_hz,
            config.link.checksum_failure_threshold,
        );

        Self {
            transport,
            chain: DaisyChain::new(),
            link,
            config,
            active_stream: None,
            motor_consumer: None,
            state: EngineState::default(),
            stats: BusStats::default(),
            messages: Queue::new(),
            pending_persist: None,
            cycle_acknowledged: false,
        }
    }

    /// Open the transport. This is the only fatal error the bus reports.
    pub fn setup(&mut self) -> Result<(), EngineError> {
        let baud = self.link.baud();
        self.transport.begin(baud).map_err(EngineError::TransportInit)?;
        self.transport.discard_input();

        for line in [OutputLine::Interrupt, OutputLine::Proceed] {
            if let Err(e) = self.transport.set_output_line(line, false) {
                warn!("Could not release {:?} line: {}", line, e);
            }
        }

        self.state.running = true;
        self.state.shut_down = false;

        info!(
            "Bus ready on {:?} at {} baud, high speed index {} ({} baud), {} checksum",
            self.transport.kind(),
            baud,
            self.link.high_speed_index(),
            self.link.high_speed_baud(),
            self.config.link.checksum.name()
        );
        Ok(())
    }

    pub fn service(&mut self) -> CycleOutcome {
        if !self.state.running {
            return CycleOutcome::Stopped;
        }

        self.drain_messages();
        if !self.state.running {
            return CycleOutcome::Stopped;
        }

        if self.transport.take_host_reset() {
            self.reset_devices();
            self.stats.host_resets += 1;
            return CycleOutcome::HostReset;
        }

        self.service_motor();

        let command = self.transport.is_line_asserted(Line::Command);

        if let Some(stream) = self.active_stream.clone() {
            if !command {
                return self.stream_turn(&stream);
            }
            info!("Command asserted, pre-empting stream on 0x{:02X}", device_id(&stream));
            self.stop_stream();
        }

        // Interrupts are polled on every tick that is not a stream turn
        if command {
            let outcome = self.command_cycle();
            self.poll_interrupts();
            return outcome;
        }

        // Neither a command nor a stream: anything on the line is noise
        self.transport.discard_input();
        self.poll_interrupts();
        CycleOutcome::Idle
    }

    /// Orderly stop: every registered device gets `shutdown()` exactly once,
    /// in registration order. Further calls do nothing.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.state.shut_down {
            return ShutdownReport { devices_shut_down: 0 };
        }
        info!("Shutting down bus");

        if let Some(stream) = self.active_stream.take() {
            if let Ok(mut dev) = stream.try_borrow_mut() {
                dev.stream_stopped();
            }
        }

        let mut devices_shut_down = 0;
        for device in self.chain.iter() {
            match device.try_borrow_mut() {
                Ok(mut dev) => {
                    info!("Shutting down {} 0x{:02X}", dev.name(), dev.id());
                    dev.shutdown();
                    devices_shut_down += 1;
                }
                Err(_) => warn!("Device busy during shutdown, skipped"),
            }
        }
        info!("All devices shut down");

        self.transport.end();
        self.state.running = false;
        self.state.shut_down = true;

        ShutdownReport { devices_shut_down }
    }

    // Registry

    pub fn add_device(&mut self, device: DeviceHandle, id: u8) -> Result<(), EngineError> {
        self.chain.add(device, id)?;
        self.forget_unregistered();
        Ok(())
    }

    pub fn remove_device(&mut self, id: u8) -> Result<DeviceHandle, EngineError> {
        let device = self.chain.remove(id)?;
        self.forget_unregistered();
        Ok(device)
    }

    pub fn enable_device(&mut self, id: u8) -> Result<(), EngineError> {
        self.set_device_active(id, true)
    }

    pub fn disable_device(&mut self, id: u8) -> Result<(), EngineError> {
        self.set_device_active(id, false)
    }

    pub fn change_device_id(&mut self, from: u8, to: u8) -> Result<(), EngineError> {
        Ok(self.chain.change_id(from, to)?)
    }

    pub fn swap_device_ids(&mut self, a: u8, b: u8) -> Result<(), EngineError> {
        Ok(self.chain.swap_ids(a, b)?)
    }

    pub fn rotate_device_ids(&mut self, ids: &[u8]) -> usize {
        self.chain.rotate_ids(ids)
    }

    pub fn chain(&self) -> &DaisyChain {
        &self.chain
    }

    // Line ownership

    /// Hand the line to `device` outside the command cycle, or take it back.
    pub fn set_active_stream(&mut self, device: Option<DeviceHandle>) {
        match device {
            Some(device) => {
                if self.is_active_stream(&device) {
                    return;
                }
                self.stop_stream();
                info!("Stream consumer is now 0x{:02X}", device_id(&device));
                self.active_stream = Some(device);
            }
            None => self.stop_stream(),
        }
    }

    pub fn active_stream_id(&self) -> Option<u8> {
        self.active_stream.as_ref().map(device_id)
    }

    /// Device that streams while the motor line is asserted (cassette).
    pub fn set_motor_consumer(&mut self, device: Option<DeviceHandle>) {
        self.motor_consumer = device;
    }

    pub fn set_config_boot(&mut self, enabled: bool) {
        self.state.config_boot = enabled;
    }

    pub fn is_config_boot(&self) -> bool {
        self.state.config_boot
    }

    // Link

    pub fn get_baud(&self) -> u32 {
        self.link.baud()
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<(), LinkError> {
        if self.link.set_baud(baud) {
            self.transport.set_baud(baud)?;
        }
        Ok(())
    }

    pub fn toggle_speed(&mut self) -> u32 {
        let baud = self.link.toggle_speed();
        self.stats.speed_toggles += 1;
        self.push_baud(baud);
        baud
    }

    pub fn get_high_speed_index(&self) -> i32 {
        self.link.high_speed_index()
    }

    /// Returns the new high speed baud rate.
    pub fn set_high_speed_index(&mut self, index: i32) -> u32 {
        self.link.set_high_speed_index(index)
    }

    pub fn get_high_speed_baud(&self) -> u32 {
        self.link.high_speed_baud()
    }

    /// Run the link at `baud` beyond the POKEY divisor range. A physical
    /// transport also drives its clock output at that rate.
    pub fn set_ultra_high(&mut self, enabled: bool, baud: u32) -> Result<(), LinkError> {
        let physical = self.transport.kind() == TransportKind::Serial;

        if enabled {
            if physical {
                self.transport.set_clock_out(Some(baud))?;
            }
            self.link.set_ultra_high(Some(baud));
            info!("Ultra high speed enabled at {} baud", baud);
            self.set_baud(baud)
        } else {
            if physical {
                self.transport.set_clock_out(None)?;
            }
            self.link.set_ultra_high(None);
            info!("Ultra high speed disabled");
            self.set_baud(STANDARD_BAUD)
        }
    }

    pub fn get_link_state(&self) -> &LinkState {
        self.link.get_state()
    }

    /// High speed index a device asked to persist, if any since last call.
    pub fn take_persist_request(&mut self) -> Option<i32> {
        self.pending_persist.take()
    }

    // Application plumbing

    pub fn post_message(&mut self, message: BusMessage) -> Result<(), EngineError> {
        if self.state.shut_down {
            return Err(EngineError::NotRunning);
        }
        self.messages
            .enqueue(message)
            .map_err(|_| EngineError::MessageQueueFull)
    }

    pub fn get_state(&self) -> &EngineState {
        &self.state
    }

    pub fn get_stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // Command cycle

    fn command_cycle(&mut self) -> CycleOutcome {
        self.cycle_acknowledged = false;

        let frame = match read_frame(&mut self.transport, self.config.link.frame_timeout()) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("Command frame abandoned: {}", e);
                self.stats.timeouts += 1;
                self.transport.end_cycle(false);
                return CycleOutcome::Discarded(e);
            }
        };
        self.stats.frames += 1;
        debug!("CF: {}", frame);

        if let Err(e) = self.wait_for_deassert() {
            warn!("Command line stuck after frame {}", frame);
            self.transport.end_cycle(false);
            return CycleOutcome::Discarded(e);
        }

        let policy = self.config.link.checksum;
        if !validate(&frame, policy) {
            return self.reject_frame(&frame);
        }
        self.link.record_valid_frame();

        let outcome = self.dispatch(frame);
        self.transport.end_cycle(self.cycle_acknowledged);
        outcome
    }

    fn wait_for_deassert(&mut self) -> Result<(), LinkError> {
        let retries = self.config.link.deassert_retries;

        for _ in 0..retries {
            if !self.transport.is_line_asserted(Line::Command) {
                return Ok(());
            }
            self.transport.delay_us(self.config.link.deassert_poll_us);
        }

        if self.transport.is_line_asserted(Line::Command) {
            Err(LinkError::LineStuck { retries })
        } else {
            Ok(())
        }
    }

    // Bad checksum: stay silent so the host retries, and flip speed once
    // enough frames in a row were garbage.
    fn reject_frame(&mut self, frame: &CommandFrame) -> CycleOutcome {
        self.stats.checksum_failures += 1;
        let failures = self.link.consecutive_checksum_failures() + 1;
        let computed = self.config.link.checksum.checksum(&frame.data_bytes());
        warn!(
            "Checksum mismatch on {}: computed 0x{:02X} ({} in a row)",
            frame, computed, failures
        );

        let toggled = self.link.record_checksum_failure();
        if toggled {
            self.stats.speed_toggles += 1;
            let baud = self.link.baud();
            info!("Too many bad frames, link now at {} baud", baud);
            self.push_baud(baud);
        }

        self.transport.end_cycle(false);
        CycleOutcome::ChecksumMismatch { failures, toggled }
    }

    fn dispatch(&mut self, frame: CommandFrame) -> CycleOutcome {
        let protocol = self.config.protocol;
        if frame.device_id == protocol.broadcast_id {
            return self.broadcast(frame);
        }

        let device = if self.state.config_boot && frame.device_id == protocol.config_boot_id {
            self.config_boot_device().or_else(|| self.chain.get(frame.device_id))
        } else {
            self.chain.get(frame.device_id)
        };

        let device = match device {
            Some(device) if is_active(&device) => device,
            _ => {
                debug!("No active device 0x{:02X}, Nak", frame.device_id);
                self.send_handshake(Handshake::Nak);
                self.stats.naks += 1;
                return CycleOutcome::Unroutable {
                    device_id: frame.device_id,
                };
            }
        };

        if frame.command == protocol.high_speed_query {
            self.answer_high_speed_query();
            return CycleOutcome::HighSpeedQuery {
                device_id: frame.device_id,
            };
        }

        self.send_handshake(Handshake::Ack);
        self.stats.acks += 1;

        let command_data = frame.command_data();
        let terminal = self
            .invoke(&device, |dev, link| dev.process(link, command_data, frame.checksum))
            .and_then(|(_, report)| report.terminal);

        if terminal.is_none() {
            self.stats.unterminated_commands += 1;
            warn!(
                "Device 0x{:02X} returned from command 0x{:02X} without Complete/Error",
                frame.device_id, frame.command
            );
        }

        CycleOutcome::Dispatched {
            device_id: frame.device_id,
            terminal,
        }
    }

    fn broadcast(&mut self, frame: CommandFrame) -> CycleOutcome {
        let protocol = self.config.protocol;
        self.stats.broadcasts += 1;

        if frame.command == protocol.poll_command {
            let aux = (frame.aux1, frame.aux2);

            if aux == (protocol.null_poll_aux, protocol.null_poll_aux) {
                debug!("Null poll, counters cleared");
                self.state.poll_count = 0;
                return CycleOutcome::PollReset { full: false };
            }

            if aux == (protocol.reset_poll_aux, protocol.reset_poll_aux) {
                debug!("Reset poll, counters cleared and listeners reset");
                self.state.poll_count = 0;
                for device in self.chain.broadcast_listeners() {
                    if let Ok(mut dev) = device.try_borrow_mut() {
                        dev.reset();
                    }
                }
                return CycleOutcome::PollReset { full: true };
            }

            if aux == (0, 0) {
                self.state.poll_count = self.state.poll_count.saturating_add(1);
            }
        }

        let command_data = frame.command_data();
        let mut delivered = 0;
        for device in self.chain.broadcast_listeners() {
            if self
                .invoke(&device, |dev, link| dev.process(link, command_data, frame.checksum))
                .is_some()
            {
                delivered += 1;
            }
        }

        trace!("Broadcast 0x{:02X} delivered to {} devices", frame.command, delivered);
        CycleOutcome::Broadcast { delivered }
    }

    // Every device must answer the high speed query identically, so the
    // engine does it: Ack, then a one byte data frame holding the index.
    fn answer_high_speed_query(&mut self) {
        self.stats.high_speed_queries += 1;
        self.stats.acks += 1;
        // -1 (disabled) goes out as 0xFF
        let index = u8::try_from(self.link.high_speed_index()).unwrap_or(0xFF);
        debug!("High speed query, answering index {}", index);

        let snapshot = self.snapshot();
        let mut link = DeviceLink::new(
            &mut self.transport,
            self.config.link.checksum,
            snapshot,
            self.config.timing,
            self.config.link.frame_timeout(),
        );
        link.ack();
        link.bus_to_computer(&[index], false);
        self.cycle_acknowledged = true;
    }

    fn config_boot_device(&self) -> Option<DeviceHandle> {
        self.chain
            .iter()
            .find(|d| {
                d.try_borrow()
                    .map(|d| d.is_config_boot_device() && d.is_active())
                    .unwrap_or(false)
            })
            .cloned()
    }

    // Streams and idle work

    fn stream_turn(&mut self, stream: &DeviceHandle) -> CycleOutcome {
        let id = device_id(stream);
        self.stats.stream_turns += 1;

        let turn = self.invoke(stream, |dev, link| dev.service_stream(link));
        if matches!(turn, Some((StreamTurn::Finished, _))) && self.is_active_stream(stream) {
            debug!("Stream on 0x{:02X} finished", id);
            self.active_stream = None;
        }

        CycleOutcome::Streamed { device_id: id }
    }

    fn stop_stream(&mut self) {
        let Some(stream) = self.active_stream.take() else {
            return;
        };

        match stream.try_borrow_mut() {
            Ok(mut dev) => dev.stream_stopped(),
            Err(_) => warn!("Stream device busy, could not notify stop"),
        }

        let baud = self.link.baud();
        self.push_baud(baud);
    }

    fn service_motor(&mut self) {
        let Some(consumer) = self.motor_consumer.clone() else {
            return;
        };

        let motor = self.transport.is_line_asserted(Line::Motor);
        let streaming = self.is_active_stream(&consumer);

        if motor && !streaming && self.active_stream.is_none() {
            info!("Motor on, streaming to 0x{:02X}", device_id(&consumer));
            self.active_stream = Some(consumer);
        } else if !motor && streaming {
            info!("Motor off");
            self.stop_stream();
        }
    }

    fn poll_interrupts(&mut self) {
        let devices: DeviceList = self.chain.iter().filter(|d| is_active(d)).cloned().collect();
        for device in devices.iter() {
            self.invoke(device, |dev, link| dev.poll_interrupt(link));
        }
    }

    fn reset_devices(&mut self) {
        info!("Host requested reset of all devices");
        self.stop_stream();
        self.state.poll_count = 0;

        for device in self.chain.iter() {
            if let Ok(mut dev) = device.try_borrow_mut() {
                dev.reset();
            }
        }
    }

    fn drain_messages(&mut self) {
        while let Some(message) = self.messages.dequeue() {
            debug!("Bus message {:?}", message);
            match message {
                BusMessage::RotateDeviceIds(ids) => {
                    self.chain.rotate_ids(&ids);
                }
                BusMessage::SelectTransport(kind) => {
                    if let Err(e) = self.transport.select(kind) {
                        warn!("Could not switch transport to {:?}: {}", kind, e);
                    }
                }
                BusMessage::Shutdown => {
                    self.shutdown();
                }
            }
        }
    }

    // Device invocation

    /// Lend the transport to `device` for one call, then apply whatever the
    /// device asked of the bus. `None` if the device is already borrowed.
    fn invoke<R, F>(&mut self, device: &DeviceHandle, f: F) -> Option<(R, LinkReport)>
    where
        F: FnOnce(&mut dyn Device, &mut DeviceLink<'_>) -> R,
    {
        let snapshot = self.snapshot();
        let report;
        let result;
        let renamed;
        {
            let Ok(mut dev) = device.try_borrow_mut() else {
                warn!("Device re-entered during dispatch, skipped");
                return None;
            };
            let mut link = DeviceLink::new(
                &mut self.transport,
                self.config.link.checksum,
                snapshot,
                self.config.timing,
                self.config.link.frame_timeout(),
            );
            let id_before = dev.id();
            result = f(&mut *dev, &mut link);
            report = link.finish();
            renamed = (dev.id() != id_before).then(|| (id_before, dev.id()));
        }

        if let Some((from, to)) = renamed {
            info!("Device 0x{:02X} now answers as 0x{:02X}", from, to);
            if !self.chain.resolve_id_clash(device).is_empty() {
                self.forget_unregistered();
            }
        }

        if report.acknowledged {
            self.cycle_acknowledged = true;
        }
        self.apply_requests(device, &report);
        Some((result, report))
    }

    fn apply_requests(&mut self, device: &DeviceHandle, report: &LinkReport) {
        for request in report.requests.iter() {
            trace!("Applying {:?}", request);
            match *request {
                BusRequest::SetBaud(baud) => {
                    if let Err(e) = self.set_baud(baud) {
                        warn!("Baud change to {} failed: {}", baud, e);
                    }
                }
                BusRequest::ToggleSpeed => {
                    self.toggle_speed();
                }
                BusRequest::SetHighSpeedIndex { index, persist } => {
                    self.link.set_high_speed_index(index);
                    if persist {
                        self.pending_persist = Some(self.link.high_speed_index());
                    }
                }
                BusRequest::ClaimStream => self.set_active_stream(Some(Rc::clone(device))),
                BusRequest::ReleaseStream => {
                    if self.is_active_stream(device) {
                        debug!("Stream released by 0x{:02X}", device_id(device));
                        self.active_stream = None;
                    }
                }
                BusRequest::EndConfigBoot => {
                    info!("Config boot ended");
                    self.state.config_boot = false;
                }
                BusRequest::SetUltraHigh { enabled, baud } => {
                    if let Err(e) = self.set_ultra_high(enabled, baud) {
                        warn!("Ultra high speed change failed: {}", e);
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            baud: self.link.baud(),
            high_speed_index: self.link.high_speed_index(),
            high_speed_baud: self.link.high_speed_baud(),
            poll_count: self.state.poll_count,
            transport: self.transport.kind(),
        }
    }

    fn send_handshake(&mut self, code: Handshake) {
        trace!("-> {:?}", code);
        let result = self
            .transport
            .write(&[code.as_byte()])
            .and_then(|_| self.transport.flush());
        if let Err(e) = result {
            warn!("Failed to send {:?}: {}", code, e);
        }
        self.cycle_acknowledged = true;
    }

    fn push_baud(&mut self, baud: u32) {
        if let Err(e) = self.transport.set_baud(baud) {
            warn!("Transport rejected {} baud: {}", baud, e);
        }
    }

    fn set_device_active(&mut self, id: u8, active: bool) -> Result<(), EngineError> {
        let device = self.chain.get(id).ok_or(ChainError::UnknownDevice(id))?;
        let result = match device.try_borrow_mut() {
            Ok(mut dev) => {
                dev.set_active(active);
                Ok(())
            }
            Err(_) => Err(EngineError::NotRunning),
        };
        debug!("Device 0x{:02X} {}", id, if active { "enabled" } else { "disabled" });
        result
    }

    // Stream and motor roles only belong to devices still on the chain
    fn forget_unregistered(&mut self) {
        if self.active_stream.as_ref().map_or(false, |s| !self.chain.contains(s)) {
            self.active_stream = None;
        }
        if self.motor_consumer.as_ref().map_or(false, |m| !self.chain.contains(m)) {
            self.motor_consumer = None;
        }
    }

    fn is_active_stream(&self, device: &DeviceHandle) -> bool {
        self.active_stream
            .as_ref()
            .map_or(false, |s| same_device(s, device))
    }
}

fn device_id(device: &DeviceHandle) -> u8 {
    device.try_borrow().map(|d| d.id()).unwrap_or(0)
}

fn is_active(device: &DeviceHandle) -> bool {
    device.try_borrow().map(|d| d.is_active()).unwrap_or(false)
}

fn same_device(a: &DeviceHandle, b: &DeviceHandle) -> bool {
    std::ptr::eq(Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ())
}
