//! Scripted transport. The caller plays the host: it queues command frames
//! and data, moves the motor line and reads back everything the bus wrote.

use super::{Line, LinkError, OutputLine, Transport, TransportKind};
use crate::frame::{CommandFrame, FRAME_LEN};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug)]
pub struct MemoryTransport {
    kind: TransportKind,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    consumed: usize,
    // Command line drops once `consumed` reaches this mark
    command_until: Option<usize>,
    command_stuck: bool,
    motor: bool,
    baud: u32,
    baud_history: Vec<u32>,
    clock_out: Option<u32>,
    output_lines: Vec<(OutputLine, bool)>,
    end_cycles: Vec<bool>,
    host_reset: bool,
    fail_begin: bool,
    begun: bool,
    ended: bool,
    delayed_us: u64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Serial)
    }

    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            rx: VecDeque::new(),
            tx: Vec::new(),
            consumed: 0,
            command_until: None,
            command_stuck: false,
            motor: false,
            baud: 0,
            baud_history: Vec::new(),
            clock_out: None,
            output_lines: Vec::new(),
            end_cycles: Vec::new(),
            host_reset: false,
            fail_begin: false,
            begun: false,
            ended: false,
            delayed_us: 0,
        }
    }

    /// `begin()` will fail, as an absent UART or unreachable hub would.
    pub fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    /// Assert the command line and queue a frame behind it.
    pub fn host_send_command(&mut self, frame: &CommandFrame) {
        self.host_send_command_bytes(&frame.to_bytes());
    }

    /// Same as [`host_send_command`](Self::host_send_command) for raw, possibly
    /// short or corrupted, frame bytes.
    pub fn host_send_command_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= FRAME_LEN);
        self.rx.extend(bytes.iter().copied());
        self.command_until = Some(self.consumed + self.rx.len());
    }

    /// Queue bytes with the command line left alone.
    pub fn host_send(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn set_motor(&mut self, on: bool) {
        self.motor = on;
    }

    /// Keep the command line asserted regardless of bytes read.
    pub fn stick_command_line(&mut self, stuck: bool) {
        self.command_stuck = stuck;
    }

    pub fn trigger_host_reset(&mut self) {
        self.host_reset = true;
    }

    /// Everything written since the last call.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    pub fn pending_input(&self) -> usize {
        self.rx.len()
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn baud_history(&self) -> &[u32] {
        &self.baud_history
    }

    pub fn clock_out(&self) -> Option<u32> {
        self.clock_out
    }

    pub fn output_lines(&self) -> &[(OutputLine, bool)] {
        &self.output_lines
    }

    /// One entry per command cycle: whether the cycle was acknowledged.
    pub fn end_cycles(&self) -> &[bool] {
        &self.end_cycles
    }

    pub fn is_begun(&self) -> bool {
        self.begun
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn delayed_us(&self) -> u64 {
        self.delayed_us
    }

    fn pop(&mut self) -> Option<u8> {
        let byte = self.rx.pop_front()?;
        self.consumed += 1;
        Some(byte)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn begin(&mut self, baud: u32) -> Result<(), LinkError> {
        if self.fail_begin {
            return Err(LinkError::NotConnected);
        }
        self.begun = true;
        self.ended = false;
        self.baud = baud;
        self.baud_history.push(baud);
        Ok(())
    }

    fn end(&mut self) {
        self.ended = true;
        self.begun = false;
    }

    // Never waits: whatever is queued now is all the host will ever send.
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, LinkError> {
        let mut n = 0;
        while n < buf.len() {
            match self.pop() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn read_byte(&mut self) -> nb::Result<u8, LinkError> {
        self.pop().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn available(&mut self) -> usize {
        self.rx.len()
    }

    fn is_line_asserted(&mut self, line: Line) -> bool {
        match line {
            Line::Motor => self.motor,
            Line::Command => {
                if self.command_stuck {
                    return true;
                }
                match self.command_until {
                    Some(mark) if self.consumed < mark => true,
                    Some(_) => {
                        self.command_until = None;
                        false
                    }
                    None => false,
                }
            }
        }
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn discard_input(&mut self) {
        self.consumed += self.rx.len();
        self.rx.clear();
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), LinkError> {
        self.baud = baud;
        self.baud_history.push(baud);
        Ok(())
    }

    fn set_output_line(&mut self, line: OutputLine, asserted: bool) -> Result<(), LinkError> {
        self.output_lines.push((line, asserted));
        Ok(())
    }

    fn set_clock_out(&mut self, hz: Option<u32>) -> Result<(), LinkError> {
        if self.kind != TransportKind::Serial {
            return Err(LinkError::Unsupported(self.kind));
        }
        self.clock_out = hz;
        Ok(())
    }

    fn end_cycle(&mut self, acknowledged: bool) {
        self.end_cycles.push(acknowledged);
    }

    fn delay_us(&mut self, us: u32) {
        self.delayed_us += u64::from(us);
    }

    fn take_host_reset(&mut self) -> bool {
        std::mem::take(&mut self.host_reset)
    }
}
