//! NetSIO datagram codec: bus traffic and line changes tunneled over UDP to
//! a hub that sits next to the host computer (or its emulator).
//!
//! Each datagram is one message: a one byte code followed by a fixed or
//! code-dependent payload. Multi-byte integers are little-endian.

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATA_BYTE: u8 = 0x01;
pub const DATA_BLOCK: u8 = 0x02;
pub const DATA_BYTE_SYNC: u8 = 0x09;
pub const COMMAND_OFF: u8 = 0x10;
pub const COMMAND_ON: u8 = 0x11;
pub const COMMAND_OFF_SYNC: u8 = 0x18;
pub const MOTOR_OFF: u8 = 0x20;
pub const MOTOR_ON: u8 = 0x21;
pub const PROCEED_OFF: u8 = 0x30;
pub const PROCEED_ON: u8 = 0x31;
pub const INTERRUPT_OFF: u8 = 0x40;
pub const INTERRUPT_ON: u8 = 0x41;
pub const SPEED_CHANGE: u8 = 0x80;
pub const SYNC_RESPONSE: u8 = 0x81;
pub const BUS_IDLE: u8 = 0x88;
pub const DEVICE_DISCONNECT: u8 = 0xC0;
pub const DEVICE_CONNECT: u8 = 0xC1;
pub const PING_REQUEST: u8 = 0xC2;
pub const PING_RESPONSE: u8 = 0xC3;
pub const ALIVE_REQUEST: u8 = 0xC4;
pub const ALIVE_RESPONSE: u8 = 0xC5;
pub const CREDIT_STATUS: u8 = 0xC6;
pub const CREDIT_UPDATE: u8 = 0xC7;
pub const WARM_RESET: u8 = 0xFE;
pub const COLD_RESET: u8 = 0xFF;

pub const MAX_BLOCK_LEN: usize = 512;
/// Code, block, trailing sequence number.
pub const MAX_DATAGRAM_LEN: usize = MAX_BLOCK_LEN + 2;

pub type Block = ArrayVec<u8, MAX_BLOCK_LEN>;
pub type Datagram = ArrayVec<u8, MAX_DATAGRAM_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetSioError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown message 0x{0:02X}")]
    UnknownMessage(u8),
    #[error("message 0x{kind:02X} needs {needed} bytes, got {available}")]
    Truncated { kind: u8, needed: usize, available: usize },
    #[error("data block of {0} bytes exceeds {MAX_BLOCK_LEN}")]
    BlockTooLarge(usize),
}

/// Which side sent the datagram. Only the hub numbers its data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HubToDevice,
    DeviceToHub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    /// Cycle ended without Ack/Nak; the hub just releases the host.
    Empty,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetSioMessage {
    DataByte(u8),
    DataBlock { data: Block, seq: Option<u8> },
    DataByteSync { byte: u8, seq: u8 },
    CommandOff,
    CommandOn,
    CommandOffSync { seq: u8 },
    MotorOff,
    MotorOn,
    ProceedOff,
    ProceedOn,
    InterruptOff,
    InterruptOn,
    SpeedChange(u32),
    SyncResponse { seq: u8, kind: SyncKind, ack: u8, write_size: u16 },
    BusIdle(u16),
    DeviceDisconnect,
    DeviceConnect,
    PingRequest,
    PingResponse,
    AliveRequest,
    AliveResponse,
    CreditStatus(u8),
    CreditUpdate(u8),
    WarmReset,
    ColdReset,
}

impl NetSioMessage {
    pub fn data_block(data: &[u8], seq: Option<u8>) -> Result<Self, NetSioError> {
        let data = Block::try_from(data).map_err(|_| NetSioError::BlockTooLarge(data.len()))?;
        Ok(NetSioMessage::DataBlock { data, seq })
    }

    pub fn code(&self) -> u8 {
        match self {
            NetSioMessage::DataByte(_) => DATA_BYTE,
            NetSioMessage::DataBlock { .. } => DATA_BLOCK,
            NetSioMessage::DataByteSync { .. } => DATA_BYTE_SYNC,
            NetSioMessage::CommandOff => COMMAND_OFF,
            NetSioMessage::CommandOn => COMMAND_ON,
            NetSioMessage::CommandOffSync { .. } => COMMAND_OFF_SYNC,
            NetSioMessage::MotorOff => MOTOR_OFF,
            NetSioMessage::MotorOn => MOTOR_ON,
            NetSioMessage::ProceedOff => PROCEED_OFF,
            NetSioMessage::ProceedOn => PROCEED_ON,
            NetSioMessage::InterruptOff => INTERRUPT_OFF,
            NetSioMessage::InterruptOn => INTERRUPT_ON,
            NetSioMessage::SpeedChange(_) => SPEED_CHANGE,
            NetSioMessage::SyncResponse { .. } => SYNC_RESPONSE,
            NetSioMessage::BusIdle(_) => BUS_IDLE,
            NetSioMessage::DeviceDisconnect => DEVICE_DISCONNECT,
            NetSioMessage::DeviceConnect => DEVICE_CONNECT,
            NetSioMessage::PingRequest => PING_REQUEST,
            NetSioMessage::PingResponse => PING_RESPONSE,
            NetSioMessage::AliveRequest => ALIVE_REQUEST,
            NetSioMessage::AliveResponse => ALIVE_RESPONSE,
            NetSioMessage::CreditStatus(_) => CREDIT_STATUS,
            NetSioMessage::CreditUpdate(_) => CREDIT_UPDATE,
            NetSioMessage::WarmReset => WARM_RESET,
            NetSioMessage::ColdReset => COLD_RESET,
        }
    }

    /// Messages that spend a flow control credit when sent by the device.
    pub fn needs_credit(&self) -> bool {
        matches!(
            self,
            NetSioMessage::DataByte(_)
                | NetSioMessage::DataBlock { .. }
                | NetSioMessage::DataByteSync { .. }
                | NetSioMessage::SyncResponse { .. }
                | NetSioMessage::ProceedOff
                | NetSioMessage::ProceedOn
                | NetSioMessage::InterruptOff
                | NetSioMessage::InterruptOn
        )
    }

    pub fn encode(&self) -> Datagram {
        let mut out = Datagram::new();
        out.push(self.code());

        match self {
            NetSioMessage::DataByte(b) | NetSioMessage::CreditStatus(b) | NetSioMessage::CreditUpdate(b) => {
                out.push(*b);
            }
            NetSioMessage::DataBlock { data, seq } => {
                // Block is bounded by MAX_BLOCK_LEN so this always fits
                out.extend(data.iter().copied());
                if let Some(seq) = seq {
                    out.push(*seq);
                }
            }
            NetSioMessage::DataByteSync { byte, seq } => {
                out.push(*byte);
                out.push(*seq);
            }
            NetSioMessage::CommandOffSync { seq } => out.push(*seq),
            NetSioMessage::SpeedChange(baud) => out.extend(baud.to_le_bytes()),
            NetSioMessage::SyncResponse {
                seq,
                kind,
                ack,
                write_size,
            } => {
                out.push(*seq);
                out.push(match kind {
                    SyncKind::Empty => 0,
                    SyncKind::Ack => 1,
                });
                out.push(*ack);
                out.extend(write_size.to_le_bytes());
            }
            NetSioMessage::BusIdle(ticks) => out.extend(ticks.to_le_bytes()),
            _ => {}
        }

        out
    }

    pub fn decode(bytes: &[u8], direction: Direction) -> Result<Self, NetSioError> {
        let (&code, payload) = bytes.split_first().ok_or(NetSioError::Empty)?;

        let need = |n: usize| -> Result<(), NetSioError> {
            if payload.len() < n {
                Err(NetSioError::Truncated {
                    kind: code,
                    needed: n + 1,
                    available: bytes.len(),
                })
            } else {
                Ok(())
            }
        };

        let message = match code {
            DATA_BYTE => {
                need(1)?;
                NetSioMessage::DataByte(payload[0])
            }
            DATA_BLOCK => match direction {
                Direction::HubToDevice => {
                    need(1)?;
                    let (data, seq) = payload.split_at(payload.len() - 1);
                    Self::data_block(data, Some(seq[0]))?
                }
                Direction::DeviceToHub => Self::data_block(payload, None)?,
            },
            DATA_BYTE_SYNC => {
                need(2)?;
                NetSioMessage::DataByteSync {
                    byte: payload[0],
                    seq: payload[1],
                }
            }
            COMMAND_OFF => NetSioMessage::CommandOff,
            COMMAND_ON => NetSioMessage::CommandOn,
            COMMAND_OFF_SYNC => {
                need(1)?;
                NetSioMessage::CommandOffSync { seq: payload[0] }
            }
            MOTOR_OFF => NetSioMessage::MotorOff,
            MOTOR_ON => NetSioMessage::MotorOn,
            PROCEED_OFF => NetSioMessage::ProceedOff,
            PROCEED_ON => NetSioMessage::ProceedOn,
            INTERRUPT_OFF => NetSioMessage::InterruptOff,
            INTERRUPT_ON => NetSioMessage::InterruptOn,
            SPEED_CHANGE => {
                need(4)?;
                NetSioMessage::SpeedChange(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
            }
            SYNC_RESPONSE => {
                need(5)?;
                NetSioMessage::SyncResponse {
                    seq: payload[0],
                    kind: if payload[1] == 0 { SyncKind::Empty } else { SyncKind::Ack },
                    ack: payload[2],
                    write_size: u16::from_le_bytes([payload[3], payload[4]]),
                }
            }
            BUS_IDLE => {
                need(2)?;
                NetSioMessage::BusIdle(u16::from_le_bytes([payload[0], payload[1]]))
            }
            DEVICE_DISCONNECT => NetSioMessage::DeviceDisconnect,
            DEVICE_CONNECT => NetSioMessage::DeviceConnect,
            PING_REQUEST => NetSioMessage::PingRequest,
            PING_RESPONSE => NetSioMessage::PingResponse,
            ALIVE_REQUEST => NetSioMessage::AliveRequest,
            ALIVE_RESPONSE => NetSioMessage::AliveResponse,
            CREDIT_STATUS => {
                need(1)?;
                NetSioMessage::CreditStatus(payload[0])
            }
            CREDIT_UPDATE => {
                need(1)?;
                NetSioMessage::CreditUpdate(payload[0])
            }
            WARM_RESET => NetSioMessage::WarmReset,
            COLD_RESET => NetSioMessage::ColdReset,
            other => return Err(NetSioError::UnknownMessage(other)),
        };

        Ok(message)
    }
}
