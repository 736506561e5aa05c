//! Command frame wire codec and the single-byte handshake codes.
//!
//! Wire layout, no start/stop markers:
//! ```text
//! [device_id][command][aux1][aux2][checksum]
//! ```
//! The checksum covers the four data bytes only. The same four bytes are also
//! handed to devices packed into a `u32` whose little-endian byte order is the
//! field order above.

use crate::checksum::ChecksumPolicy;
use crate::transport::{LinkError, Transport};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::time::Duration;

pub const FRAME_LEN: usize = 5;
pub const FRAME_DATA_LEN: usize = 4;

const_assert_eq!(FRAME_DATA_LEN, core::mem::size_of::<u32>());
const_assert_eq!(FRAME_LEN, FRAME_DATA_LEN + 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandFrame {
    pub device_id: u8,
    pub command: u8,
    pub aux1: u8,
    pub aux2: u8,
    pub checksum: u8,
}

impl CommandFrame {
    /// Build a frame with a correct checksum for `policy`.
    pub fn new(device_id: u8, command: u8, aux1: u8, aux2: u8, policy: ChecksumPolicy) -> Self {
        let checksum = policy.checksum(&[device_id, command, aux1, aux2]);
        Self {
            device_id,
            command,
            aux1,
            aux2,
            checksum,
        }
    }

    pub fn from_bytes(bytes: &[u8; FRAME_LEN]) -> Self {
        Self {
            device_id: bytes[0],
            command: bytes[1],
            aux1: bytes[2],
            aux2: bytes[3],
            checksum: bytes[4],
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        [self.device_id, self.command, self.aux1, self.aux2, self.checksum]
    }

    pub fn data_bytes(&self) -> [u8; FRAME_DATA_LEN] {
        [self.device_id, self.command, self.aux1, self.aux2]
    }

    /// Packed view of the data bytes, device id in the low byte.
    pub fn command_data(&self) -> u32 {
        u32::from_le_bytes(self.data_bytes())
    }

    pub fn from_command_data(command_data: u32, checksum: u8) -> Self {
        let [device_id, command, aux1, aux2] = command_data.to_le_bytes();
        Self {
            device_id,
            command,
            aux1,
            aux2,
            checksum,
        }
    }

    /// Both aux bytes as one value, aux2 being the high byte (sector numbers etc).
    pub fn aux(&self) -> u16 {
        u16::from_le_bytes([self.aux1, self.aux2])
    }

    pub fn is_valid(&self, policy: ChecksumPolicy) -> bool {
        validate(self, policy)
    }
}

impl core::fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x} {:02x} {:02x} {:02x} {:02x}",
            self.device_id, self.command, self.aux1, self.aux2, self.checksum
        )
    }
}

pub fn validate(frame: &CommandFrame, policy: ChecksumPolicy) -> bool {
    policy.checksum(&frame.data_bytes()) == frame.checksum
}

/// Read exactly one frame. Fewer than five bytes within `timeout` is a
/// [`LinkError::Timeout`]; a partial frame is never returned.
pub fn read_frame(transport: &mut dyn Transport, timeout: Duration) -> Result<CommandFrame, LinkError> {
    let mut bytes = [0u8; FRAME_LEN];
    let received = transport.read(&mut bytes, timeout)?;

    if received != FRAME_LEN {
        return Err(LinkError::Timeout {
            expected: FRAME_LEN,
            received,
        });
    }

    Ok(CommandFrame::from_bytes(&bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    Ack,
    Nak,
    Complete,
    Error,
}

impl Handshake {
    pub const fn as_byte(self) -> u8 {
        match self {
            Handshake::Ack => b'A',
            Handshake::Nak => b'N',
            Handshake::Complete => b'C',
            Handshake::Error => b'E',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'A' => Some(Handshake::Ack),
            b'N' => Some(Handshake::Nak),
            b'C' => Some(Handshake::Complete),
            b'E' => Some(Handshake::Error),
            _ => None,
        }
    }

    /// Complete and Error end a command; Ack and Nak only answer the frame.
    pub fn is_terminal(self) -> bool {
        matches!(self, Handshake::Complete | Handshake::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_data_matches_field_order() {
        let frame = CommandFrame::new(0x31, 0x52, 0x10, 0x02, ChecksumPolicy::Additive);
        assert_eq!(frame.command_data(), 0x0210_5231);
        assert_eq!(frame.command_data().to_le_bytes(), frame.data_bytes());
        assert_eq!(CommandFrame::from_command_data(frame.command_data(), frame.checksum), frame);
    }

    #[test]
    fn test_aux_word() {
        let frame = CommandFrame::new(0x31, 0x52, 0x68, 0x01, ChecksumPolicy::Additive);
        assert_eq!(frame.aux(), 360);
    }

    #[test]
    fn test_handshake_bytes() {
        for h in [Handshake::Ack, Handshake::Nak, Handshake::Complete, Handshake::Error] {
            assert_eq!(Handshake::from_byte(h.as_byte()), Some(h));
        }
        assert_eq!(Handshake::from_byte(b'X'), None);
        assert!(Handshake::Complete.is_terminal());
        assert!(!Handshake::Ack.is_terminal());
    }
}
