use siobus::checksum::{additive_checksum, xor_checksum};
use siobus::frame::{read_frame, FRAME_LEN};
use siobus::*;
use std::time::Duration;

#[test]
fn test_additive_checksum_folds_carry() {
    assert_eq!(additive_checksum(&[0x31, 0x52, 0x00, 0x00]), 0x83);
    // 0x80 + 0x80 = 0x100 folds to 0x01
    assert_eq!(additive_checksum(&[0x80, 0x80]), 0x01);
    assert_eq!(additive_checksum(&[0xFF; 4]), 0xFF);
    assert_eq!(additive_checksum(&[]), 0x00);
}

#[test]
fn test_xor_checksum() {
    assert_eq!(xor_checksum(&[0x31, 0x52, 0x00, 0x00]), 0x63);
    assert_eq!(xor_checksum(&[0xAA, 0xAA]), 0x00);
}

#[test]
fn test_policies_disagree_on_same_frame() {
    let additive = CommandFrame::new(0x31, b'R', 0x68, 0x01, ChecksumPolicy::Additive);
    let xor = CommandFrame::new(0x31, b'R', 0x68, 0x01, ChecksumPolicy::Xor);

    assert!(additive.is_valid(ChecksumPolicy::Additive));
    assert!(xor.is_valid(ChecksumPolicy::Xor));
    assert!(!additive.is_valid(ChecksumPolicy::Xor));
}

#[test]
fn test_frame_bytes_in_wire_order() {
    let frame = CommandFrame::new(0x45, 0x93, 0xEE, 0xA0, ChecksumPolicy::Additive);
    let bytes = frame.to_bytes();

    assert_eq!(bytes.len(), FRAME_LEN);
    assert_eq!(&bytes[..4], &[0x45, 0x93, 0xEE, 0xA0]);
    assert_eq!(CommandFrame::from_bytes(&bytes), frame);
    assert_eq!(frame.to_string(), format!("45 93 ee a0 {:02x}", frame.checksum));
}

#[test]
fn test_every_field_value_survives_wire_and_packing() {
    for policy in [ChecksumPolicy::Additive, ChecksumPolicy::Xor] {
        for value in 0..=255u8 {
            let frames = [
                CommandFrame::new(value, 0x52, 0x01, 0x00, policy),
                CommandFrame::new(0x31, value, 0x01, 0x00, policy),
                CommandFrame::new(0x31, 0x52, value, 0x00, policy),
                CommandFrame::new(0x31, 0x52, 0x01, value, policy),
            ];

            for frame in frames {
                assert!(frame.is_valid(policy), "{} invalid", frame);
                assert_eq!(CommandFrame::from_bytes(&frame.to_bytes()), frame);
                assert_eq!(
                    CommandFrame::from_command_data(frame.command_data(), frame.checksum),
                    frame
                );
            }
        }
    }
}

#[test]
fn test_read_frame_needs_five_bytes() {
    let mut transport = MemoryTransport::new();
    transport.host_send(&[0x31, 0x53, 0x00, 0x00, 0x84, 0x99]);

    let frame = read_frame(&mut transport, Duration::from_millis(10)).unwrap();
    assert_eq!(frame.device_id, 0x31);
    assert_eq!(frame.checksum, 0x84);
    assert_eq!(transport.pending_input(), 1);

    let short = read_frame(&mut transport, Duration::from_millis(10));
    assert_eq!(short, Err(LinkError::Timeout { expected: 5, received: 1 }));
}

#[test]
fn test_handshake_codes() {
    assert_eq!(Handshake::Ack.as_byte(), b'A');
    assert_eq!(Handshake::Nak.as_byte(), b'N');
    assert_eq!(Handshake::Complete.as_byte(), b'C');
    assert_eq!(Handshake::Error.as_byte(), b'E');
    assert!(Handshake::Error.is_terminal());
    assert!(!Handshake::Nak.is_terminal());
}

#[test]
fn test_checksum_properties() {
    let frame = [0x31, 0x52, 0x68, 0x01];
    assert_eq!(additive_checksum(&frame), additive_checksum(&frame));
    assert_eq!(additive_checksum(&[0; 4]), 0);

    let x = xor_checksum(&frame);
    assert_eq!(x ^ xor_checksum(&frame), 0);
    assert_eq!(xor_checksum(&[0x5A, 0x5A, 0x77, 0x77]), 0);
}
