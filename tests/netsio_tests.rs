use siobus::device::handle;
use siobus::devices::RamDisk;
use siobus::netsio::*;
use siobus::*;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

#[test]
fn test_hub_data_block_drops_sequence_byte() {
    let bytes = [DATA_BLOCK, 0x31, 0x52, 0x01, 0x00, 0x84, 0x07];
    let message = NetSioMessage::decode(&bytes, Direction::HubToDevice).unwrap();

    match message {
        NetSioMessage::DataBlock { data, seq } => {
            assert_eq!(data.as_slice(), &[0x31, 0x52, 0x01, 0x00, 0x84]);
            assert_eq!(seq, Some(7));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_device_data_block_is_unsequenced() {
    let message = NetSioMessage::data_block(b"C", None).unwrap();
    assert_eq!(message.encode().as_slice(), &[DATA_BLOCK, b'C']);
    assert_eq!(NetSioMessage::decode(&[DATA_BLOCK, b'C'], Direction::DeviceToHub), Ok(message));
}

#[test]
fn test_speed_change_is_little_endian() {
    let encoded = NetSioMessage::SpeedChange(19_200).encode();
    assert_eq!(encoded.as_slice(), &[SPEED_CHANGE, 0x00, 0x4B, 0x00, 0x00]);
}

#[test]
fn test_sync_response_layout() {
    let message = NetSioMessage::SyncResponse {
        seq: 3,
        kind: SyncKind::Empty,
        ack: 0,
        write_size: 0,
    };
    assert_eq!(message.encode().as_slice(), &[SYNC_RESPONSE, 3, 0, 0, 0, 0]);
    assert!(message.needs_credit());
}

#[test]
fn test_control_messages_are_single_byte() {
    for message in [
        NetSioMessage::CommandOn,
        NetSioMessage::CommandOff,
        NetSioMessage::MotorOn,
        NetSioMessage::DeviceConnect,
        NetSioMessage::PingRequest,
        NetSioMessage::AliveResponse,
        NetSioMessage::ColdReset,
    ] {
        let encoded = message.encode();
        assert_eq!(encoded.len(), 1);
        assert_eq!(NetSioMessage::decode(&encoded, Direction::HubToDevice), Ok(message));
    }
    assert!(!NetSioMessage::PingRequest.needs_credit());
    assert!(NetSioMessage::InterruptOn.needs_credit());
}

#[test]
fn test_bad_datagrams_are_rejected() {
    assert_eq!(NetSioMessage::decode(&[], Direction::HubToDevice), Err(NetSioError::Empty));
    assert_eq!(
        NetSioMessage::decode(&[0x77], Direction::HubToDevice),
        Err(NetSioError::UnknownMessage(0x77))
    );
    assert!(matches!(
        NetSioMessage::decode(&[COMMAND_OFF_SYNC], Direction::HubToDevice),
        Err(NetSioError::Truncated { kind: COMMAND_OFF_SYNC, .. })
    ));
    assert_eq!(
        NetSioMessage::data_block(&[0u8; MAX_BLOCK_LEN + 1], None),
        Err(NetSioError::BlockTooLarge(MAX_BLOCK_LEN + 1))
    );
}

// Loopback hub playing the host side of the tunnel

struct Hub {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl Hub {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        Self { socket, peer: None }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn send(&self, message: &NetSioMessage) {
        let peer = self.peer.expect("device has not connected");
        self.socket.send_to(&message.encode(), peer).unwrap();
    }

    /// Everything the device sent until it goes quiet.
    fn drain(&mut self) -> Vec<NetSioMessage> {
        let mut messages = Vec::new();
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        while let Ok((n, from)) = self.socket.recv_from(&mut buf) {
            self.peer = Some(from);
            messages.push(NetSioMessage::decode(&buf[..n], Direction::DeviceToHub).unwrap());
        }
        messages
    }

    fn send_command(&self, frame: &[u8], seq: u8) {
        self.send(&NetSioMessage::CreditUpdate(8));
        self.send(&NetSioMessage::CommandOn);
        self.send(&NetSioMessage::data_block(frame, Some(seq)).unwrap());
        self.send(&NetSioMessage::CommandOffSync { seq });
        // Let loopback deliver before the engine polls
        thread::sleep(Duration::from_millis(20));
    }
}

fn connected_engine(hub: &mut Hub) -> BusEngine<NetSioTransport> {
    let mut engine = BusEngine::new(NetSioTransport::new("127.0.0.1", hub.port()), EngineConfig::default());
    engine.add_device(handle(RamDisk::new(0x31, 720)), 0x31).unwrap();
    engine.setup().unwrap();

    let hello = hub.drain();
    assert!(hello.contains(&NetSioMessage::PingRequest));
    assert!(hello.contains(&NetSioMessage::DeviceConnect));
    assert!(hello.contains(&NetSioMessage::SpeedChange(19_200)));
    engine
}

fn device_payload(messages: &[NetSioMessage]) -> Vec<u8> {
    let mut payload = Vec::new();
    for message in messages {
        if let NetSioMessage::DataBlock { data, .. } = message {
            payload.extend_from_slice(data);
        }
    }
    payload
}

#[test]
fn test_status_command_over_tunnel() {
    let mut hub = Hub::bind();
    let mut engine = connected_engine(&mut hub);

    let frame = CommandFrame::new(0x31, b'S', 0, 0, ChecksumPolicy::Additive);
    hub.send_command(&frame.to_bytes(), 1);

    let outcome = engine.service();
    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            device_id: 0x31,
            terminal: Some(Handshake::Complete)
        }
    );
    assert!(engine.transport().is_connected());

    let replies = hub.drain();
    assert!(replies.contains(&NetSioMessage::SyncResponse {
        seq: 1,
        kind: SyncKind::Ack,
        ack: b'A',
        write_size: 0,
    }));
    assert_eq!(device_payload(&replies), vec![b'C', 0x00, 0xFF, 0xE0, 0x00, 0xE0]);
}

#[test]
fn test_bad_frame_over_tunnel_releases_host() {
    let mut hub = Hub::bind();
    let mut engine = connected_engine(&mut hub);

    hub.send_command(&[0x31, 0x53, 0x00, 0x00, 0x00], 2);

    let outcome = engine.service();
    assert_eq!(outcome, CycleOutcome::ChecksumMismatch { failures: 1, toggled: false });

    let replies = hub.drain();
    assert!(replies.contains(&NetSioMessage::SyncResponse {
        seq: 2,
        kind: SyncKind::Empty,
        ack: 0,
        write_size: 0,
    }));
    assert!(device_payload(&replies).is_empty());
}

#[test]
fn test_speed_toggle_announced_to_hub() {
    let mut hub = Hub::bind();
    let mut engine = connected_engine(&mut hub);

    hub.send_command(&[0x31, 0x53, 0x00, 0x00, 0x00], 1);
    engine.service();
    hub.send_command(&[0x31, 0x53, 0x00, 0x00, 0x00], 2);
    assert_eq!(engine.service(), CycleOutcome::ChecksumMismatch { failures: 2, toggled: true });

    let replies = hub.drain();
    assert!(replies.contains(&NetSioMessage::SpeedChange(67_431)));
}

#[test]
fn test_shutdown_disconnects_from_hub() {
    let mut hub = Hub::bind();
    let mut engine = connected_engine(&mut hub);

    engine.shutdown();

    assert!(hub.drain().contains(&NetSioMessage::DeviceDisconnect));
    assert!(!engine.transport().is_connected());
}
