//! # Serial Expansion Bus Engine
//!
//! Protocol engine for a vintage computer's serial peripheral bus: one
//! half-duplex line shared by many virtual devices, addressed with 5-byte
//! checksummed command frames and answered with single byte handshakes.
//!
//! ## Features
//!
//! - **Command cycle state machine**: frame read, checksum validation, routing
//!   and the Ack/Nak handshake, one cycle per `service()` tick
//! - **Daisy chain registry**: live id re-keying for disk swaps, ordered
//!   broadcast (Type-3 poll) delivery
//! - **Link negotiation**: high speed index formula, automatic speed toggling
//!   after repeated bad frames, ultra-high speed clocking
//! - **Stream consumers**: a device may own the line between commands and is
//!   pre-empted whenever the host asserts the command line
//! - **Pluggable transports**: a physical binding or NetSIO over UDP, switched
//!   at runtime behind [`transport::TransportProxy`]
//!
//! ## Quick Start
//!
//! ```rust
//! use siobus::{BusEngine, CommandFrame, ChecksumPolicy, EngineConfig, MemoryTransport};
//! use siobus::devices::RamDisk;
//!
//! let mut engine = BusEngine::new(MemoryTransport::new(), EngineConfig::default());
//! engine.add_device(siobus::device::handle(RamDisk::new(0x31, 720)), 0x31).unwrap();
//! engine.setup().unwrap();
//!
//! // Host asks drive 1 for its status
//! let frame = CommandFrame::new(0x31, b'S', 0, 0, ChecksumPolicy::Additive);
//! engine.transport_mut().host_send_command(&frame);
//! engine.service();
//!
//! assert_eq!(&engine.transport_mut().take_written()[..2], b"AC");
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - The bus state machine and its public API
//! - [`chain`] - Device registry
//! - [`device`] - Device contract and the link handed to devices
//! - [`link`] - Baud rate and high speed negotiation
//! - [`frame`], [`checksum`] - Wire format
//! - [`transport`], [`netsio`] - Byte transports and the NetSIO tunnel codec
//! - [`config`] - TOML configuration
//! - [`devices`] - Built-in peripherals

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod chain;
pub mod checksum;
pub mod config;
pub mod device;
pub mod devices;
pub mod engine;
pub mod frame;
pub mod link;
pub mod netsio;
pub mod transport;

// Re-export main public types for convenience
pub use chain::{ChainError, DaisyChain};
pub use checksum::ChecksumPolicy;
pub use config::{BusConfig, ConfigError};
pub use device::{BusRequest, Device, DeviceHandle, DeviceLink, LinkSnapshot, StreamTurn};
pub use engine::{BusEngine, BusMessage, BusStats, CycleOutcome, EngineConfig, EngineError};
pub use frame::{CommandFrame, Handshake};
pub use link::{LinkNegotiator, LinkState};
pub use transport::{LinkError, MemoryTransport, NetSioTransport, Transport, TransportKind};
