//! Built-in peripherals the daemon puts on the bus.

pub mod clock;
pub mod ramdisk;

pub use clock::Clock;
pub use ramdisk::{RamDisk, SECTOR_SIZE};

pub const DISK_DEVICE_ID: u8 = 0x31;
pub const CLOCK_DEVICE_ID: u8 = 0x45;
