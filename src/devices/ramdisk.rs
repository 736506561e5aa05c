use crate::device::{Device, DeviceLink};
use crate::frame::CommandFrame;
use crate::transport::LinkError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SECTOR_SIZE: usize = 128;

const CMD_STATUS: u8 = b'S';
const CMD_READ: u8 = b'R';
const CMD_WRITE: u8 = b'W';
const CMD_PUT: u8 = b'P';
const CMD_HSIO_STATUS: u8 = 0xD3;
const CMD_HSIO_READ: u8 = 0xD2;
const CMD_HSIO_WRITE: u8 = 0xD7;
const CMD_HSIO_PUT: u8 = 0xD0;

// Drive status bits
const STATUS_WRITE_PROTECTED: u8 = 0x08;
const STATUS_ENHANCED_DENSITY: u8 = 0x80;
const FDC_STATUS_CLEAR: u8 = 0xFF;
const FORMAT_TIMEOUT_810: u8 = 0xE0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStats {
    pub reads: u32,
    pub writes: u32,
    pub errors: u32,
}

/// Single density disk image held in memory.
pub struct RamDisk {
    id: u8,
    active: bool,
    config_boot: bool,
    write_protected: bool,
    sectors: Vec<[u8; SECTOR_SIZE]>,
    stats: DiskStats,
}

impl RamDisk {
    pub fn new(id: u8, sector_count: u16) -> Self {
        Self {
            id,
            active: true,
            config_boot: false,
            write_protected: false,
            sectors: vec![[0u8; SECTOR_SIZE]; usize::from(sector_count)],
            stats: DiskStats::default(),
        }
    }

    pub fn with_config_boot(mut self, enabled: bool) -> Self {
        self.config_boot = enabled;
        self
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    pub fn sector_count(&self) -> u16 {
        self.sectors.len() as u16
    }

    /// Sectors are numbered from 1.
    pub fn sector(&self, number: u16) -> Option<&[u8; SECTOR_SIZE]> {
        self.index(number).map(|i| &self.sectors[i])
    }

    pub fn load_sector(&mut self, number: u16, data: &[u8]) -> bool {
        let Some(i) = self.index(number) else {
            return false;
        };
        let n = data.len().min(SECTOR_SIZE);
        self.sectors[i][..n].copy_from_slice(&data[..n]);
        true
    }

    pub fn get_stats(&self) -> DiskStats {
        self.stats
    }

    fn index(&self, number: u16) -> Option<usize> {
        let number = usize::from(number);
        (1..=self.sectors.len()).contains(&number).then(|| number - 1)
    }

    fn read(&mut self, link: &mut DeviceLink<'_>, number: u16) {
        match self.index(number) {
            Some(i) => {
                self.stats.reads += 1;
                let data = self.sectors[i];
                link.bus_to_computer(&data, false);
            }
            None => {
                // The host still expects a full data frame
                debug!("Read of sector {} out of range", number);
                self.stats.errors += 1;
                link.bus_to_computer(&[0u8; SECTOR_SIZE], true);
            }
        }
    }

    fn write(&mut self, link: &mut DeviceLink<'_>, number: u16) {
        let mut buf = [0u8; SECTOR_SIZE];

        match link.bus_to_peripheral(&mut buf) {
            Ok(()) => {}
            Err(LinkError::ChecksumMismatch { .. }) => {
                warn!("Sector {} data frame failed checksum", number);
                self.stats.errors += 1;
                link.error();
                return;
            }
            Err(e) => {
                warn!("Sector {} data frame not received: {}", number, e);
                self.stats.errors += 1;
                link.error();
                return;
            }
        }

        match self.index(number) {
            Some(i) if !self.write_protected => {
                self.sectors[i] = buf;
                self.stats.writes += 1;
                link.complete();
            }
            _ => {
                self.stats.errors += 1;
                link.error();
            }
        }
    }

    fn status_bytes(&self) -> [u8; 4] {
        let mut status = 0u8;
        if self.sectors.len() == 1040 {
            status |= STATUS_ENHANCED_DENSITY;
        }
        if self.write_protected {
            status |= STATUS_WRITE_PROTECTED;
        }
        [status, FDC_STATUS_CLEAR, FORMAT_TIMEOUT_810, 0x00]
    }
}

impl Device for RamDisk {
    fn id(&self) -> u8 {
        self.id
    }

    fn set_id(&mut self, id: u8) {
        self.id = id;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn process(&mut self, link: &mut DeviceLink<'_>, command_data: u32, checksum: u8) {
        let frame = CommandFrame::from_command_data(command_data, checksum);
        let sector = frame.aux();

        match frame.command {
            CMD_STATUS | CMD_HSIO_STATUS => self.status(link),
            CMD_READ | CMD_HSIO_READ => self.read(link, sector),
            CMD_WRITE | CMD_PUT | CMD_HSIO_WRITE | CMD_HSIO_PUT => self.write(link, sector),
            other => {
                debug!("Disk 0x{:02X}: unsupported command 0x{:02X}", self.id, other);
                link.error();
            }
        }
    }

    fn status(&mut self, link: &mut DeviceLink<'_>) {
        let status = self.status_bytes();
        link.bus_to_computer(&status, false);
    }

    fn is_config_boot_device(&self) -> bool {
        self.config_boot
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_numbering_starts_at_one() {
        let mut disk = RamDisk::new(0x31, 720);
        assert!(disk.sector(0).is_none());
        assert!(disk.sector(720).is_some());
        assert!(disk.sector(721).is_none());

        assert!(disk.load_sector(1, &[0xAA; 4]));
        assert_eq!(&disk.sector(1).unwrap()[..5], &[0xAA, 0xAA, 0xAA, 0xAA, 0x00]);
    }

    #[test]
    fn test_status_bytes() {
        let mut disk = RamDisk::new(0x31, 1040);
        disk.set_write_protected(true);
        assert_eq!(disk.status_bytes(), [0x88, 0xFF, 0xE0, 0x00]);
    }
}
