use crate::device::{Device, DeviceLink};
use crate::frame::CommandFrame;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

/// APETime "get time" command.
pub const CMD_GET_TIME: u8 = 0x93;

pub type TimeSource = fn() -> DateTime<Utc>;

/// Real time clock answering APETime requests in UTC.
pub struct Clock {
    id: u8,
    active: bool,
    now: TimeSource,
}

impl Clock {
    pub fn new(id: u8) -> Self {
        Self::with_time_source(id, Utc::now)
    }

    pub fn with_time_source(id: u8, now: TimeSource) -> Self {
        Self { id, active: true, now }
    }

    /// `[day, month, year - 2000, hour, minute, second]`
    pub fn time_bytes(&self) -> [u8; 6] {
        encode_time((self.now)())
    }
}

impl Device for Clock {
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

        if frame.command == CMD_GET_TIME {
            let time = self.time_bytes();
            link.bus_to_computer(&time, false);
        } else {
            debug!("Clock: unsupported command 0x{:02X}", frame.command);
            link.error();
        }
    }

    fn name(&self) -> &'static str {
        "clock"
    }
}

fn encode_time(now: DateTime<Utc>) -> [u8; 6] {
    [
        now.day() as u8,
        now.month() as u8,
        (now.year() - 2000).clamp(0, 255) as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ]
}
