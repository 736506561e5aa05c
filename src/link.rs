use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const STANDARD_BAUD: u32 = 19_200;

pub const PAL_OSCILLATOR_HZ: u32 = 1_773_447;
pub const NTSC_OSCILLATOR_HZ: u32 = 1_789_790;

/// Index meaning "high speed disabled".
pub const HIGH_SPEED_INDEX_INVALID: i32 = -1;
pub const DEFAULT_HIGH_SPEED_INDEX: i32 = 6;
/// Largest index that fits the one byte answer to a speed query.
pub const HIGH_SPEED_INDEX_MAX: i32 = 255;

/// Consecutive bad command frames before the link flips speed.
pub const CHECKSUM_FAILURE_THRESHOLD: u32 = 2;

// Host-side software expects these indices at conventional rates rather than
// the divisor formula. Compatibility constants, keep as observed.
const LEGACY_INDEX_RATES: [(i32, u32); 3] = [(8, 57_600), (16, 38_400), (40, 19_200)];

/// Keep `index` within `-1..=255`.
pub fn clamp_high_speed_index(index: i32) -> i32 {
    let clamped = index.clamp(HIGH_SPEED_INDEX_INVALID, HIGH_SPEED_INDEX_MAX);
    if clamped != index {
        warn!("High speed index {} out of range, using {}", index, clamped);
    }
    clamped
}

/// High speed baud rate for a POKEY divisor index.
///
/// `(osc * 10) / (10 * (2 * (index + 7)) + 3)`, except for the legacy
/// indices above and [`HIGH_SPEED_INDEX_INVALID`] which yields the standard
/// rate.
pub fn high_speed_baud_for(index: i32, oscillator_hz: u32) -> u32 {
    if index == HIGH_SPEED_INDEX_INVALID {
        return STANDARD_BAUD;
    }

    if let Some(&(_, baud)) = LEGACY_INDEX_RATES.iter().find(|(i, _)| *i == index) {
        return baud;
    }

    let divisor = 10 * (2 * (i64::from(index) + 7)) + 3;
    if divisor <= 0 {
        return STANDARD_BAUD;
    }

    ((u64::from(oscillator_hz) * 10) / divisor as u64) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    pub baud: u32,
    pub high_speed_index: i32,
    pub high_speed_baud: u32,
    pub consecutive_checksum_failures: u32,
}

/// Owns the link speed and the bad-frame counter that drives auto toggling.
#[derive(Debug, Clone)]
pub struct LinkNegotiator {
    state: LinkState,
    oscillator_hz: u32,
    failure_threshold: u32,
    ultra_high_baud: Option<u32>,
}

impl LinkNegotiator {
    pub fn new(baud: u32, high_speed_index: i32, oscillator_hz: u32, failure_threshold: u32) -> Self {
        let high_speed_index = clamp_high_speed_index(high_speed_index);
        Self {
            state: LinkState {
                baud,
                high_speed_index,
                high_speed_baud: high_speed_baud_for(high_speed_index, oscillator_hz),
                consecutive_checksum_failures: 0,
            },
            oscillator_hz,
            failure_threshold: failure_threshold.max(1),
            ultra_high_baud: None,
        }
    }

    pub fn get_state(&self) -> &LinkState {
        &self.state
    }

    pub fn baud(&self) -> u32 {
        self.state.baud
    }

    pub fn high_speed_index(&self) -> i32 {
        self.state.high_speed_index
    }

    pub fn high_speed_baud(&self) -> u32 {
        self.state.high_speed_baud
    }

    pub fn consecutive_checksum_failures(&self) -> u32 {
        self.state.consecutive_checksum_failures
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn ultra_high_baud(&self) -> Option<u32> {
        self.ultra_high_baud
    }

    /// Returns true if the rate actually changed.
    pub fn set_baud(&mut self, baud: u32) -> bool {
        self.state.consecutive_checksum_failures = 0;

        if self.state.baud == baud {
            debug!("Baudrate already at {} - nothing to do", baud);
            return false;
        }

        info!("Changing baudrate from {} to {}", self.state.baud, baud);
        self.state.baud = baud;
        true
    }

    /// Swap between the standard rate and the high (or ultra-high) rate.
    /// Returns the new rate.
    pub fn toggle_speed(&mut self) -> u32 {
        let fast = self.ultra_high_baud.unwrap_or(self.state.high_speed_baud);
        let next = if self.state.baud == STANDARD_BAUD { fast } else { STANDARD_BAUD };

        info!("Toggling baudrate from {} to {}", self.state.baud, next);
        self.state.baud = next;
        self.state.consecutive_checksum_failures = 0;
        next
    }

    /// Recompute the high speed rate for `index` and return it.
    pub fn set_high_speed_index(&mut self, index: i32) -> u32 {
        let index = clamp_high_speed_index(index);
        let previous = self.state.high_speed_baud;
        self.state.high_speed_index = index;
        self.state.high_speed_baud = high_speed_baud_for(index, self.oscillator_hz);

        info!(
            "Set high speed baud from {} to {} (index {})",
            previous, self.state.high_speed_baud, index
        );
        self.state.high_speed_baud
    }

    pub fn set_ultra_high(&mut self, baud: Option<u32>) {
        self.ultra_high_baud = baud;
    }

    pub fn record_valid_frame(&mut self) {
        self.state.consecutive_checksum_failures = 0;
    }

    /// Count a bad command frame. Returns true when the threshold was hit
    /// and the speed was toggled; the counter is then back at zero.
    pub fn record_checksum_failure(&mut self) -> bool {
        self.state.consecutive_checksum_failures += 1;

        if self.state.consecutive_checksum_failures >= self.failure_threshold {
            self.toggle_speed();
            return true;
        }

        false
    }
}
