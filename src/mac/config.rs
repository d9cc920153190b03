
use crate::Ts;

use super::contention::ContentionParams;

/// Maximum number of contention engines (access categories)
pub const MAX_ACCESS_CATEGORIES: usize = 4;

/// Capacity of the transmit queue, `Config::max_queue_size` may not exceed this
pub const TX_QUEUE_CAPACITY: usize = 32;

/// Configuration for the DCF MAC
///
/// All times are in microseconds.
#[derive(Clone, PartialEq, Debug)]
pub struct Config {
    /// Short interframe space, gap before responses
    pub sifs: Ts,

    /// Backoff slot duration
    pub slot_time: Ts,

    /// DCF interframe space, normally `sifs + 2 * slot_time`
    pub difs: Ts,

    /// Extended interframe space used after a corrupted reception,
    /// normally `sifs + difs + ACK airtime at the lowest rate`
    pub eifs: Ts,

    /// Minimum contention window
    pub cw_min: u32,

    /// Maximum contention window
    pub cw_max: u32,

    /// Fixed contention window for group addressed frames
    pub cw_multicast: u32,

    /// Maximum number of retransmissions for a frame
    pub short_retry_limit: u8,

    /// Frames of at least this many bytes (FCS included) are protected with RTS/CTS
    pub rts_threshold: usize,

    /// Worst case one way propagation delay
    pub max_propagation_delay: Ts,

    /// Maximum number of queued outgoing frames
    pub max_queue_size: usize,

    /// Number of contention engines, frames select one via `Frame::ac`
    pub access_categories: usize,

    /// Drop retransmitted data frames that were already delivered
    pub duplicate_detection: bool,

    /// Time after which a sender's last sequence number is forgotten
    pub duplicate_timeout: Ts,
}

impl Default for Config {
    fn default() -> Self {
        // 802.11a OFDM PHY characteristics
        Self {
            sifs: 16,
            slot_time: 9,
            difs: 34,
            eifs: 94,

            cw_min: 15,
            cw_max: 1023,
            cw_multicast: 31,
            short_retry_limit: 7,
            rts_threshold: 2346,

            max_propagation_delay: 1,
            max_queue_size: 14,
            access_categories: 1,

            duplicate_detection: true,
            duplicate_timeout: 1_000_000,
        }
    }
}

impl Config {
    /// Check configuration consistency
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.slot_time == 0 {
            return Err("slot time must be non-zero");
        }
        if self.cw_min > self.cw_max {
            return Err("cw_min exceeds cw_max");
        }
        if self.difs < self.sifs || self.eifs < self.difs {
            return Err("interframe spaces must satisfy sifs <= difs <= eifs");
        }
        if self.max_queue_size == 0 || self.max_queue_size > TX_QUEUE_CAPACITY {
            return Err("max_queue_size out of range");
        }
        if self.access_categories == 0 || self.access_categories > MAX_ACCESS_CATEGORIES {
            return Err("access_categories out of range");
        }
        Ok(())
    }

    /// Contention parameters for an attempt with the provided retry count
    pub fn contention_params(&self, retry_count: u8) -> ContentionParams {
        ContentionParams {
            ifs: self.difs,
            eifs: self.eifs,
            cw_min: self.cw_min,
            cw_max: self.cw_max,
            slot_time: self.slot_time,
            retry_count,
        }
    }

    /// Contention parameters for group addressed frames, which are never retried
    pub fn group_contention_params(&self) -> ContentionParams {
        ContentionParams {
            cw_min: self.cw_multicast,
            cw_max: self.cw_multicast,
            ..self.contention_params(0)
        }
    }
}
