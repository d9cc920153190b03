//! Physical and virtual carrier sense
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{trace, debug};

use crate::Ts;
use crate::frame::{Address, Frame};
use crate::timer::Alarm;

/// PHY reception state as reported by clear channel assessment
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum ReceptionState {
    Idle,
    Busy,
}

/// Local transmission state
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum TransmissionState {
    Idle,
    Transmitting,
}

/// Combines physical carrier sense, local transmission and the NAV into a
/// single medium free / busy signal.
///
/// Every method that may change the signal returns `Some(free)` on a
/// transition so the caller can notify the contention engines.
#[derive(Debug, Clone, PartialEq)]
pub struct MediumTracker {
    reception: ReceptionState,
    transmission: TransmissionState,
    nav: Alarm,
    eifs_pending: bool,

    free: bool,
    free_since: Ts,
}

impl MediumTracker {
    pub fn new(now: Ts) -> Self {
        Self {
            reception: ReceptionState::Idle,
            transmission: TransmissionState::Idle,
            nav: Alarm::new(),
            eifs_pending: false,
            free: true,
            free_since: now,
        }
    }

    pub fn is_medium_free(&self) -> bool {
        self.free
    }

    /// Instant the medium last became free, if it is currently free
    pub fn free_since(&self) -> Option<Ts> {
        match self.free {
            true => Some(self.free_since),
            false => None,
        }
    }

    /// Whether a reception is physically in progress
    pub fn is_receiving(&self) -> bool {
        self.reception == ReceptionState::Busy
    }

    pub fn reception_state(&self) -> ReceptionState {
        self.reception
    }

    pub fn transmission_state(&self) -> TransmissionState {
        self.transmission
    }

    /// Current NAV expiry, if the NAV is running
    pub fn nav_expiry(&self) -> Option<Ts> {
        self.nav.deadline()
    }

    /// Whether the next contention attempt must wait EIFS rather than IFS
    pub fn eifs_pending(&self) -> bool {
        self.eifs_pending
    }

    /// Called once a contention engine has waited out an EIFS
    pub fn clear_eifs(&mut self) {
        self.eifs_pending = false;
    }

    pub fn reception_state_changed(&mut self, now: Ts, state: ReceptionState) -> Option<bool> {
        trace!("Reception state {} at {} us", state, now);
        self.reception = state;
        self.update(now)
    }

    pub fn transmission_state_changed(&mut self, now: Ts, state: TransmissionState) -> Option<bool> {
        trace!("Transmission state {} at {} us", state, now);
        self.transmission = state;
        self.update(now)
    }

    /// Handle a completed reception.
    ///
    /// `frame` is `None` where the header could not be decoded, `fcs_ok` is
    /// false for receptions with bit errors.
    pub fn frame_received(&mut self, now: Ts, frame: Option<&Frame>, fcs_ok: bool, own: Address) -> Option<bool> {
        if fcs_ok && frame.is_some() {
            self.eifs_pending = false;
        } else {
            debug!("Corrupted reception at {} us, next wait is EIFS", now);
            self.eifs_pending = true;
        }

        match frame {
            Some(f) if f.receiver != own => match f.nav_duration() {
                Some(d) => self.set_nav(now, d as Ts),
                None => None,
            },
            _ => None,
        }
    }

    /// Extend the NAV to `now + duration` if that is later than the current expiry
    pub fn set_nav(&mut self, now: Ts, duration: Ts) -> Option<bool> {
        if duration == 0 {
            return None;
        }

        let expiry = now + duration;
        match self.nav.deadline() {
            Some(current) if current >= expiry => {
                trace!("NAV at {} us already covers {} us", current, expiry);
                return None;
            },
            _ => (),
        }

        debug!("NAV set to {} us at {} us", expiry, now);
        self.nav.arm(now, expiry);

        self.update(now)
    }

    pub(crate) fn alarm(&self) -> &Alarm {
        &self.nav
    }

    /// Handle NAV expiry
    pub fn handle_timeout(&mut self, now: Ts) -> Option<bool> {
        if !self.nav.take_expired(now) {
            return None;
        }

        debug!("NAV expired at {} us", now);
        self.update(now)
    }

    fn update(&mut self, now: Ts) -> Option<bool> {
        let free = self.reception == ReceptionState::Idle
            && self.transmission == TransmissionState::Idle
            && !self.nav.is_armed();

        if free == self.free {
            return None;
        }

        self.free = free;
        if free {
            self.free_since = now;
        }

        trace!("Medium {} at {} us", if free { "free" } else { "busy" }, now);

        Some(free)
    }
}
