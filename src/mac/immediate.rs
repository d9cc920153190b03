//! Immediate (SIFS) transmitter
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{debug, warn};

use crate::Ts;
use crate::error::CoreError;
use crate::frame::Frame;
use crate::timer::Alarm;

/// Component that requested an immediate transmission
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum Requester {
    /// Active frame exchange (DATA after CTS)
    Exchange,
    /// Response to a received frame (CTS / ACK)
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum ImmediateState {
    Idle,
    /// Waiting out the interframe space
    Waiting,
    Transmitting,
}

/// Sends a frame a fixed interframe space after the request, ignoring
/// carrier sense.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmediateTx {
    state: ImmediateState,
    frame: Option<Frame>,
    requester: Option<Requester>,
    alarm: Alarm,
}

impl ImmediateTx {
    pub fn new() -> Self {
        Self {
            state: ImmediateState::Idle,
            frame: None,
            requester: None,
            alarm: Alarm::new(),
        }
    }

    pub fn state(&self) -> ImmediateState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ImmediateState::Idle
    }

    pub(crate) fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    /// Schedule `frame` for transmission `ifs` after `now`
    pub fn transmit<E>(&mut self, now: Ts, frame: Frame, ifs: Ts, requester: Requester) -> Result<(), CoreError<E>> {
        if self.state != ImmediateState::Idle {
            warn!("Immediate transmit from {} at {} us while {}", requester, now, self.state);
            return Err(CoreError::TransmitPending);
        }

        debug!("Immediate {} to {} scheduled at {} us", frame.kind, frame.receiver, now + ifs);

        self.frame = Some(frame);
        self.requester = Some(requester);
        self.state = ImmediateState::Waiting;
        self.alarm.arm(now, now + ifs);

        Ok(())
    }

    /// Handle alarm expiry, returning the frame to send
    pub fn handle_timeout(&mut self, now: Ts) -> Option<Frame> {
        if !self.alarm.take_expired(now) {
            return None;
        }

        self.state = ImmediateState::Transmitting;
        self.frame.take()
    }

    /// Transmission completed, returns the component that requested it
    pub fn transmission_finished(&mut self, now: Ts) -> Option<Requester> {
        if self.state != ImmediateState::Transmitting {
            return None;
        }

        debug!("Immediate transmission finished at {} us", now);

        self.state = ImmediateState::Idle;
        self.requester.take()
    }
}

impl Default for ImmediateTx {
    fn default() -> Self {
        Self::new()
    }
}
