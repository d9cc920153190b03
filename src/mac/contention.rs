//! DCF contention (CSMA/CA backoff) transmitter
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{trace, debug};

use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::Frame;
use crate::timer::Alarm;

use super::medium::MediumTracker;

/// Parameters for a single contention attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentionParams {
    /// Interframe space waited before backoff
    pub ifs: Ts,
    /// Interframe space used after a corrupted reception
    pub eifs: Ts,
    /// Minimum contention window
    pub cw_min: u32,
    /// Maximum contention window
    pub cw_max: u32,
    /// Backoff slot duration
    pub slot_time: Ts,
    /// Retransmission count of the frame being sent
    pub retry_count: u8,
}

impl ContentionParams {
    /// Contention window for the current retry count,
    /// `min(cw_max, ((cw_min + 1) << retry_count) - 1)`
    pub fn contention_window(&self) -> u32 {
        let base = self.cw_min as u64 + 1;
        let cw = match self.retry_count {
            r if r < 32 => ((base << r) - 1).min(u32::MAX as u64),
            _ => u32::MAX as u64,
        };
        (cw as u32).min(self.cw_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum ContentionState {
    Idle,
    /// Waiting for the medium to become free
    Defer,
    /// Medium free, waiting out the interframe space
    WaitIfs,
    /// Counting down backoff slots
    Backoff,
    /// Frame handed to the PHY
    Transmit,
}

/// Contention transmitter for a single access category
#[derive(Debug, Clone, PartialEq)]
pub struct ContentionTx {
    ac: usize,
    state: ContentionState,

    frame: Option<Frame>,
    params: Option<ContentionParams>,

    backoff_slots: u32,
    backoff_start: Ts,
    eifs: bool,

    alarm: Alarm,
}

impl ContentionTx {
    pub fn new(ac: usize) -> Self {
        Self {
            ac,
            state: ContentionState::Idle,
            frame: None,
            params: None,
            backoff_slots: 0,
            backoff_start: 0,
            eifs: false,
            alarm: Alarm::new(),
        }
    }

    pub fn state(&self) -> ContentionState {
        self.state
    }

    /// Remaining backoff slots, as of the last freeze or draw
    pub fn backoff_slots(&self) -> u32 {
        self.backoff_slots
    }

    pub fn access_category(&self) -> usize {
        self.ac
    }

    pub(crate) fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    /// Start contending for the medium to send `frame`
    pub fn start<E, R: RngCore>(&mut self, now: Ts, frame: Frame, params: ContentionParams, medium: &MediumTracker, rng: &mut R) -> Result<(), CoreError<E>> {
        if self.state != ContentionState::Idle {
            return Err(CoreError::TransmitPending);
        }

        let cw = params.contention_window();
        self.backoff_slots = backoff_draw(rng, cw);

        debug!("AC{} contention start at {} us (cw: {}, slots: {})", self.ac, now, cw, self.backoff_slots);

        self.frame = Some(frame);
        self.params = Some(params);

        if medium.is_medium_free() {
            self.enter_wait_ifs(now, medium);
        } else {
            self.state = ContentionState::Defer;
        }

        Ok(())
    }

    /// Apply a medium free / busy transition
    pub fn medium_state_changed(&mut self, now: Ts, free: bool, medium: &MediumTracker) {
        match (self.state, free) {
            (ContentionState::Defer, true) => {
                self.enter_wait_ifs(now, medium);
            },
            (ContentionState::WaitIfs, false) => {
                trace!("AC{} IFS interrupted at {} us", self.ac, now);
                self.alarm.cancel();
                self.state = ContentionState::Defer;
            },
            (ContentionState::Backoff, false) => {
                self.freeze(now);
                self.state = ContentionState::Defer;
            },
            _ => (),
        }
    }

    /// Handle alarm expiry, returning the frame to transmit when access is granted
    pub fn handle_timeout(&mut self, now: Ts, medium: &mut MediumTracker) -> Option<Frame> {
        if !self.alarm.take_expired(now) {
            return None;
        }

        match self.state {
            ContentionState::WaitIfs => {
                if self.eifs {
                    medium.clear_eifs();
                    self.eifs = false;
                }
                self.enter_backoff(now)
            },
            ContentionState::Backoff => {
                self.backoff_slots = 0;
                self.enter_transmit(now)
            },
            _ => None,
        }
    }

    /// Transmission of the granted frame has completed
    pub fn transmission_finished(&mut self, now: Ts) {
        if self.state != ContentionState::Transmit {
            return;
        }

        debug!("AC{} transmission finished at {} us", self.ac, now);

        self.state = ContentionState::Idle;
        self.params = None;
    }

    fn enter_wait_ifs(&mut self, now: Ts, medium: &MediumTracker) {
        let params = match self.params {
            Some(p) => p,
            None => return,
        };

        self.eifs = medium.eifs_pending();
        let ifs = match self.eifs {
            true => params.eifs,
            false => params.ifs,
        };

        // Credit idle time already elapsed
        let free_since = medium.free_since().unwrap_or(now);
        let at = free_since + ifs;

        trace!("AC{} waiting {} {} us from {} us", self.ac, if self.eifs { "EIFS" } else { "IFS" }, ifs, free_since);

        self.state = ContentionState::WaitIfs;
        self.alarm.arm(now, at);
    }

    fn enter_backoff(&mut self, now: Ts) -> Option<Frame> {
        if self.backoff_slots == 0 {
            return self.enter_transmit(now);
        }

        let slot_time = self.params.map(|p| p.slot_time).unwrap_or(0);

        trace!("AC{} backoff {} slots at {} us", self.ac, self.backoff_slots, now);

        self.backoff_start = now;
        self.alarm.arm(now, now + self.backoff_slots as Ts * slot_time);
        self.state = ContentionState::Backoff;

        None
    }

    fn enter_transmit(&mut self, now: Ts) -> Option<Frame> {
        debug!("AC{} medium access granted at {} us", self.ac, now);

        self.state = ContentionState::Transmit;
        self.frame.take()
    }

    /// Freeze the backoff countdown, keeping the remaining slots
    fn freeze(&mut self, now: Ts) {
        let slot_time = self.params.map(|p| p.slot_time).unwrap_or(1).max(1);

        let elapsed = (now - self.backoff_start) / slot_time;
        let elapsed = elapsed.min(self.backoff_slots as Ts) as u32;
        self.backoff_slots -= elapsed;

        self.alarm.cancel();

        debug!("AC{} backoff frozen at {} us with {} slots remaining", self.ac, now, self.backoff_slots);
    }
}

/// Uniform draw from `[0, cw]`, rejecting raw values from the incomplete final range
pub(crate) fn backoff_draw<R: RngCore>(rng: &mut R, cw: u32) -> u32 {
    let range = cw as u64 + 1;
    let zone = (1u64 << 32) - (1u64 << 32) % range;

    loop {
        let v = rng.next_u32() as u64;
        if v < zone {
            return (v % range) as u32;
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rand::rngs::mock::StepRng;

    use crate::frame::Address;
    use crate::mac::medium::{ReceptionState, TransmissionState};
    use super::*;

    fn params(retry_count: u8) -> ContentionParams {
        ContentionParams {
            ifs: 34,
            eifs: 94,
            cw_min: 15,
            cw_max: 1023,
            slot_time: 9,
            retry_count,
        }
    }

    fn frame() -> Frame {
        Frame::data(Address::from_u64(2), Address::from_u64(1), Bytes::from_static(&[0xaa; 16]))
    }

    #[test]
    fn contention_window_growth() {
        assert_eq!(params(0).contention_window(), 15);
        assert_eq!(params(1).contention_window(), 31);
        assert_eq!(params(3).contention_window(), 127);
        assert_eq!(params(6).contention_window(), 1023);
        assert_eq!(params(60).contention_window(), 1023);
        assert_eq!(params(255).contention_window(), 1023);
    }

    #[test]
    fn contention_window_bounds() {
        for cw_min in [0, 1, 7, 15, 31, 1023] {
            for cw_max in [cw_min, 63, 1023, 65535] {
                if cw_max < cw_min {
                    continue;
                }
                let mut last = 0;
                for retry in 0..=u8::MAX {
                    let p = ContentionParams { cw_min, cw_max, ..params(retry) };
                    let cw = p.contention_window();
                    assert!(cw >= cw_min && cw <= cw_max);
                    assert!(cw >= last);
                    last = cw;
                }
            }
        }
    }

    #[test]
    fn backoff_draw_rejects_partial_range() {
        // 2^32 - 1 falls in the incomplete final range for cw 2, the next draw is used
        let mut rng = StepRng::new(0xffff_ffff, 2);
        assert_eq!(backoff_draw(&mut rng, 2), 1);

        // Power of two windows never reject
        let mut rng = StepRng::new(0xffff_ffff, 0);
        assert_eq!(backoff_draw(&mut rng, 15), 15);
        assert_eq!(backoff_draw(&mut rng, u32::MAX), u32::MAX);
    }

    #[test]
    fn idle_medium_waits_ifs_then_backoff() {
        let mut medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(3, 0);

        tx.start::<(), _>(100, frame(), params(0), &medium, &mut rng).unwrap();

        // Medium idle since 0, IFS already elapsed
        assert_eq!(tx.state(), ContentionState::WaitIfs);
        assert_eq!(tx.alarm().deadline(), Some(100));
        assert_eq!(tx.handle_timeout(100, &mut medium), None);

        assert_eq!(tx.state(), ContentionState::Backoff);
        assert_eq!(tx.alarm().deadline(), Some(100 + 3 * 9));

        assert_eq!(tx.handle_timeout(126, &mut medium), None);
        let f = tx.handle_timeout(127, &mut medium);
        assert_eq!(f, Some(frame()));
        assert_eq!(tx.state(), ContentionState::Transmit);
        assert_eq!(tx.backoff_slots(), 0);

        tx.transmission_finished(200);
        assert_eq!(tx.state(), ContentionState::Idle);
    }

    #[test]
    fn zero_slots_transmit_at_ifs_end() {
        let mut medium = MediumTracker::new(50);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(0, 0);

        tx.start::<(), _>(60, frame(), params(0), &medium, &mut rng).unwrap();
        assert_eq!(tx.alarm().deadline(), Some(84));
        assert!(tx.handle_timeout(84, &mut medium).is_some());
        assert_eq!(tx.state(), ContentionState::Transmit);
    }

    #[test]
    fn busy_medium_defers() {
        let mut medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(2, 0);

        medium.reception_state_changed(5, ReceptionState::Busy);
        tx.start::<(), _>(10, frame(), params(0), &medium, &mut rng).unwrap();
        assert_eq!(tx.state(), ContentionState::Defer);
        assert!(!tx.alarm().is_armed());

        let free = medium.reception_state_changed(40, ReceptionState::Idle).unwrap();
        tx.medium_state_changed(40, free, &medium);
        assert_eq!(tx.state(), ContentionState::WaitIfs);
        assert_eq!(tx.alarm().deadline(), Some(74));

        // Busy during IFS returns to defer
        let free = medium.reception_state_changed(60, ReceptionState::Busy).unwrap();
        tx.medium_state_changed(60, free, &medium);
        assert_eq!(tx.state(), ContentionState::Defer);
        assert!(!tx.alarm().is_armed());
    }

    #[test]
    fn backoff_freezes_and_resumes() {
        let mut medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(5, 0);

        tx.start::<(), _>(0, frame(), params(0), &medium, &mut rng).unwrap();
        tx.handle_timeout(34, &mut medium);
        assert_eq!(tx.state(), ContentionState::Backoff);
        assert_eq!(tx.backoff_slots(), 5);

        // Busy after 2 full slots (and part of a third)
        let free = medium.reception_state_changed(34 + 2 * 9 + 4, ReceptionState::Busy).unwrap();
        tx.medium_state_changed(56, free, &medium);
        assert_eq!(tx.state(), ContentionState::Defer);
        assert_eq!(tx.backoff_slots(), 3);

        // Resume from IFS with the remaining count
        let free = medium.reception_state_changed(200, ReceptionState::Idle).unwrap();
        tx.medium_state_changed(200, free, &medium);
        tx.handle_timeout(234, &mut medium);
        assert_eq!(tx.state(), ContentionState::Backoff);
        assert_eq!(tx.backoff_slots(), 3);
        assert_eq!(tx.alarm().deadline(), Some(234 + 27));

        assert!(tx.handle_timeout(261, &mut medium).is_some());
    }

    #[test]
    fn backoff_never_increases() {
        let mut medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(40, 0);

        tx.start::<(), _>(0, frame(), params(2), &medium, &mut rng).unwrap();

        let mut now = 0;
        let mut last = tx.backoff_slots();
        let mut sent = false;

        for burst in [7u64, 30, 2, 45, 9, 100, 13] {
            now = tx.alarm().deadline().unwrap_or(now);
            if tx.handle_timeout(now, &mut medium).is_some() {
                sent = true;
                break;
            }

            // Interrupt part way through the countdown
            now += burst;
            if let Some(free) = medium.reception_state_changed(now, ReceptionState::Busy) {
                tx.medium_state_changed(now, free, &medium);
            }
            assert!(tx.backoff_slots() <= last);
            last = tx.backoff_slots();

            now += 50;
            if let Some(free) = medium.reception_state_changed(now, ReceptionState::Idle) {
                tx.medium_state_changed(now, free, &medium);
            }
        }

        while !sent {
            let at = tx.alarm().deadline().unwrap();
            sent = tx.handle_timeout(at, &mut medium).is_some();
            assert!(tx.backoff_slots() <= last);
        }
    }

    #[test]
    fn eifs_after_corrupted_reception() {
        let mut medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(0, 0);

        medium.reception_state_changed(100, ReceptionState::Busy);
        medium.frame_received(200, None, false, Address::from_u64(1));
        medium.reception_state_changed(200, ReceptionState::Idle);

        tx.start::<(), _>(200, frame(), params(0), &medium, &mut rng).unwrap();
        assert_eq!(tx.alarm().deadline(), Some(200 + 94));

        assert!(tx.handle_timeout(294, &mut medium).is_some());
        assert!(!medium.eifs_pending());
    }

    #[test]
    fn start_while_active_is_rejected() {
        let medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(0, 0);

        tx.start::<(), _>(0, frame(), params(0), &medium, &mut rng).unwrap();
        assert_eq!(
            tx.start::<(), _>(1, frame(), params(0), &medium, &mut rng),
            Err(CoreError::TransmitPending)
        );
    }

    #[test]
    fn transmit_ignores_medium_changes() {
        let mut medium = MediumTracker::new(0);
        let mut tx = ContentionTx::new(0);
        let mut rng = StepRng::new(0, 0);

        tx.start::<(), _>(100, frame(), params(0), &medium, &mut rng).unwrap();
        tx.handle_timeout(100, &mut medium).unwrap();

        let free = medium.transmission_state_changed(100, TransmissionState::Transmitting).unwrap();
        tx.medium_state_changed(100, free, &medium);
        assert_eq!(tx.state(), ContentionState::Transmit);
    }
}
