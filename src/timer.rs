//! DCF Timer API
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use crate::Ts;

/// Timer trait provides mechanisms for accessing monotonic times
/// to assist with procotol implementations.
///
/// All methods are monotonic and relative to the same unknown epoc
pub trait Timer {
    /// Returns the number of millisecond ticks since some unknown epoc
    fn ticks_ms(&self) -> u64;

    /// Returns the number of microsecond ticks since some unknown epoc
    fn ticks_us(&self) -> u64;
}

/// One-shot deadline owned by the state machine that armed it.
///
/// Alarms are never shared, a state machine cancels its alarm when leaving
/// the state that armed it so an expiry can only be observed by its owner
/// while still in that state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Alarm {
    deadline: Option<(Ts, Ts)>,
}

impl Alarm {
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm (or re-arm) the alarm to expire at `at`, `now` is recorded
    /// to order alarms expiring at the same instant
    pub fn arm(&mut self, now: Ts, at: Ts) {
        self.deadline = Some((at.max(now), now));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Expiry time, if armed
    pub fn deadline(&self) -> Option<Ts> {
        self.deadline.map(|(at, _)| at)
    }

    /// Expiry and arming times, used for ordering
    pub(crate) fn key(&self) -> Option<(Ts, Ts)> {
        self.deadline
    }

    pub fn is_expired(&self, now: Ts) -> bool {
        match self.deadline {
            Some((at, _)) => at <= now,
            None => false,
        }
    }

    /// Disarm and return true if the alarm has expired
    pub fn take_expired(&mut self, now: Ts) -> bool {
        if self.is_expired(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    /// Mock timer implementation to assist with testing
    #[derive(Clone, Debug)]
    pub struct MockTimer (Arc<Mutex<u64>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(0)))
        }

        pub fn set_ms(&mut self, val: u32) {
            *self.0.lock().unwrap() = val as u64 * 1000;
        }

        pub fn set_us(&mut self, val: u64) {
            *self.0.lock().unwrap() = val;
        }

        pub fn inc_us(&mut self, val: u64) {
            let mut v  = self.0.lock().unwrap();
            *v += val;
        }

        pub fn val(&self) -> u64 {
            *self.0.lock().unwrap()
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_ms(&self) -> u64 {
            let v = self.0.lock().unwrap();
            return *v / 1000
        }

        fn ticks_us(&self) -> u64 {
            let v = self.0.lock().unwrap();
            return *v
        }
    }
}
