//! PHY interface used by the MAC
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use crate::Ts;

/// PHY abstraction consumed by the MAC.
///
/// Transmission is fire-and-forget, the PHY reports completion via
/// `UpperMac::transmission_finished` and receptions via
/// `UpperMac::frame_received` / `UpperMac::medium_state_changed`.
pub trait Phy {
    type Error: Debug + Clone + PartialEq;

    /// Start transmission of an encoded frame (FCS bytes included)
    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// On-air duration of a frame of `len` bytes (FCS included) in microseconds
    fn airtime(&self, len: usize) -> Ts;
}

/// OFDM PLCP preamble and SIGNAL field duration
pub const OFDM_PREAMBLE_US: Ts = 20;

/// OFDM symbol duration
pub const OFDM_SYMBOL_US: Ts = 4;

/// 802.11a/g OFDM airtime for a PSDU of `len` bytes at `rate_mbps`
pub fn ofdm_airtime(len: usize, rate_mbps: u32) -> Ts {
    // 16 service bits and 6 tail bits wrap the PSDU
    let bits = 16 + 8 * len as u64 + 6;
    let bits_per_symbol = (rate_mbps.max(1) as u64) * OFDM_SYMBOL_US;
    let symbols = (bits + bits_per_symbol - 1) / bits_per_symbol;

    OFDM_PREAMBLE_US + OFDM_SYMBOL_US * symbols
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use crate::frame::Frame;
    use crate::Ts;

    #[derive(Debug, Clone, PartialEq)]
    pub enum MockPhyError {
        /// Transmission rejected by the mock
        Rejected,
    }

    #[derive(Debug, Default)]
    struct Inner {
        sent: Vec<Vec<u8>>,
        fail: bool,
    }

    /// Mock PHY recording transmitted frames
    #[derive(Clone, Debug)]
    pub struct MockPhy {
        rate_mbps: u32,
        inner: Arc<Mutex<Inner>>,
    }

    impl MockPhy {
        pub fn new(rate_mbps: u32) -> Self {
            Self {
                rate_mbps,
                inner: Arc::new(Mutex::new(Inner::default())),
            }
        }

        /// Reject subsequent transmissions
        pub fn set_fail(&mut self, fail: bool) {
            self.inner.lock().unwrap().fail = fail;
        }

        /// Number of transmissions started so far
        pub fn sent_count(&self) -> usize {
            self.inner.lock().unwrap().sent.len()
        }

        /// Remove and decode transmitted frames
        pub fn take_sent(&mut self) -> Vec<Frame> {
            let sent = core::mem::take(&mut self.inner.lock().unwrap().sent);
            sent.iter().map(|d| Frame::decode(d).unwrap()).collect()
        }

        /// Remove raw transmitted buffers
        pub fn take_raw(&mut self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.inner.lock().unwrap().sent)
        }
    }

    impl super::Phy for MockPhy {
        type Error = MockPhyError;

        fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail {
                return Err(MockPhyError::Rejected);
            }
            inner.sent.push(data.to_vec());
            Ok(())
        }

        fn airtime(&self, len: usize) -> Ts {
            super::ofdm_airtime(len, self.rate_mbps)
        }
    }
}
