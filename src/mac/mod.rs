//! Medium Access Control (MAC) layer module.
//! Contains the MAC trait and the DCF implementation.

pub mod config;
pub mod medium;
pub mod contention;
pub mod immediate;
pub mod exchange;
pub mod upper;

pub use config::Config;
pub use upper::{UpperMac, MacEvent, MacStats};

use crate::frame::Frame;

/// Generic MAC trait, implemented by all MACs
pub trait Mac {
    type Error;

    // Queue a frame for transmission
    fn transmit(&mut self, frame: Frame) -> Result<(), Self::Error>;

    // Fetch a received frame
    fn receive(&mut self) -> Result<Option<Frame>, Self::Error>;

    // Check whether the MAC has outstanding work
    fn busy(&mut self) -> Result<bool, Self::Error>;

    // Update the MAC state
    fn tick(&mut self) -> Result<(), Self::Error>;
}
