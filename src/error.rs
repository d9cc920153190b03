
use core::fmt;

use crate::frame::{DecodeError, Frame};

/// Basic MAC errors
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Transmission queue full, the rejected frame is returned
    BufferFull(Frame),

    /// Payload exceeds the maximum MSDU length, the rejected frame is returned
    PayloadTooLong(Frame),

    /// A transmitter or exchange is already active
    TransmitPending,

    /// PHY already transmitting
    Busy,

    /// Decoding error
    Decode(DecodeError),

    /// Rejected configuration
    InvalidConfig(&'static str),

    /// Wrapper for unhandled / underlying PHY errors
    Phy(E),
}

impl <E: fmt::Debug> fmt::Display for CoreError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::BufferFull(frame) => write!(f, "transmit queue full, dropped frame to {}", frame.receiver),
            CoreError::PayloadTooLong(frame) => write!(f, "{} byte payload to {} exceeds maximum length", frame.payload().len(), frame.receiver),
            CoreError::TransmitPending => write!(f, "transmission already pending"),
            CoreError::Busy => write!(f, "PHY busy"),
            CoreError::Decode(e) => write!(f, "frame decode error: {:?}", e),
            CoreError::InvalidConfig(m) => write!(f, "invalid configuration: {}", m),
            CoreError::Phy(e) => write!(f, "PHY error: {:?}", e),
        }
    }
}

impl <E> From<DecodeError> for CoreError<E> {
    fn from(e: DecodeError) -> Self {
        CoreError::Decode(e)
    }
}

#[cfg(feature = "std")]
impl <E: fmt::Debug> std::error::Error for CoreError<E> {}
