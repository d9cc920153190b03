//! DCF crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::Ts;

pub use crate::mac::{Mac, Config as MacConfig, UpperMac, MacEvent, MacStats};
pub use crate::mac::exchange::ExchangeStatus;

pub use crate::error::CoreError;
pub use crate::timer::{Timer as MacTimer};

pub use crate::frame::{Address as MacAddress, Frame, FrameKind, FrameFlags, DecodeError};

pub use crate::phy::Phy;
