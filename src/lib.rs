//! IEEE 802.11 Distributed Coordination Function MAC
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

#![no_std]

#[cfg(any(test, feature="std"))]
extern crate std;

pub mod timer;

pub mod frame;

pub mod phy;

pub mod mac;

pub mod error;

#[cfg(any(test, feature="mocks"))]
pub mod sim;

pub mod prelude;


/// Timestamps are 64-bit in microseconds
pub type Ts = u64;
