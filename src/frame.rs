//! IEEE 802.11 MAC frames
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

/// Length of the frame check sequence, computed by the PHY
pub const FCS_LEN: usize = 4;

/// Data frame header length (frame control through sequence control)
pub const DATA_HEADER_LEN: usize = 24;

/// On-air RTS length including FCS
pub const RTS_LEN: usize = 20;

/// On-air CTS length including FCS
pub const CTS_LEN: usize = 14;

/// On-air ACK length including FCS
pub const ACK_LEN: usize = 14;

/// Maximum MSDU carried in a single data frame
pub const MAX_PAYLOAD_LEN: usize = 2304;

/// Maximum on-air frame length
pub const MAX_FRAME_LEN: usize = DATA_HEADER_LEN + MAX_PAYLOAD_LEN + FCS_LEN;

/// Duration values at or above this are not NAV durations
pub const DURATION_ID_MASK: u16 = 0x8000;

/// Sequence numbers are 12 bits
pub const SEQ_MODULO: u16 = 4096;

/// 48-bit IEEE MAC address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const BROADCAST: Address = Address([0xff; 6]);

    /// Placeholder for frames that do not carry a transmitter address (CTS / ACK)
    pub const UNSPECIFIED: Address = Address([0x00; 6]);

    /// Build an address from the low 48 bits of `v`
    pub fn from_u64(v: u64) -> Self {
        let mut a = [0u8; 6];
        for (i, b) in a.iter_mut().enumerate() {
            *b = (v >> (8 * (5 - i))) as u8;
        }
        Address(a)
    }

    /// Group addresses (including broadcast) have the I/G bit set
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    fn decode(buff: &[u8]) -> Self {
        let mut a = [0u8; 6];
        a.copy_from_slice(&buff[..6]);
        Address(a)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a[0], a[1], a[2], a[3], a[4], a[5])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Frame kinds handled by the DCF
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FrameKind {
    Data,
    Rts,
    Cts,
    Ack,
}

// Frame control byte 0: protocol version (bits 0-1), type (bits 2-3), subtype (bits 4-7)
const FC_DATA: u8 = 0b0000_1000;
const FC_RTS: u8 = 0b1011_0100;
const FC_CTS: u8 = 0b1100_0100;
const FC_ACK: u8 = 0b1101_0100;

const FC_VERSION_MASK: u8 = 0b0000_0011;

impl FrameKind {
    fn frame_control(&self) -> u8 {
        match self {
            FrameKind::Data => FC_DATA,
            FrameKind::Rts => FC_RTS,
            FrameKind::Cts => FC_CTS,
            FrameKind::Ack => FC_ACK,
        }
    }

    fn from_frame_control(fc: u8) -> Result<Self, DecodeError> {
        if fc & FC_VERSION_MASK != 0 {
            return Err(DecodeError::InvalidVersion(fc & FC_VERSION_MASK));
        }

        match fc {
            FC_DATA => Ok(FrameKind::Data),
            FC_RTS => Ok(FrameKind::Rts),
            FC_CTS => Ok(FrameKind::Cts),
            FC_ACK => Ok(FrameKind::Ack),
            _ => Err(DecodeError::UnsupportedType(fc)),
        }
    }

    /// Header length excluding FCS
    fn header_len(&self) -> usize {
        match self {
            FrameKind::Data => DATA_HEADER_LEN,
            FrameKind::Rts => RTS_LEN - FCS_LEN,
            FrameKind::Cts => CTS_LEN - FCS_LEN,
            FrameKind::Ack => ACK_LEN - FCS_LEN,
        }
    }
}

bitflags::bitflags!{
    /// Frame control flags (byte 1)
    pub struct FrameFlags: u8 {
        const TO_DS          = 0b0000_0001;
        const FROM_DS        = 0b0000_0010;
        const MORE_FRAGMENTS = 0b0000_0100;
        /// Frame is a retransmission
        const RETRY          = 0b0000_1000;
        const POWER_MGMT     = 0b0001_0000;
        const MORE_DATA      = 0b0010_0000;
        const PROTECTED      = 0b0100_0000;
        const ORDER          = 0b1000_0000;
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeError {
    NotEnoughBytes,
    InvalidVersion(u8),
    UnsupportedType(u8),
    PayloadTooLong(usize),
}

/// MAC frame with owned payload.
///
/// `ac` selects the contention engine used to send the frame and is not
/// carried on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: FrameFlags,
    /// NAV duration in microseconds
    pub duration: u16,
    pub receiver: Address,
    pub transmitter: Address,
    pub seq: u16,
    pub ac: u8,
    payload: Bytes,
}

impl Frame {
    pub fn data(receiver: Address, transmitter: Address, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Data,
            flags: FrameFlags::empty(),
            duration: 0,
            receiver,
            transmitter,
            seq: 0,
            ac: 0,
            payload,
        }
    }

    pub fn rts(receiver: Address, transmitter: Address, duration: u16) -> Frame {
        Frame {
            kind: FrameKind::Rts,
            flags: FrameFlags::empty(),
            duration,
            receiver,
            transmitter,
            seq: 0,
            ac: 0,
            payload: Bytes::new(),
        }
    }

    pub fn cts(receiver: Address, duration: u16) -> Frame {
        Frame {
            kind: FrameKind::Cts,
            flags: FrameFlags::empty(),
            duration,
            receiver,
            transmitter: Address::UNSPECIFIED,
            seq: 0,
            ac: 0,
            payload: Bytes::new(),
        }
    }

    pub fn ack(receiver: Address, duration: u16) -> Frame {
        Frame {
            kind: FrameKind::Ack,
            flags: FrameFlags::empty(),
            duration,
            receiver,
            transmitter: Address::UNSPECIFIED,
            seq: 0,
            ac: 0,
            payload: Bytes::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn is_retry(&self) -> bool {
        self.flags.contains(FrameFlags::RETRY)
    }

    pub fn set_retry(&mut self, retry: bool) {
        self.flags.set(FrameFlags::RETRY, retry);
    }

    /// NAV duration carried by this frame, if the field holds one
    pub fn nav_duration(&self) -> Option<u16> {
        if self.duration & DURATION_ID_MASK == 0 {
            Some(self.duration)
        } else {
            None
        }
    }

    /// On-air length in bytes, including FCS
    pub fn len(&self) -> usize {
        self.kind.header_len() + self.payload.len() + FCS_LEN
    }

    /// Encode into the provided buffer, returning the on-air length.
    ///
    /// The FCS is left zeroed for the PHY to fill.
    pub fn encode(&self, buff: &mut [u8]) -> Result<usize, DecodeError> {
        let len = self.len();
        if buff.len() < len {
            return Err(DecodeError::NotEnoughBytes);
        }

        buff[0] = self.kind.frame_control();
        buff[1] = self.flags.bits();
        LittleEndian::write_u16(&mut buff[2..], self.duration);
        buff[4..10].copy_from_slice(&self.receiver.0);

        let mut offset = 10;

        match self.kind {
            FrameKind::Rts => {
                buff[10..16].copy_from_slice(&self.transmitter.0);
                offset = 16;
            },
            FrameKind::Data => {
                buff[10..16].copy_from_slice(&self.transmitter.0);
                // Wildcard BSSID
                buff[16..22].copy_from_slice(&Address::BROADCAST.0);
                LittleEndian::write_u16(&mut buff[22..], (self.seq % SEQ_MODULO) << 4);
                offset = DATA_HEADER_LEN;

                buff[offset..offset+self.payload.len()].copy_from_slice(&self.payload);
                offset += self.payload.len();
            },
            FrameKind::Cts | FrameKind::Ack => (),
        }

        // FCS placeholder
        for b in &mut buff[offset..offset+FCS_LEN] {
            *b = 0;
        }

        Ok(offset + FCS_LEN)
    }

    /// Decode a frame received with its FCS
    pub fn decode(buff: &[u8]) -> Result<Self, DecodeError> {
        if buff.len() < 2 {
            return Err(DecodeError::NotEnoughBytes);
        }

        let kind = FrameKind::from_frame_control(buff[0])?;
        let flags = FrameFlags::from_bits_truncate(buff[1]);

        let header_len = kind.header_len();
        if buff.len() < header_len + FCS_LEN {
            return Err(DecodeError::NotEnoughBytes);
        }

        let duration = LittleEndian::read_u16(&buff[2..]);
        let receiver = Address::decode(&buff[4..]);

        let (transmitter, seq, payload) = match kind {
            FrameKind::Rts => (Address::decode(&buff[10..]), 0, Bytes::new()),
            FrameKind::Data => {
                let seq = LittleEndian::read_u16(&buff[22..]) >> 4;
                let body = &buff[DATA_HEADER_LEN..buff.len() - FCS_LEN];
                if body.len() > MAX_PAYLOAD_LEN {
                    return Err(DecodeError::PayloadTooLong(body.len()));
                }
                (Address::decode(&buff[10..]), seq, Bytes::copy_from_slice(body))
            },
            FrameKind::Cts | FrameKind::Ack => (Address::UNSPECIFIED, 0, Bytes::new()),
        };

        Ok(Frame {
            kind,
            flags,
            duration,
            receiver,
            transmitter,
            seq,
            ac: 0,
            payload,
        })
    }
}

#[cfg(feature = "std")]
impl From<Frame> for std::vec::Vec<u8> {
    fn from(frame: Frame) -> std::vec::Vec<u8> {
        let mut buff = std::vec![0u8; frame.len()];
        let n = frame.encode(&mut buff).unwrap_or(0);
        buff.truncate(n);
        buff
    }
}
