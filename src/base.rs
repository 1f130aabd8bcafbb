// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A websocket [base] frame header and its streaming codec.
//!
//! The decoder is a pure function of the bytes currently in the buffer:
//! it either yields a complete [`Header`] (with the payload unmasked in
//! place) or reports that more bytes are needed, leaving the buffer
//! untouched.
//!
//! [base]: https://tools.ietf.org/html/rfc6455#section-5.2

use crate::Parsing;
use bytes::{BufMut, BytesMut};
use std::{convert::TryFrom, fmt};

/// Maximum size of a frame header in bytes (2 + 8 length + 4 mask).
pub const MAX_HEADER_SIZE: usize = 14;

/// Maximum payload length of a control frame.
pub const MAX_CTRL_PAYLOAD: u64 = 125;

/// If the payload length byte is 126, the following two bytes represent the
/// actual payload length.
const TWO_EXT: u8 = 126;

/// If the payload length byte is 127, the following eight bytes represent
/// the actual payload length.
const EIGHT_EXT: u8 = 127;

// OpCode /////////////////////////////////////////////////////////////////////////////////////////

/// Operation codes defined in [RFC6455](https://tools.ietf.org/html/rfc6455#section-5.2).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    /// A continuation frame of a fragmented message.
    Continue,
    /// A text data frame.
    Text,
    /// A binary data frame.
    Binary,
    /// A close control frame.
    Close,
    /// A ping control frame.
    Ping,
    /// A pong control frame.
    Pong,
    /// A reserved op code.
    Reserved3,
    /// A reserved op code.
    Reserved4,
    /// A reserved op code.
    Reserved5,
    /// A reserved op code.
    Reserved6,
    /// A reserved op code.
    Reserved7,
    /// A reserved op code.
    Reserved11,
    /// A reserved op code.
    Reserved12,
    /// A reserved op code.
    Reserved13,
    /// A reserved op code.
    Reserved14,
    /// A reserved op code.
    Reserved15
}

impl OpCode {
    /// Is this a control opcode?
    pub fn is_control(self) -> bool {
        if let OpCode::Close | OpCode::Ping | OpCode::Pong = self {
            true
        } else {
            false
        }
    }

    /// Is this a data opcode, continuation included?
    pub fn is_data(self) -> bool {
        if let OpCode::Continue | OpCode::Text | OpCode::Binary = self {
            true
        } else {
            false
        }
    }

    /// Is this opcode reserved?
    pub fn is_reserved(self) -> bool {
        match self {
            OpCode::Reserved3
            | OpCode::Reserved4
            | OpCode::Reserved5
            | OpCode::Reserved6
            | OpCode::Reserved7
            | OpCode::Reserved11
            | OpCode::Reserved12
            | OpCode::Reserved13
            | OpCode::Reserved14
            | OpCode::Reserved15 => true,
            _ => false
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OpCode::Continue => f.write_str("Continue"),
            OpCode::Text => f.write_str("Text"),
            OpCode::Binary => f.write_str("Binary"),
            OpCode::Close => f.write_str("Close"),
            OpCode::Ping => f.write_str("Ping"),
            OpCode::Pong => f.write_str("Pong"),
            OpCode::Reserved3 => f.write_str("Reserved:3"),
            OpCode::Reserved4 => f.write_str("Reserved:4"),
            OpCode::Reserved5 => f.write_str("Reserved:5"),
            OpCode::Reserved6 => f.write_str("Reserved:6"),
            OpCode::Reserved7 => f.write_str("Reserved:7"),
            OpCode::Reserved11 => f.write_str("Reserved:11"),
            OpCode::Reserved12 => f.write_str("Reserved:12"),
            OpCode::Reserved13 => f.write_str("Reserved:13"),
            OpCode::Reserved14 => f.write_str("Reserved:14"),
            OpCode::Reserved15 => f.write_str("Reserved:15")
        }
    }
}

/// Error returned by `OpCode::try_from` if an unknown opcode
/// number is encountered.
#[derive(Debug)]
pub struct UnknownOpCode(());

impl fmt::Display for UnknownOpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("unknown opcode")
    }
}

impl std::error::Error for UnknownOpCode {}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(val: u8) -> Result<OpCode, Self::Error> {
        match val {
            0 => Ok(OpCode::Continue),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            3 => Ok(OpCode::Reserved3),
            4 => Ok(OpCode::Reserved4),
            5 => Ok(OpCode::Reserved5),
            6 => Ok(OpCode::Reserved6),
            7 => Ok(OpCode::Reserved7),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            11 => Ok(OpCode::Reserved11),
            12 => Ok(OpCode::Reserved12),
            13 => Ok(OpCode::Reserved13),
            14 => Ok(OpCode::Reserved14),
            15 => Ok(OpCode::Reserved15),
            _ => Err(UnknownOpCode(()))
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> u8 {
        match opcode {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            OpCode::Reserved3 => 3,
            OpCode::Reserved4 => 4,
            OpCode::Reserved5 => 5,
            OpCode::Reserved6 => 6,
            OpCode::Reserved7 => 7,
            OpCode::Reserved11 => 11,
            OpCode::Reserved12 => 12,
            OpCode::Reserved13 => 13,
            OpCode::Reserved14 => 14,
            OpCode::Reserved15 => 15
        }
    }
}

// Header /////////////////////////////////////////////////////////////////////////////////////////

/// A websocket frame header.
#[derive(Debug, Clone)]
pub struct Header {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    masked: bool,
    opcode: OpCode,
    mask: [u8; 4],
    payload_len: u64,
    header_len: usize
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({} (fin {}) (rsv {}{}{}) (mask {}) (len {}))",
            self.opcode,
            self.fin as u8,
            self.rsv1 as u8,
            self.rsv2 as u8,
            self.rsv3 as u8,
            self.masked as u8,
            self.payload_len)
    }
}

impl Header {
    /// Create a new unmasked header with the fin flag set.
    pub fn new(opcode: OpCode) -> Self {
        Header {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            masked: false,
            opcode,
            mask: [0; 4],
            payload_len: 0,
            header_len: 2
        }
    }

    /// Is the `fin` flag set?
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Is the `rsv1` flag set?
    pub fn is_rsv1(&self) -> bool {
        self.rsv1
    }

    /// Is the `rsv2` flag set?
    pub fn is_rsv2(&self) -> bool {
        self.rsv2
    }

    /// Is the `rsv3` flag set?
    pub fn is_rsv3(&self) -> bool {
        self.rsv3
    }

    /// Is the `masked` flag set?
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Get the `opcode`.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Get the masking key.
    pub fn mask(&self) -> [u8; 4] {
        self.mask
    }

    /// The payload length in bytes.
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Set the payload length.
    pub fn set_payload_len(&mut self, len: u64) -> &mut Self {
        self.payload_len = len;
        self
    }

    /// The size of the encoded header in bytes.
    ///
    /// One of 2, 4, 6, 8, 10 or 14.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Header and payload length taken together.
    pub fn total_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

// Codec //////////////////////////////////////////////////////////////////////////////////////////

/// Codec for decoding/encoding websocket frame [`Header`]s.
#[derive(Debug, Clone)]
pub struct Codec {
    /// Maximum permitted payload length per frame.
    max_data_size: u64,
    /// Bits reserved by an extension (rsv1 = 4, rsv2 = 2, rsv3 = 1).
    reserved_bits: u8
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            max_data_size: 256 * 1024 * 1024,
            reserved_bits: 0
        }
    }
}

impl Codec {
    /// Create a new frame codec.
    ///
    /// The codec will accept payload lengths up to 256 MiB
    /// (use `set_max_data_size` to change this value).
    pub fn new() -> Self {
        Codec::default()
    }

    /// Get the configured maximum payload length per frame.
    pub fn max_data_size(&self) -> u64 {
        self.max_data_size
    }

    /// Limit the maximum size of payload data to `size` bytes.
    pub fn set_max_data_size(&mut self, size: u64) -> &mut Self {
        self.max_data_size = size;
        self
    }

    /// Add to the reserved bits in use.
    pub fn add_reserved_bits(&mut self, bits: (bool, bool, bool)) -> &mut Self {
        let (r1, r2, r3) = bits;
        self.reserved_bits |= (r1 as u8) << 2 | (r2 as u8) << 1 | r3 as u8;
        self
    }

    /// Decode the frame at the start of `buf`.
    ///
    /// Returns [`Parsing::NeedMore`] if `buf` holds less than a complete
    /// frame, in which case `buf` is left unchanged. Otherwise the payload
    /// bytes `buf[header_len .. offset]` are unmasked in place and the
    /// header comes back with the frame's total length as the offset;
    /// consuming those bytes is the caller's business.
    pub fn decode(&self, buf: &mut [u8]) -> Result<Parsing<Header>, Error> {
        if buf.len() < 2 {
            return Ok(Parsing::NeedMore)
        }

        let first = buf[0];
        let second = buf[1];

        let fin = first & 0x80 != 0;
        let opcode = OpCode::try_from(first & 0xF)?;
        if opcode.is_reserved() {
            return Err(Error::ReservedOpCode)
        }
        if opcode.is_control() && !fin {
            return Err(Error::FragmentedControl)
        }

        let rsv1 = first & 0x40 != 0;
        if rsv1 && (self.reserved_bits & 4 == 0) {
            return Err(Error::InvalidReservedBit(1))
        }
        let rsv2 = first & 0x20 != 0;
        if rsv2 && (self.reserved_bits & 2 == 0) {
            return Err(Error::InvalidReservedBit(2))
        }
        let rsv3 = first & 0x10 != 0;
        if rsv3 && (self.reserved_bits & 1 == 0) {
            return Err(Error::InvalidReservedBit(3))
        }

        let masked = second & 0x80 != 0;
        let length_code = second & 0x7F;

        let extra = match length_code {
            TWO_EXT => 2,
            EIGHT_EXT => 8,
            _ => 0
        };
        if buf.len() < 2 + extra {
            return Ok(Parsing::NeedMore)
        }

        let payload_len = match extra {
            2 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
            8 => u64::from_be_bytes([buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9]]),
            _ => u64::from(length_code)
        };

        if opcode.is_control() && payload_len > MAX_CTRL_PAYLOAD {
            return Err(Error::InvalidControlFrameLen)
        }
        if payload_len > self.max_data_size {
            return Err(Error::PayloadTooLarge {
                actual: payload_len,
                maximum: self.max_data_size
            })
        }

        let header_len = 2 + extra + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            return Ok(Parsing::NeedMore)
        }

        let mut mask = [0; 4];
        if masked {
            mask.copy_from_slice(&buf[2 + extra .. 2 + extra + 4])
        }

        let total = header_len as u64 + payload_len;
        if (buf.len() as u64) < total {
            return Ok(Parsing::NeedMore)
        }

        let header = Header {
            fin,
            rsv1,
            rsv2,
            rsv3,
            masked,
            opcode,
            mask,
            payload_len,
            header_len
        };

        if masked {
            apply_mask(&mut buf[header_len .. total as usize], mask)
        }

        log::trace!("decoded {}", header);
        Ok(Parsing::Done { value: header, offset: total as usize })
    }

    /// Encode the given header into `buf`.
    pub fn encode_header(header: &Header, buf: &mut BytesMut) {
        let mut first = u8::from(header.opcode());
        if header.is_fin() {
            first |= 0x80
        }
        if header.is_rsv1() {
            first |= 0x40
        }
        if header.is_rsv2() {
            first |= 0x20
        }
        if header.is_rsv3() {
            first |= 0x10
        }
        buf.put_u8(first);

        let len = header.payload_len();
        if len < u64::from(TWO_EXT) {
            buf.put_u8(len as u8)
        } else if len <= u64::from(u16::max_value()) {
            buf.put_u8(TWO_EXT);
            buf.put_u16(len as u16)
        } else {
            buf.put_u8(EIGHT_EXT);
            buf.put_u64(len)
        }
    }
}

/// Apply the (un)masking key to the payload data.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (byte, &key) in buf.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= key
    }
}

// Codec error type ///////////////////////////////////////////////////////////////////////////////

/// Errors produced while decoding a frame header.
#[derive(Debug)]
pub enum Error {
    /// Some unknown opcode number has been decoded.
    UnknownOpCode,
    /// The opcode decoded is reserved.
    ReservedOpCode,
    /// A fragmented control frame (fin bit not set) has been decoded.
    FragmentedControl,
    /// A control frame with an invalid length code has been decoded.
    InvalidControlFrameLen,
    /// A reserved bit was set without an extension claiming it.
    InvalidReservedBit(u8),
    /// The payload length of a frame exceeded the configured maximum.
    PayloadTooLarge {
        /// Length of the rejected frame payload.
        actual: u64,
        /// The configured limit.
        maximum: u64
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownOpCode => f.write_str("unknown opcode"),
            Error::ReservedOpCode => f.write_str("reserved opcode"),
            Error::FragmentedControl => f.write_str("fragmented control frame"),
            Error::InvalidControlFrameLen => f.write_str("invalid control frame length"),
            Error::InvalidReservedBit(i) => write!(f, "invalid reserved bit: {}", i),
            Error::PayloadTooLarge { actual, maximum } =>
                write!(f, "payload too large: len = {}, maximum = {}", actual, maximum)
        }
    }
}

impl std::error::Error for Error {}

impl From<UnknownOpCode> for Error {
    fn from(_: UnknownOpCode) -> Self {
        Error::UnknownOpCode
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

/// Build a masked client-to-server frame for tests.
#[cfg(test)]
pub(crate) fn client_frame(
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    mask: [u8; 4],
    payload: &[u8]
) -> Vec<u8> {
    let mut first = u8::from(opcode);
    if fin {
        first |= 0x80
    }
    if rsv1 {
        first |= 0x40
    }
    let mut buf = vec![first];
    let len = payload.len();
    if len <= 125 {
        buf.push(0x80 | len as u8)
    } else if len <= 65535 {
        buf.push(0x80 | TWO_EXT);
        buf.extend_from_slice(&(len as u16).to_be_bytes())
    } else {
        buf.push(0x80 | EIGHT_EXT);
        buf.extend_from_slice(&(len as u64).to_be_bytes())
    }
    buf.extend_from_slice(&mask);
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start ..], mask);
    buf
}
