//! Frame codec
//!
//! Request/response framing for the controller's register protocol:
//!
//! ```text
//! Request:  [addr][func][category][index][page][count][value..][crc_lo][crc_hi]
//! Response: [addr][func][byte_count][payload..][crc_lo][crc_hi]
//! ```
//!
//! CRC16 uses polynomial feedback 0xA001 with initial value 0xFFFF. A frame
//! validates when the CRC computed over the whole frame, CRC bytes included,
//! is zero.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::hex;

/// Fixed device address of the controller
pub const DEVICE_ADDR: u8 = 0x01;

/// Response overhead: address + function + byte count + 2 CRC bytes
pub const RESPONSE_OVERHEAD: usize = 5;

/// Longest request on the wire (masked write)
pub const MAX_REQUEST_LEN: usize = 12;

/// Largest block a single read may request
pub const MAX_READ_WORDS: u8 = 11;

/// Protocol function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    Read = 0x43,
    Write = 0x44,
    WriteMasked = 0x45,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x43 => Some(Self::Read),
            0x44 => Some(Self::Write),
            0x45 => Some(Self::WriteMasked),
            _ => None,
        }
    }
}

/// Register categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Category {
    /// Temperature sensor elements, one page per element
    Elements = 0x01,
    /// Packed per-channel settings, one page per channel
    Packed = 0x02,
    /// Channel status, one page per channel
    Channels = 0x03,
}

impl Category {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Elements),
            0x02 => Some(Self::Packed),
            0x03 => Some(Self::Channels),
            _ => None,
        }
    }
}

/// Three-part register address (category, page, index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    pub category: Category,
    /// Instance selector (0-based channel or element)
    pub page: u8,
    /// Field offset within the instance block
    pub index: u8,
}

impl RegisterAddress {
    pub const fn new(category: Category, page: u8, index: u8) -> Self {
        Self {
            category,
            page,
            index,
        }
    }

    /// Address of the word `offset` positions further in the same block
    pub fn offset(&self, offset: u8) -> Self {
        Self {
            index: self.index.wrapping_add(offset),
            ..*self
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[page={}, index=0x{:02X}]",
            self.category, self.page, self.index
        )
    }
}

/// A single request to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Read {
        addr: RegisterAddress,
        count: u8,
    },
    Write {
        addr: RegisterAddress,
        value: u16,
    },
    /// `next = (current & and_mask) | or_mask`, applied by the controller
    WriteMasked {
        addr: RegisterAddress,
        and_mask: u16,
        or_mask: u16,
    },
}

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::Read { .. } => FunctionCode::Read,
            Request::Write { .. } => FunctionCode::Write,
            Request::WriteMasked { .. } => FunctionCode::WriteMasked,
        }
    }

    pub fn address(&self) -> RegisterAddress {
        match self {
            Request::Read { addr, .. }
            | Request::Write { addr, .. }
            | Request::WriteMasked { addr, .. } => *addr,
        }
    }

    /// Build the complete wire frame including CRC
    pub fn encode(&self, device: u8) -> Vec<u8> {
        let addr = self.address();
        let mut frame = BytesMut::with_capacity(MAX_REQUEST_LEN);
        frame.put_u8(device);
        frame.put_u8(self.function_code() as u8);
        frame.put_u8(addr.category as u8);
        frame.put_u8(addr.index);
        frame.put_u8(addr.page);

        match *self {
            Request::Read { count, .. } => {
                frame.put_u8(count);
            },
            Request::Write { value, .. } => {
                frame.put_u8(1);
                frame.put_u16(value);
            },
            Request::WriteMasked {
                and_mask, or_mask, ..
            } => {
                let (value, mask) = masked_wire_pair(and_mask, or_mask);
                frame.put_u8(1);
                frame.put_u16(value);
                frame.put_u16(mask);
            },
        }

        let crc = crc16(&frame);
        frame.put_u16_le(crc);

        debug!(
            "Building frame: FC={:02X}, {}, len={}, CRC={:04X}",
            self.function_code() as u8,
            addr,
            frame.len(),
            crc
        );

        frame.to_vec()
    }
}

/// Calculate CRC16 checksum (poly 0xA001, init 0xFFFF, table-free)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Append the CRC of `frame` in wire order (low byte first)
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// A frame validates iff the CRC over the whole frame is zero
pub fn crc_valid(frame: &[u8]) -> bool {
    frame.len() >= 2 && crc16(frame) == 0
}

/// Logical result of a masked write
pub fn apply_mask(current: u16, and_mask: u16, or_mask: u16) -> u16 {
    (current & and_mask) | or_mask
}

/// Convert `(and_mask, or_mask)` into the controller's `(value, mask)` pair
///
/// The controller computes `(current & !mask) | (value & mask)`.
pub fn masked_wire_pair(and_mask: u16, or_mask: u16) -> (u16, u16) {
    (or_mask, !and_mask | or_mask)
}

/// Masked write as the controller applies it from the wire pair
pub fn apply_wire_mask(current: u16, value: u16, mask: u16) -> u16 {
    (current & !mask) | (value & mask)
}

/// Decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub address: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Response {
    /// Payload as big-endian 16-bit words
    pub fn words(&self) -> Result<Vec<u16>> {
        if self.payload.len() % 2 != 0 {
            return Err(ProtocolError::frame(format!(
                "Odd payload length: {}",
                self.payload.len()
            )));
        }
        Ok(self
            .payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Outcome of inspecting the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// Not enough bytes yet to know or reach the frame length
    Incomplete,
    /// A CRC-valid frame occupying the first `consumed` bytes
    Complete { response: Response, consumed: usize },
}

/// Expected total response length once the byte count has arrived
pub fn expected_response_len(buf: &[u8]) -> Option<usize> {
    buf.get(2).map(|count| *count as usize + RESPONSE_OVERHEAD)
}

/// Try to decode a response from the start of `buf`
///
/// Returns `CrcMismatch` when enough bytes for the announced length have
/// arrived but the frame does not validate.
pub fn parse_response(buf: &[u8]) -> Result<ParseStatus> {
    let expected = match expected_response_len(buf) {
        Some(len) => len,
        None => return Ok(ParseStatus::Incomplete),
    };
    if buf.len() < expected {
        return Ok(ParseStatus::Incomplete);
    }

    let frame = &buf[..expected];
    if !crc_valid(frame) {
        return Err(ProtocolError::CrcMismatch {
            preview: hex::preview(frame),
        });
    }

    Ok(ParseStatus::Complete {
        response: Response {
            address: frame[0],
            function: frame[1],
            payload: frame[3..expected - 2].to_vec(),
        },
        consumed: expected,
    })
}

/// Build a response frame (controller side)
pub fn encode_response(device: u8, function: u8, words: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_OVERHEAD + words.len() * 2);
    frame.push(device);
    frame.push(function);
    frame.push((words.len() * 2) as u8);
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Decode a request frame (controller side)
pub fn decode_request(frame: &[u8]) -> Result<(u8, Request)> {
    if frame.len() < 8 {
        return Err(ProtocolError::frame(format!(
            "Request too short: {} bytes",
            frame.len()
        )));
    }
    if !crc_valid(frame) {
        return Err(ProtocolError::CrcMismatch {
            preview: hex::preview(frame),
        });
    }

    let device = frame[0];
    let function = FunctionCode::from_u8(frame[1])
        .ok_or_else(|| ProtocolError::frame(format!("Unknown function 0x{:02X}", frame[1])))?;
    let category = Category::from_u8(frame[2])
        .ok_or_else(|| ProtocolError::frame(format!("Unknown category 0x{:02X}", frame[2])))?;
    let addr = RegisterAddress::new(category, frame[4], frame[3]);
    let word = |at: usize| u16::from_be_bytes([frame[at], frame[at + 1]]);

    let request = match function {
        FunctionCode::Read => Request::Read {
            addr,
            count: frame[5],
        },
        FunctionCode::Write if frame.len() == 10 => Request::Write {
            addr,
            value: word(6),
        },
        FunctionCode::WriteMasked if frame.len() == 12 => {
            let (value, mask) = (word(6), word(8));
            // Inverse of masked_wire_pair: bits outside the mask are kept
            Request::WriteMasked {
                addr,
                and_mask: !mask,
                or_mask: value & mask,
            }
        },
        _ => {
            return Err(ProtocolError::frame(format!(
                "Bad length {} for FC={:02X}",
                frame.len(),
                function as u8
            )))
        },
    };

    Ok((device, request))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CONFIG: RegisterAddress = RegisterAddress::new(Category::Packed, 3, 0x07);

    #[test]
    fn test_crc16_known_vector() {
        // Standard Modbus check value for "123456789"
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_read_request_layout() {
        let frame = Request::Read {
            addr: CONFIG,
            count: 1,
        }
        .encode(DEVICE_ADDR);
        assert_eq!(&frame[..6], &[0x01, 0x43, 0x02, 0x07, 0x03, 0x01]);
        assert_eq!(frame.len(), 8);
        assert!(crc_valid(&frame));
    }

    #[test]
    fn test_write_request_layout() {
        let frame = Request::Write {
            addr: CONFIG,
            value: 0x1234,
        }
        .encode(DEVICE_ADDR);
        assert_eq!(&frame[..8], &[0x01, 0x44, 0x02, 0x07, 0x03, 0x01, 0x12, 0x34]);
        assert_eq!(frame.len(), 10);
        assert!(crc_valid(&frame));
    }

    #[test]
    fn test_masked_request_roundtrip() {
        let request = Request::WriteMasked {
            addr: CONFIG,
            and_mask: !0x0007,
            or_mask: 0x0001,
        };
        let frame = request.encode(DEVICE_ADDR);
        assert_eq!(frame.len(), MAX_REQUEST_LEN);
        let (device, decoded) = decode_request(&frame).unwrap();
        assert_eq!(device, DEVICE_ADDR);
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_parse_response_incomplete_until_length_known() {
        let frame = encode_response(DEVICE_ADDR, 0x43, &[0x00D2, 0x00EA]);
        assert_eq!(parse_response(&frame[..2]).unwrap(), ParseStatus::Incomplete);
        assert_eq!(parse_response(&frame[..7]).unwrap(), ParseStatus::Incomplete);

        match parse_response(&frame).unwrap() {
            ParseStatus::Complete { response, consumed } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(response.words().unwrap(), vec![0x00D2, 0x00EA]);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_crc_failure() {
        let mut frame = encode_response(DEVICE_ADDR, 0x43, &[0x0001]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_response(&frame),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_request_rejects_unknown_function() {
        let mut frame = vec![0x01, 0x03, 0x02, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert!(matches!(
            decode_request(&frame),
            Err(ProtocolError::Frame(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_crc_appended_validates(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut frame = data.clone();
            append_crc(&mut frame);
            prop_assert_eq!(crc16(&frame), 0);
        }

        #[test]
        fn prop_response_length_is_payload_plus_five(
            words in proptest::collection::vec(any::<u16>(), 0..12)
        ) {
            let frame = encode_response(DEVICE_ADDR, 0x43, &words);
            prop_assert_eq!(frame.len(), words.len() * 2 + RESPONSE_OVERHEAD);
            match parse_response(&frame).unwrap() {
                ParseStatus::Complete { consumed, response } => {
                    prop_assert_eq!(consumed, response.payload.len() + RESPONSE_OVERHEAD);
                }
                ParseStatus::Incomplete => prop_assert!(false, "complete frame not recognised"),
            }
        }

        #[test]
        fn prop_truncated_response_never_accepted(
            words in proptest::collection::vec(any::<u16>(), 1..12),
            cut in 1usize..4
        ) {
            let frame = encode_response(DEVICE_ADDR, 0x43, &words);
            let short = &frame[..frame.len() - cut];
            prop_assert_eq!(parse_response(short).unwrap(), ParseStatus::Incomplete);
        }

        #[test]
        fn prop_masked_write_semantics(current: u16, and_mask: u16, or_mask: u16) {
            let expected = (current & and_mask) | or_mask;
            prop_assert_eq!(apply_mask(current, and_mask, or_mask), expected);
            let (value, mask) = masked_wire_pair(and_mask, or_mask);
            prop_assert_eq!(apply_wire_mask(current, value, mask), expected);
        }
    }
}
