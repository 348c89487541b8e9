//! Application data units for the two supported transports.
//!
//! Both encodings expose the same [`Framer`] capability so that dispatch never
//! needs to know which wire a request arrived on.

use std::fmt::Debug;

use thiserror::Error;

use crate::crc;
use crate::exception::Exception;

/// MBAP header: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest RTU ADU: address, 253 byte PDU, CRC.
pub const RTU_MAX_LEN: usize = 256;

/// Largest MBAP ADU: header plus 253 byte PDU.
pub const TCP_MAX_LEN: usize = 260;

const RTU_MIN_LEN: usize = 4;

/// Bytes that cannot be trusted as a request. Never reported to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("length mismatch: header declares {declared} bytes, {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid protocol id: {0}")]
    InvalidProtocolId(u16),
}

/// One request or response, independent of its framing.
pub trait Framer: Debug + Send {
    /// Slave (unit) address.
    fn address(&self) -> u8;

    /// Function code; has the high bit set on exception responses.
    fn function(&self) -> u8;

    /// PDU bytes following the function code.
    fn payload(&self) -> &[u8];

    fn set_payload(&mut self, payload: Vec<u8>);

    /// Turn the frame into an exception response for its current function code.
    fn set_exception(&mut self, exception: Exception);

    /// A response frame addressed to the same unit (and transaction) as `self`.
    fn copy_as_response(&self) -> Box<dyn Framer>;

    /// Complete wire representation.
    fn to_bytes(&self) -> Vec<u8>;
}

/// Serial RTU framing: `[address][function][payload..][crc lo][crc hi]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    address: u8,
    function: u8,
    payload: Vec<u8>,
    crc: u16,
}

impl RtuFrame {
    pub fn new(address: u8, function: u8, payload: Vec<u8>) -> Self {
        let mut frame = Self {
            address,
            function,
            payload,
            crc: 0,
        };
        frame.crc = frame.calculate_crc();
        frame
    }

    /// Parse a complete RTU frame, verifying its checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < RTU_MIN_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let (calculated, received) =
            crc::checksums(bytes).ok_or(FrameError::TooShort(bytes.len()))?;
        if calculated != received {
            return Err(FrameError::CrcMismatch {
                expected: calculated,
                received,
            });
        }

        Ok(Self {
            address: bytes[0],
            function: bytes[1],
            payload: bytes[2..bytes.len() - 2].to_vec(),
            crc: received,
        })
    }

    /// Checksum carried by the frame.
    pub fn crc(&self) -> u16 {
        self.crc
    }

    fn calculate_crc(&self) -> u16 {
        let mut body = Vec::with_capacity(2 + self.payload.len());
        body.push(self.address);
        body.push(self.function);
        body.extend_from_slice(&self.payload);
        crc::crc16(&body)
    }
}

impl Framer for RtuFrame {
    fn address(&self) -> u8 {
        self.address
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
        self.crc = self.calculate_crc();
    }

    fn set_exception(&mut self, exception: Exception) {
        self.function |= 0x80;
        self.set_payload(vec![exception.code()]);
    }

    fn copy_as_response(&self) -> Box<dyn Framer> {
        Box::new(self.clone())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        bytes.push(self.address);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.crc.to_le_bytes());
        bytes
    }
}

/// Modbus TCP framing: MBAP header followed by the PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    transaction_id: u16,
    protocol_id: u16,
    length: u16,
    unit_id: u8,
    function: u8,
    payload: Vec<u8>,
}

impl TcpFrame {
    pub fn new(transaction_id: u16, unit_id: u8, function: u8, payload: Vec<u8>) -> Self {
        let mut frame = Self {
            transaction_id,
            protocol_id: 0,
            length: 0,
            unit_id,
            function,
            payload: Vec::new(),
        };
        frame.set_payload(payload);
        frame
    }

    /// Parse a complete MBAP frame. The declared length must match exactly.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MBAP_HEADER_LEN + 1 {
            return Err(FrameError::TooShort(bytes.len()));
        }

        let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        if protocol_id != 0 {
            return Err(FrameError::InvalidProtocolId(protocol_id));
        }

        let length = u16::from_be_bytes([bytes[4], bytes[5]]);
        let actual = bytes.len() - 6;
        if length as usize != actual {
            return Err(FrameError::LengthMismatch {
                declared: length as usize,
                actual,
            });
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id,
            length,
            unit_id: bytes[6],
            function: bytes[7],
            payload: bytes[8..].to_vec(),
        })
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Bytes following the length field, as declared in the header.
    pub fn length(&self) -> u16 {
        self.length
    }
}

impl Framer for TcpFrame {
    fn address(&self) -> u8 {
        self.unit_id
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn set_payload(&mut self, payload: Vec<u8>) {
        // unit id + function code + payload
        self.length = (payload.len() + 2) as u16;
        self.payload = payload;
    }

    fn set_exception(&mut self, exception: Exception) {
        self.function |= 0x80;
        self.set_payload(vec![exception.code()]);
    }

    fn copy_as_response(&self) -> Box<dyn Framer> {
        Box::new(self.clone())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MBAP_HEADER_LEN + 1 + self.payload.len());
        bytes.extend_from_slice(&self.transaction_id.to_be_bytes());
        bytes.extend_from_slice(&self.protocol_id.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes.push(self.unit_id);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_HOLDING: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];

    #[test]
    fn test_rtu_decode() {
        let frame = RtuFrame::decode(&READ_HOLDING).unwrap();
        assert_eq!(frame.address(), 1);
        assert_eq!(frame.function(), 3);
        assert_eq!(frame.payload(), &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(frame.crc(), 0xCDC5);
        assert_eq!(frame.to_bytes(), READ_HOLDING.to_vec());
    }

    #[test]
    fn test_rtu_decode_too_short() {
        assert_eq!(
            RtuFrame::decode(&[0x01, 0x03, 0xC5]),
            Err(FrameError::TooShort(3))
        );
    }

    #[test]
    fn test_rtu_any_appended_crc_decodes() {
        let bodies: [&[u8]; 3] = [
            &[0x00, 0x00],
            &[0x07, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0xDE, 0xAD, 0xBE, 0xEF],
            &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
        ];
        for body in bodies {
            let mut bytes = body.to_vec();
            bytes.extend_from_slice(&crc::crc16(body).to_le_bytes());
            let frame = RtuFrame::decode(&bytes).unwrap();
            assert_eq!(frame.to_bytes(), bytes);
        }
    }

    #[test]
    fn test_rtu_single_bit_flip_is_rejected() {
        for bit in 0..READ_HOLDING.len() * 8 {
            let mut bytes = READ_HOLDING;
            bytes[bit / 8] ^= 1 << (bit % 8);
            assert!(
                matches!(RtuFrame::decode(&bytes), Err(FrameError::CrcMismatch { .. })),
                "bit {bit} flipped but frame decoded"
            );
        }
    }

    #[test]
    fn test_rtu_exception_response() {
        let request = RtuFrame::decode(&READ_HOLDING).unwrap();
        let mut response = request.copy_as_response();
        response.set_exception(Exception::IllegalDataAddress);

        let bytes = response.to_bytes();
        assert_eq!(&bytes[..3], &[0x01, 0x83, 0x02]);
        assert!(crc::validate(&bytes));
    }

    #[test]
    fn test_rtu_set_payload_refreshes_crc() {
        let mut frame = RtuFrame::new(0x01, 0x03, vec![]);
        frame.set_payload(vec![0x02, 0x00, 0x2A]);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 7);
        assert!(crc::validate(&bytes));
    }

    #[test]
    fn test_tcp_decode() {
        let bytes = [
            0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03,
        ];
        let frame = TcpFrame::decode(&bytes).unwrap();
        assert_eq!(frame.transaction_id(), 0x2A);
        assert_eq!(frame.address(), 0x11);
        assert_eq!(frame.function(), 0x03);
        assert_eq!(frame.length(), 6);
        assert_eq!(frame.payload(), &[0x00, 0x6B, 0x00, 0x03]);
        assert_eq!(frame.to_bytes(), bytes.to_vec());
    }

    #[test]
    fn test_tcp_decode_errors() {
        assert_eq!(
            TcpFrame::decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01]),
            Err(FrameError::TooShort(7))
        );
        assert_eq!(
            TcpFrame::decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00]),
            Err(FrameError::LengthMismatch {
                declared: 6,
                actual: 3
            })
        );
        assert_eq!(
            TcpFrame::decode(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03]),
            Err(FrameError::InvalidProtocolId(1))
        );
    }

    #[test]
    fn test_tcp_response_keeps_transaction() {
        let request = TcpFrame::new(0x1234, 0x01, 0x04, vec![0x00, 0x05, 0x00, 0x01]);
        let mut response = request.copy_as_response();
        response.set_payload(vec![0x02, 0x00, 0x07]);
        assert_eq!(
            response.to_bytes(),
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x01, 0x04, 0x02, 0x00, 0x07]
        );

        response.set_exception(Exception::IllegalFunction);
        assert_eq!(
            response.to_bytes(),
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x03, 0x01, 0x84, 0x01]
        );
    }
}
