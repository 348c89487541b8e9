//! Modbus RTU checksum.

use crc::{Crc, CRC_16_MODBUS};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus RTU CRC-16 (reflected polynomial `0xA001`, initial value `0xFFFF`).
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check the trailing little-endian CRC of a complete RTU frame.
///
/// Frames shorter than the checksum itself never validate.
pub fn validate(frame: &[u8]) -> bool {
    match checksums(frame) {
        Some((calculated, received)) => calculated == received,
        None => false,
    }
}

/// Returns `(calculated, received)` for a frame with a trailing CRC.
pub(crate) fn checksums(frame: &[u8]) -> Option<(u16, u16)> {
    if frame.len() < 2 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    Some((crc16(body), u16::from_le_bytes([tail[0], tail[1]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_reference_vectors() {
        // Read holding registers, unit 1, start 0, count 10
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
        // Write single coil, unit 17, addr 0xAC, ON
        assert_eq!(crc16(&[0x11, 0x05, 0x00, 0xAC, 0xFF, 0x00]), 0x8B4E);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_validate() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        assert!(validate(&frame));

        let mut corrupt = frame;
        corrupt[3] ^= 0x10;
        assert!(!validate(&corrupt));

        assert!(!validate(&[0x01]));
    }
}
