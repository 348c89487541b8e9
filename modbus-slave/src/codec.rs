/// 16-bit value stored in Modbus register.
pub type Word = u16;

/// Register or coil address.
pub type Address = u16;

/// Number of consecutive registers or coils.
pub type Quantity = u16;

/// Encode `Word`s into Big Endian-ordered bytes.
pub fn words_to_be_bytes(words: &[Word]) -> Vec<u8> {
    words.iter().copied().flat_map(u16::to_be_bytes).collect()
}

/// Decode Big Endian-ordered bytes into `Word`s. A trailing odd byte is ignored.
pub fn be_bytes_to_words(bytes: &[u8]) -> Vec<Word> {
    bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Number of bytes needed to carry `cnt` packed bits.
pub fn packed_len(cnt: usize) -> usize {
    cnt.div_ceil(8)
}

/// Pack bits LSB-first, 8 per byte, as in coil and discrete input PDUs.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; packed_len(bits.len())];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack the first `cnt` bits of LSB-first packed `bytes`.
///
/// Returns `None` when `bytes` is too short to hold `cnt` bits.
pub fn unpack_bits(bytes: &[u8], cnt: usize) -> Option<Vec<bool>> {
    if bytes.len() < packed_len(cnt) {
        return None;
    }
    Some(
        (0..cnt)
            .map(|i| (bytes[i / 8] >> (i % 8)) & 0x01 != 0)
            .collect(),
    )
}

/// Read a Big Endian `Word` at `offset`, if present.
pub(crate) fn word_at(bytes: &[u8], offset: usize) -> Option<Word> {
    let hi = *bytes.get(offset)?;
    let lo = *bytes.get(offset + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_big_endian() {
        assert_eq!(words_to_be_bytes(&[0x002A, 0x1234]), vec![0x00, 0x2A, 0x12, 0x34]);
        assert_eq!(be_bytes_to_words(&[0x00, 0x2A, 0x12, 0x34, 0xFF]), vec![0x002A, 0x1234]);
    }

    #[test]
    fn test_pack_bits() {
        // 9 coils: 8 set, then one more set bit in the second byte
        let bits = [true; 9];
        assert_eq!(pack_bits(&bits), vec![0xFF, 0x01]);
        assert_eq!(pack_bits(&[false, true, false, true]), vec![0x0A]);
        assert!(pack_bits(&[]).is_empty());
    }

    #[test]
    fn test_unpack_bits() {
        assert_eq!(
            unpack_bits(&[0xCD, 0x01], 10),
            Some(vec![true, false, true, true, false, false, true, true, true, false])
        );
        assert_eq!(unpack_bits(&[0xFF], 9), None);
    }

    #[test]
    fn test_word_at() {
        assert_eq!(word_at(&[0x00, 0x05, 0xFF], 0), Some(5));
        assert_eq!(word_at(&[0x00, 0x05, 0xFF], 2), None);
    }
}
