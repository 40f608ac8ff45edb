//! Block checksums used by the block-transfer protocol.

/// CRC16-XMODEM (poly 0x1021, init 0x0000, no reflection, no final XOR).
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ (u16::from(byte) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Classic XMODEM checksum: sum of all bytes modulo 256.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
        assert_eq!(crc16_xmodem(&[]), 0x0000);
    }

    #[test]
    fn test_checksum8_wraps() {
        assert_eq!(checksum8(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum8(&[42u8; 128]), 0x00);
        assert_eq!(checksum8(&[1, 2, 3]), 6);
    }
}
