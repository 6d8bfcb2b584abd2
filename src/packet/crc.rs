//! CRC-16/CCITT-FALSE as used by the frame header.

/// Compute the frame CRC (polynomial 0x1021, initial value 0xffff, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in data {
        let mut x = ((crc >> 8) as u8 ^ byte) as u16;
        x ^= x >> 4;
        crc = (crc << 8) ^ (x << 12) ^ (x << 5) ^ x;
    }
    crc
}
