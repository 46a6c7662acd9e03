// klippy_mcu/src/utils.rs
// Checksums used on the wire and over the configuration.

/// Standard crc "ccitt" used by the protocol block trailer.
pub fn crc16_ccitt(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in buf {
        let mut data = byte ^ (crc & 0xff) as u8;
        data ^= data << 4;
        crc = (((data as u16) << 8) | (crc >> 8)) ^ (data >> 4) as u16 ^ ((data as u16) << 3);
    }
    crc
}

/// zlib compatible crc32 (reflected polynomial 0xedb88320).
pub fn crc32(buf: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in buf {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}
