//! MPEG-2 CRC32 (ITU-T H.222.0), used when synthesising PAT/PMT
//! sections for the serving side.
//!
//! The variant PSI tables use has no reflection and no output XOR, so a
//! section with its CRC appended big-endian sums to zero; that residual
//! check is how decoders validate tables, and how the tests here pin
//! the implementation without an external vector.

/// Generator polynomial for the MPEG-2 table CRC.
const POLY: u32 = 0x04C1_1DB7;

/// MPEG-2 CRC32 calculator.
pub struct Crc32Mpeg2 {
    table: [u32; 256],
}

impl Crc32Mpeg2 {
    /// Builds the byte-indexed lookup table for the polynomial.
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = (0..8).fold((i as u32) << 24, |crc, _| {
                if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ POLY
                } else {
                    crc << 1
                }
            });
        }
        Self { table }
    }

    /// Sums `data` from the all-ones initial state.
    pub fn calculate(&self, data: &[u8]) -> u32 {
        data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
            (crc << 8) ^ self.table[(((crc >> 24) ^ byte as u32) & 0xFF) as usize]
        })
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}
