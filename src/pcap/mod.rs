//! # PCAP / PCAP-NG capture reading
//!
//! Reads both the classic libpcap format and the block-structured pcap-ng
//! format from any [`std::io::Read`] source, yielding framed link-layer
//! payloads with capture timestamps normalised to the 90 kHz MPEG clock.
//!
//! Format and endianness are classified from the leading magic number:
//!
//! - `0xA1B2C3D4`: classic pcap, big-endian
//! - `0xD4C3B2A1`: classic pcap, little-endian
//! - `0x0A0D0D0A`: pcap-ng; the Section Header Block's inner magic
//!   `0x1A2B3C4D` determines endianness (and may flip again at a later
//!   section boundary)
//!
//! The reader is lazy, finite and non-restartable: call
//! [`CaptureReader::next_packet`] until it returns `Ok(None)`.
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use tskit::pcap::CaptureReader;
//!
//! # fn main() -> tskit::Result<()> {
//! let file = BufReader::new(File::open("capture.pcap")?);
//! let mut rdr = CaptureReader::open(file)?;
//! while let Some(pkt) = rdr.next_packet()? {
//!     println!("{} bytes at {} (90kHz)", pkt.data.len(), pkt.timestamp);
//! }
//! # Ok(())
//! # }
//! ```

mod classic;
mod ng;

pub use classic::ClassicReader;
pub use ng::{Interface, NgReader};

use crate::error::{Result, TsKitError};
use crate::utils::get_u32_be;
use bytes::Bytes;
use std::io::Read;

/// Link type for Ethernet frames (the only one the dissector handles).
pub const LINK_TYPE_ETHERNET: u16 = 1;

/// Largest block/record body the reader will accept: 1 MiB.
pub const MAX_CAPTURED_LEN: u32 = 1 << 20;

/// One captured link-layer frame.
#[derive(Debug, Clone)]
pub struct CapturePacket {
    /// Capture timestamp on the 90 kHz MPEG clock
    pub timestamp: u64,
    /// Captured bytes (possibly truncated by the snap length)
    pub data: Bytes,
    /// Original on-the-wire length
    pub orig_len: u32,
    /// Link type of the capturing interface
    pub link_type: u16,
}

/// Unified reader over classic pcap and pcap-ng sources.
pub enum CaptureReader<R> {
    /// Classic libpcap file
    Classic(ClassicReader<R>),
    /// Block-structured pcap-ng file
    Ng(NgReader<R>),
}

impl<R: Read> CaptureReader<R> {
    /// Classifies the source from its magic number and prepares a reader.
    ///
    /// Consumes the whole file header (classic) or the Section Header
    /// Block (pcap-ng) before returning.
    pub fn open(mut rdr: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        rdr.read_exact(&mut magic)?;
        match get_u32_be(&magic) {
            classic::MAGIC_BE => Ok(CaptureReader::Classic(ClassicReader::after_magic(
                rdr, false,
            )?)),
            classic::MAGIC_LE => Ok(CaptureReader::Classic(ClassicReader::after_magic(
                rdr, true,
            )?)),
            ng::BLOCK_SECTION_HEADER => Ok(CaptureReader::Ng(NgReader::after_magic(rdr)?)),
            other => Err(TsKitError::BadMagic(other)),
        }
    }

    /// Returns the next captured packet, or `None` at end of capture.
    ///
    /// Malformed trailing data shorter than a record header is logged
    /// and treated as end of capture.
    pub fn next_packet(&mut self) -> Result<Option<CapturePacket>> {
        match self {
            CaptureReader::Classic(r) => r.next_packet(),
            CaptureReader::Ng(r) => r.next_packet(),
        }
    }
}

/// Converts seconds + microseconds to the 90 kHz MPEG clock.
pub(crate) fn to_90khz(secs: u64, usecs: u64) -> u64 {
    secs * 90_000 + usecs * 9 / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn unknown_magic_is_rejected() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0];
        match CaptureReader::open(Cursor::new(data)) {
            Err(TsKitError::BadMagic(m)) => assert_eq!(m, 0xDEADBEEF),
            other => panic!("expected BadMagic, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn timestamp_conversion() {
        assert_eq!(to_90khz(1, 0), 90_000);
        assert_eq!(to_90khz(0, 1_000_000), 90_000);
        assert_eq!(to_90khz(0, 500_000), 45_000);
    }
}
