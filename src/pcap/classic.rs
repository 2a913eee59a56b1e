//! Classic libpcap file reading.
//!
//! The on-disk layout is a 24-byte header
//! `magic | major | minor | thiszone | sigfigs | snaplen | network`
//! followed by records `ts_sec | ts_usec | incl_len | orig_len | bytes`.

use super::{to_90khz, CapturePacket, MAX_CAPTURED_LEN};
use crate::error::{Result, TsKitError};
use bytes::Bytes;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{ErrorKind, Read};

/// Big-endian classic pcap magic.
pub(crate) const MAGIC_BE: u32 = 0xA1B2_C3D4;
/// Byte-swapped magic: the writer was little-endian.
pub(crate) const MAGIC_LE: u32 = 0xD4C3_B2A1;

/// Reader for classic pcap captures.
pub struct ClassicReader<R> {
    rdr: R,
    swapped: bool,
    link_type: u16,
    snap_len: u32,
}

impl<R: Read> ClassicReader<R> {
    /// Continues reading the 24-byte file header after the magic has
    /// been consumed and classified by the caller.
    pub(crate) fn after_magic(mut rdr: R, swapped: bool) -> Result<Self> {
        let mut rest = [0u8; 20];
        rdr.read_exact(&mut rest)?;
        let mut hdr = &rest[..];
        let (_major, _minor, _thiszone, _sigfigs, snap_len, network);
        if swapped {
            _major = hdr.read_u16::<LittleEndian>()?;
            _minor = hdr.read_u16::<LittleEndian>()?;
            _thiszone = hdr.read_i32::<LittleEndian>()?;
            _sigfigs = hdr.read_u32::<LittleEndian>()?;
            snap_len = hdr.read_u32::<LittleEndian>()?;
            network = hdr.read_u32::<LittleEndian>()?;
        } else {
            _major = hdr.read_u16::<BigEndian>()?;
            _minor = hdr.read_u16::<BigEndian>()?;
            _thiszone = hdr.read_i32::<BigEndian>()?;
            _sigfigs = hdr.read_u32::<BigEndian>()?;
            snap_len = hdr.read_u32::<BigEndian>()?;
            network = hdr.read_u32::<BigEndian>()?;
        }
        log::debug!(
            "classic pcap: {} endian, snaplen {}, network {}",
            if swapped { "little" } else { "big" },
            snap_len,
            network
        );
        Ok(Self {
            rdr,
            swapped,
            link_type: network as u16,
            snap_len,
        })
    }

    /// The file-level link type.
    pub fn link_type(&self) -> u16 {
        self.link_type
    }

    /// The file-level snap length.
    pub fn snap_len(&self) -> u32 {
        self.snap_len
    }

    /// Reads the next record, or returns `None` at end of file.
    pub fn next_packet(&mut self) -> Result<Option<CapturePacket>> {
        let mut hdr = [0u8; 16];
        match read_exact_or_eof(&mut self.rdr, &mut hdr)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Short(n) => {
                log::warn!("classic pcap: {} trailing bytes at EOF, ignoring", n);
                return Ok(None);
            }
            ReadOutcome::Full => {}
        }

        let mut h = &hdr[..];
        let (ts_sec, ts_usec, incl_len, orig_len);
        if self.swapped {
            ts_sec = h.read_u32::<LittleEndian>()?;
            ts_usec = h.read_u32::<LittleEndian>()?;
            incl_len = h.read_u32::<LittleEndian>()?;
            orig_len = h.read_u32::<LittleEndian>()?;
        } else {
            ts_sec = h.read_u32::<BigEndian>()?;
            ts_usec = h.read_u32::<BigEndian>()?;
            incl_len = h.read_u32::<BigEndian>()?;
            orig_len = h.read_u32::<BigEndian>()?;
        }

        if incl_len > MAX_CAPTURED_LEN {
            return Err(TsKitError::BadLength {
                what: "classic pcap record",
                got: incl_len as u64,
            });
        }

        let mut data = vec![0u8; incl_len as usize];
        self.rdr.read_exact(&mut data)?;

        Ok(Some(CapturePacket {
            timestamp: to_90khz(ts_sec as u64, ts_usec as u64),
            data: Bytes::from(data),
            orig_len,
            link_type: self.link_type,
        }))
    }
}

enum ReadOutcome {
    Full,
    Eof,
    Short(usize),
}

/// Like `read_exact`, but distinguishes a clean EOF at offset zero from
/// a truncated read partway through.
fn read_exact_or_eof<R: Read>(rdr: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match rdr.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Short(filled)
                })
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}
