//! pcap-ng block walking.
//!
//! Only the block types the analyser needs are interpreted: Section
//! Header (endianness + section reset), Interface Description (interface
//! table), the obsolete Packet Block and the Enhanced Packet Block.
//! Everything else is skipped by its declared length.

use super::{CapturePacket, MAX_CAPTURED_LEN};
use crate::error::{Result, TsKitError};
use crate::utils::{get_u32_be, Endianness};
use bytes::Bytes;
use std::io::{ErrorKind, Read};

/// Block type of the Section Header Block (also the file magic).
pub(crate) const BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
const BLOCK_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
const BLOCK_PACKET_OBSOLETE: u32 = 0x0000_0002;
const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;

const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

/// One entry of the per-section interface table.
#[derive(Debug, Clone)]
pub struct Interface {
    /// Link type of this interface
    pub link_type: u16,
    /// Capture snap length (0 = unlimited)
    pub snap_len: u32,
}

/// Reader for pcap-ng captures.
pub struct NgReader<R> {
    rdr: R,
    endianness: Endianness,
    interfaces: Vec<Interface>,
}

impl<R: Read> NgReader<R> {
    /// Continues after the caller consumed the leading SHB block-type
    /// word. Reads the rest of the Section Header Block.
    pub(crate) fn after_magic(mut rdr: R) -> Result<Self> {
        // total length (endianness still unknown) + byte-order magic
        let mut head = [0u8; 8];
        rdr.read_exact(&mut head)?;
        let endianness = match get_u32_be(&head[4..]) {
            BYTE_ORDER_MAGIC => Endianness::Big,
            m if m.swap_bytes() == BYTE_ORDER_MAGIC => Endianness::Little,
            m => return Err(TsKitError::BadMagic(m)),
        };
        let total_len = endianness.u32_at(&head, 0);
        // SHB is exempt from the usual length cap but must still frame
        if total_len < 16 || total_len % 4 != 0 {
            return Err(TsKitError::BadLength {
                what: "section header block",
                got: total_len as u64,
            });
        }
        // skip section options + trailing length
        skip(&mut rdr, total_len as usize - 12)?;
        log::debug!("pcap-ng: section header, {:?} endian", endianness);
        Ok(Self {
            rdr,
            endianness,
            interfaces: Vec::new(),
        })
    }

    /// Interfaces described so far in the current section.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Walks blocks until the next packet-bearing block, or EOF.
    pub fn next_packet(&mut self) -> Result<Option<CapturePacket>> {
        loop {
            let mut head = [0u8; 8];
            match read_head(&mut self.rdr, &mut head)? {
                Head::Eof => return Ok(None),
                Head::Short(n) => {
                    log::warn!("pcap-ng: {} trailing bytes at EOF, ignoring", n);
                    return Ok(None);
                }
                Head::Full => {}
            }

            let block_type = self.endianness.u32_at(&head, 0);

            if block_type == BLOCK_SECTION_HEADER {
                // New section: re-detect endianness, reset interfaces.
                let mut bom = [0u8; 4];
                self.rdr.read_exact(&mut bom)?;
                self.endianness = match get_u32_be(&bom) {
                    BYTE_ORDER_MAGIC => Endianness::Big,
                    m if m.swap_bytes() == BYTE_ORDER_MAGIC => Endianness::Little,
                    m => return Err(TsKitError::BadMagic(m)),
                };
                let total_len = self.endianness.u32_at(&head, 4);
                if total_len < 16 || total_len % 4 != 0 {
                    return Err(TsKitError::BadLength {
                        what: "section header block",
                        got: total_len as u64,
                    });
                }
                skip(&mut self.rdr, total_len as usize - 12)?;
                self.interfaces.clear();
                continue;
            }

            let total_len = self.endianness.u32_at(&head, 4);
            if total_len < 8 || total_len > MAX_CAPTURED_LEN || total_len % 4 != 0 {
                return Err(TsKitError::BadLength {
                    what: "pcap-ng block",
                    got: total_len as u64,
                });
            }
            let body_len = total_len as usize - 12;
            let mut body = vec![0u8; body_len];
            self.rdr.read_exact(&mut body)?;
            skip(&mut self.rdr, 4)?; // trailing length copy

            match block_type {
                BLOCK_INTERFACE_DESCRIPTION => {
                    if body_len < 8 {
                        return Err(TsKitError::BadLength {
                            what: "interface description block",
                            got: total_len as u64,
                        });
                    }
                    let link_type = self.endianness.u16_at(&body, 0);
                    let snap_len = self.endianness.u32_at(&body, 4);
                    log::debug!(
                        "pcap-ng: interface {} link_type {} snaplen {}",
                        self.interfaces.len(),
                        link_type,
                        snap_len
                    );
                    self.interfaces.push(Interface {
                        link_type,
                        snap_len,
                    });
                }
                BLOCK_ENHANCED_PACKET => {
                    if body_len < 20 {
                        return Err(TsKitError::BadLength {
                            what: "enhanced packet block",
                            got: total_len as u64,
                        });
                    }
                    let interface_id = self.endianness.u32_at(&body, 0);
                    let ts_high = self.endianness.u32_at(&body, 4) as u64;
                    let ts_low = self.endianness.u32_at(&body, 8) as u64;
                    let captured_len = self.endianness.u32_at(&body, 12) as usize;
                    let _packet_len = self.endianness.u32_at(&body, 16);
                    return self.emit(interface_id, ts_high, ts_low, captured_len, &body[20..]);
                }
                BLOCK_PACKET_OBSOLETE => {
                    if body_len < 20 {
                        return Err(TsKitError::BadLength {
                            what: "packet block",
                            got: total_len as u64,
                        });
                    }
                    let interface_id = self.endianness.u16_at(&body, 0) as u32;
                    let ts_high = self.endianness.u32_at(&body, 4) as u64;
                    let ts_low = self.endianness.u32_at(&body, 8) as u64;
                    let captured_len = self.endianness.u32_at(&body, 12) as usize;
                    let _packet_len = self.endianness.u32_at(&body, 16);
                    return self.emit(interface_id, ts_high, ts_low, captured_len, &body[20..]);
                }
                other => {
                    log::debug!("pcap-ng: skipping block type {:#010x}", other);
                }
            }
        }
    }

    fn emit(
        &mut self,
        interface_id: u32,
        ts_high: u64,
        ts_low: u64,
        captured_len: usize,
        data: &[u8],
    ) -> Result<Option<CapturePacket>> {
        let iface = self
            .interfaces
            .get(interface_id as usize)
            .ok_or(TsKitError::BadInterfaceId(interface_id))?;
        if captured_len > data.len() {
            return Err(TsKitError::BadLength {
                what: "captured length",
                got: captured_len as u64,
            });
        }
        // default if_tsresol: microseconds
        let usecs = (ts_high << 32) | ts_low;
        Ok(Some(CapturePacket {
            timestamp: usecs * 9 / 100,
            data: Bytes::copy_from_slice(&data[..captured_len]),
            orig_len: captured_len as u32,
            link_type: iface.link_type,
        }))
    }
}

enum Head {
    Full,
    Eof,
    Short(usize),
}

fn read_head<R: Read>(rdr: &mut R, buf: &mut [u8]) -> Result<Head> {
    let mut filled = 0;
    while filled < buf.len() {
        match rdr.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    Head::Eof
                } else {
                    Head::Short(filled)
                })
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Head::Full)
}

fn skip<R: Read>(rdr: &mut R, n: usize) -> Result<()> {
    let mut remaining = n;
    let mut scratch = [0u8; 512];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let got = rdr.read(&mut scratch[..want])?;
        if got == 0 {
            return Err(TsKitError::PacketTooShort(format!(
                "pcap-ng block truncated by {} bytes",
                remaining
            )));
        }
        remaining -= got;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::CaptureReader;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn push_block(out: &mut Vec<u8>, block_type: u32, body: &[u8]) {
        let total = 12 + body.len() as u32;
        out.extend_from_slice(&block_type.to_be_bytes());
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(&total.to_be_bytes());
    }

    fn shb() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&BYTE_ORDER_MAGIC.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes()); // major
        body.extend_from_slice(&0u16.to_be_bytes()); // minor
        body.extend_from_slice(&(-1i64).to_be_bytes()); // section length
        let mut out = Vec::new();
        push_block(&mut out, BLOCK_SECTION_HEADER, &body);
        out
    }

    fn idb(link_type: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&link_type.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&65535u32.to_be_bytes());
        let mut out = Vec::new();
        push_block(&mut out, BLOCK_INTERFACE_DESCRIPTION, &body);
        out
    }

    fn epb(interface_id: u32, ts_usec: u64, payload: &[u8]) -> Vec<u8> {
        let padded = (payload.len() + 3) & !3;
        let mut body = Vec::new();
        body.extend_from_slice(&interface_id.to_be_bytes());
        body.extend_from_slice(&((ts_usec >> 32) as u32).to_be_bytes());
        body.extend_from_slice(&(ts_usec as u32).to_be_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        body.extend_from_slice(payload);
        body.resize(20 + padded, 0);
        let mut out = Vec::new();
        push_block(&mut out, BLOCK_ENHANCED_PACKET, &body);
        out
    }

    #[test]
    fn one_interface_two_epbs() {
        let mut file = shb();
        file.extend(idb(1));
        file.extend(epb(0, 1_000_000, &[0x47, 0x11, 0x22]));
        file.extend(epb(0, 2_000_000, &[0x47, 0x33]));

        let mut rdr = CaptureReader::open(Cursor::new(file)).unwrap();
        let a = rdr.next_packet().unwrap().unwrap();
        let b = rdr.next_packet().unwrap().unwrap();
        assert_eq!(a.timestamp, 90_000);
        assert_eq!(b.timestamp, 180_000);
        assert!(a.timestamp < b.timestamp);
        assert_eq!(a.data.len(), 3);
        assert_eq!(b.data.len(), 2);
        assert!(rdr.next_packet().unwrap().is_none());
    }

    #[test]
    fn epb_with_unknown_interface_fails() {
        let mut file = shb();
        file.extend(epb(7, 0, &[0x00]));
        let mut rdr = CaptureReader::open(Cursor::new(file)).unwrap();
        assert!(matches!(
            rdr.next_packet(),
            Err(TsKitError::BadInterfaceId(7))
        ));
    }

    #[test]
    fn unknown_blocks_are_skipped() {
        let mut file = shb();
        file.extend(idb(1));
        push_block(&mut file, 0x0000_0004, &[0u8; 8]); // name resolution
        file.extend(epb(0, 0, &[0x47]));
        let mut rdr = CaptureReader::open(Cursor::new(file)).unwrap();
        let pkt = rdr.next_packet().unwrap().unwrap();
        assert_eq!(&pkt.data[..], &[0x47]);
    }

    #[test]
    fn little_endian_section() {
        let mut body = Vec::new();
        body.extend_from_slice(&BYTE_ORDER_MAGIC.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(-1i64).to_le_bytes());
        let total = 12 + body.len() as u32;
        let mut file = Vec::new();
        file.extend_from_slice(&BLOCK_SECTION_HEADER.to_be_bytes()); // palindrome
        file.extend_from_slice(&total.to_le_bytes());
        file.extend_from_slice(&body);
        file.extend_from_slice(&total.to_le_bytes());

        // LE interface description
        let mut idb_body = Vec::new();
        idb_body.extend_from_slice(&1u16.to_le_bytes());
        idb_body.extend_from_slice(&0u16.to_le_bytes());
        idb_body.extend_from_slice(&65535u32.to_le_bytes());
        let idb_total = 12 + idb_body.len() as u32;
        file.extend_from_slice(&BLOCK_INTERFACE_DESCRIPTION.to_le_bytes());
        file.extend_from_slice(&idb_total.to_le_bytes());
        file.extend_from_slice(&idb_body);
        file.extend_from_slice(&idb_total.to_le_bytes());

        let mut rdr = CaptureReader::open(Cursor::new(file)).unwrap();
        assert!(rdr.next_packet().unwrap().is_none());
        match rdr {
            CaptureReader::Ng(ng) => {
                assert_eq!(ng.interfaces().len(), 1);
                assert_eq!(ng.interfaces()[0].link_type, 1);
            }
            _ => panic!("expected ng reader"),
        }
    }
}
