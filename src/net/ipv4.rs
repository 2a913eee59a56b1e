//! IPv4 header parsing, single-stream fragment reassembly, and UDP.
//!
//! The reassembler keeps exactly one datagram in flight, the way the
//! capture analyser's traffic actually looks (one video stream,
//! occasionally fragmented). A new ident while another is in progress
//! discards the prior one with a log line; out-of-order fragments
//! discard the in-progress datagram.

use crate::error::{Result, TsKitError};
use crate::utils::{get_u16_be, require_bytes};
use std::net::Ipv4Addr;

/// Reassembled datagrams are capped at the IPv4 maximum.
const MAX_DATAGRAM: usize = 64 * 1024;

const PROTO_UDP: u8 = 17;

/// Parsed IPv4 header fields (host byte order).
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    /// Header length in bytes
    pub header_len: usize,
    /// Total datagram length from the header
    pub total_len: u16,
    /// Identification field (fragment association)
    pub ident: u16,
    /// Don't-fragment flag
    pub dont_fragment: bool,
    /// More-fragments flag
    pub more_fragments: bool,
    /// Fragment offset in bytes (stored ×8 on the wire)
    pub frag_offset: u16,
    /// Payload protocol
    pub proto: u8,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// True when this packet is one fragment of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.frag_offset != 0
    }
}

/// Parses an IPv4 header, returning it and the payload slice.
pub fn parse_ipv4(data: &[u8]) -> Result<(Ipv4Header, &[u8])> {
    require_bytes(data, 20, "ipv4 header")?;

    let version = data[0] >> 4;
    if version != 4 {
        return Err(TsKitError::Parser(format!("IP version {}", version)));
    }
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if header_len < 20 {
        return Err(TsKitError::Parser(format!(
            "IPv4 header length {} below minimum",
            header_len
        )));
    }
    require_bytes(data, header_len, "ipv4 options")?;

    let total_len = get_u16_be(&data[2..]);
    if (total_len as usize) < header_len || total_len as usize > data.len() {
        return Err(TsKitError::BadLength {
            what: "ipv4 total length",
            got: total_len as u64,
        });
    }

    let flags_frag = get_u16_be(&data[6..]);
    let header = Ipv4Header {
        header_len,
        total_len,
        ident: get_u16_be(&data[4..]),
        dont_fragment: (flags_frag & 0x4000) != 0,
        more_fragments: (flags_frag & 0x2000) != 0,
        frag_offset: (flags_frag & 0x1FFF) * 8,
        proto: data[9],
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    };
    let payload = &data[header_len..total_len as usize];
    Ok((header, payload))
}

#[derive(Debug)]
struct InFlight {
    ident: u16,
    next_offset: u16,
    buf: Vec<u8>,
}

/// Single-datagram IPv4 fragment reassembler.
#[derive(Debug, Default)]
pub struct IpReassembler {
    current: Option<InFlight>,
}

impl IpReassembler {
    /// Feeds one IP packet. Returns the complete datagram payload when
    /// available (immediately for unfragmented packets).
    pub fn push(&mut self, hdr: &Ipv4Header, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if !hdr.is_fragment() {
            if self.current.take().is_some() {
                log::info!(
                    "dropping in-progress reassembly (ident {:#06x}): unfragmented packet arrived",
                    hdr.ident
                );
            }
            return Ok(Some(payload.to_vec()));
        }

        // Non-final fragments must be a multiple of 8 bytes
        if hdr.more_fragments && payload.len() % 8 != 0 {
            self.current = None;
            return Err(TsKitError::Parser(format!(
                "non-final fragment of {} bytes not divisible by 8 (ident {:#06x})",
                payload.len(),
                hdr.ident
            )));
        }

        match &mut self.current {
            Some(fl) if fl.ident != hdr.ident => {
                log::info!(
                    "new fragmented datagram ident {:#06x} while {:#06x} in progress, discarding prior",
                    hdr.ident,
                    fl.ident
                );
                self.current = None;
            }
            _ => {}
        }

        match &mut self.current {
            None => {
                if hdr.frag_offset != 0 {
                    // tail of a datagram whose head we never saw
                    return Err(TsKitError::FragmentReorder {
                        ident: hdr.ident,
                        offset: hdr.frag_offset,
                    });
                }
                self.current = Some(InFlight {
                    ident: hdr.ident,
                    next_offset: payload.len() as u16,
                    buf: payload.to_vec(),
                });
                Ok(None)
            }
            Some(fl) => {
                if hdr.frag_offset != fl.next_offset {
                    let err = TsKitError::FragmentReorder {
                        ident: hdr.ident,
                        offset: hdr.frag_offset,
                    };
                    self.current = None;
                    return Err(err);
                }
                if fl.buf.len() + payload.len() > MAX_DATAGRAM {
                    let ident = fl.ident;
                    self.current = None;
                    return Err(TsKitError::FragmentOverrun(ident));
                }
                fl.buf.extend_from_slice(payload);
                fl.next_offset += payload.len() as u16;
                if hdr.more_fragments {
                    Ok(None)
                } else {
                    let done = self.current.take().expect("in-flight datagram");
                    Ok(Some(done.buf))
                }
            }
        }
    }
}

/// Parsed UDP header fields.
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Datagram length (header + payload)
    pub length: u16,
}

/// Parses a UDP datagram out of a reassembled IP payload.
pub fn parse_udp(data: &[u8], proto: u8) -> Result<(UdpHeader, &[u8])> {
    if proto != PROTO_UDP {
        return Err(TsKitError::NotUdp(proto));
    }
    require_bytes(data, 8, "udp header")?;
    let header = UdpHeader {
        src_port: get_u16_be(data),
        dst_port: get_u16_be(&data[2..]),
        length: get_u16_be(&data[4..]),
    };
    let end = (header.length as usize).min(data.len());
    if (header.length as usize) < 8 {
        return Err(TsKitError::BadLength {
            what: "udp length",
            got: header.length as u64,
        });
    }
    Ok((header, &data[8..end]))
}
