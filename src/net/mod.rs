//! # Link / IP / UDP / RTP dissection
//!
//! Peels captured Ethernet frames down to UDP payloads tagged by their
//! stream identity (VLAN path, destination IP, destination port), with
//! single-stream IPv4 fragment reassembly and optional RTP recognition
//! on top.
//!
//! Per-packet failures here are policy-non-fatal: the caller logs them
//! and moves to the next captured frame.

pub mod ethernet;
pub mod ipv4;
pub mod rtp;

pub use ethernet::{parse_ethernet, EthernetFrame, VlanTag, MAX_VLANS};
pub use ipv4::{parse_ipv4, parse_udp, IpReassembler, Ipv4Header, UdpHeader};
pub use rtp::{strip_rtp, RtpInfo};

use crate::error::Result;
use bytes::Bytes;
use std::net::Ipv4Addr;

/// A fully peeled UDP datagram with its stream identity.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    /// Outer-to-inner VLAN tags the frame arrived under
    pub vlans: Vec<VlanTag>,
    /// IPv4 source address
    pub src_ip: Ipv4Addr,
    /// IPv4 destination address
    pub dst_ip: Ipv4Addr,
    /// UDP source port
    pub src_port: u16,
    /// UDP destination port
    pub dst_port: u16,
    /// UDP payload with any RTP header already removed
    pub payload: Bytes,
    /// RTP header info when the payload was recognised as RTP
    pub rtp: Option<RtpInfo>,
}

/// Stateful frame-to-datagram dissector.
///
/// Holds the single in-flight IPv4 reassembly buffer; everything else is
/// stateless header peeling.
#[derive(Debug, Default)]
pub struct Dissector {
    reassembler: IpReassembler,
    /// RTP payload type to pass through as-is (in addition to 33/MP2T)
    pub rtp_raw_payload_type: Option<u8>,
}

impl Dissector {
    /// Creates a dissector with no raw RTP payload type configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dissects one captured frame.
    ///
    /// Returns `Ok(None)` when the frame was a non-final fragment (it was
    /// consumed into the reassembly buffer) or carried no UDP datagram
    /// for us.
    pub fn dissect(&mut self, frame: &[u8]) -> Result<Option<UdpDatagram>> {
        let eth = parse_ethernet(frame)?;
        let (ip, ip_payload) = parse_ipv4(eth.payload)?;

        let datagram = match self.reassembler.push(&ip, ip_payload)? {
            Some(d) => d,
            None => return Ok(None),
        };

        let (udp, udp_payload) = parse_udp(&datagram, ip.proto)?;

        let (rtp, payload) = match strip_rtp(udp_payload, self.rtp_raw_payload_type) {
            Some((info, inner)) => (Some(info), Bytes::copy_from_slice(inner)),
            None => (None, Bytes::copy_from_slice(udp_payload)),
        };

        Ok(Some(UdpDatagram {
            vlans: eth.vlans,
            src_ip: ip.src,
            dst_ip: ip.dst,
            src_port: udp.src_port,
            dst_port: udp.dst_port,
            payload,
            rtp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TsKitError;

    fn eth_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0u8; 12]; // dst + src MAC
        v.extend_from_slice(&ethertype.to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn ipv4_udp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len() as u16;
        let total = 20 + udp_len;
        let mut v = Vec::new();
        v.push(0x45); // version 4, ihl 5
        v.push(0);
        v.extend_from_slice(&total.to_be_bytes());
        v.extend_from_slice(&0x1234u16.to_be_bytes()); // ident
        v.extend_from_slice(&0u16.to_be_bytes()); // flags + frag offset
        v.push(64); // ttl
        v.push(17); // proto UDP
        v.extend_from_slice(&0u16.to_be_bytes()); // checksum
        v.extend_from_slice(&[10, 0, 0, 1]);
        v.extend_from_slice(&[239, 1, 2, 3]);
        // UDP
        v.extend_from_slice(&5000u16.to_be_bytes());
        v.extend_from_slice(&dst_port.to_be_bytes());
        v.extend_from_slice(&udp_len.to_be_bytes());
        v.extend_from_slice(&0u16.to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn plain_udp_frame() {
        let frame = eth_frame(0x0800, &ipv4_udp(1234, b"hello"));
        let mut d = Dissector::new();
        let dg = d.dissect(&frame).unwrap().unwrap();
        assert_eq!(dg.dst_ip, std::net::Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(dg.dst_port, 1234);
        assert_eq!(&dg.payload[..], b"hello");
        assert!(dg.vlans.is_empty());
        assert!(dg.rtp.is_none());
    }

    #[test]
    fn stacked_vlans_are_peeled_in_order() {
        // 0x8100 vid 100, 0x8100 vid 200, then IPv4
        let inner = ipv4_udp(1234, b"x");
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u16.to_be_bytes()); // pcp 0, vid 100
        payload.extend_from_slice(&0x8100u16.to_be_bytes());
        payload.extend_from_slice(&200u16.to_be_bytes());
        payload.extend_from_slice(&0x0800u16.to_be_bytes());
        payload.extend_from_slice(&inner);
        let frame = eth_frame(0x8100, &payload);

        let mut d = Dissector::new();
        let dg = d.dissect(&frame).unwrap().unwrap();
        let vids: Vec<u16> = dg.vlans.iter().map(|v| v.vid).collect();
        assert_eq!(vids, vec![100, 200]);
    }

    #[test]
    fn non_ipv4_is_rejected() {
        let frame = eth_frame(0x86DD, &[0u8; 40]); // IPv6
        let mut d = Dissector::new();
        assert!(matches!(
            d.dissect(&frame),
            Err(TsKitError::NotIpv4(0x86DD))
        ));
    }
}
