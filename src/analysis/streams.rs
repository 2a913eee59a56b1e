//! Stream table: content-addressed (VLAN path, destination IP,
//! destination port) → per-stream analysis state.
//!
//! The hash key is (destination IP, destination port); VLAN paths are a
//! secondary equality check so that packets with differing VLAN stacks
//! land in distinct streams even when the dst:port matches.

use super::pcr::PcrAnalyser;
use crate::net::{UdpDatagram, VlanTag};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// One captured UDP stream and its accumulated analysis state.
pub struct Stream {
    /// Monotonic stream number in discovery order
    pub stream_no: usize,
    /// VLAN path this stream was first seen under (outer to inner)
    pub vlans: Vec<VlanTag>,
    /// Destination IPv4 address
    pub dst_ip: Ipv4Addr,
    /// Destination UDP port
    pub dst_port: u16,
    /// Bitmask of pcp values seen, one mask per VLAN level
    pub pcp_seen: Vec<u8>,
    /// Bitmask of cfi values seen (bit 0 = clear, bit 1 = set), per level
    pub cfi_seen: Vec<u8>,
    /// Packets delivered to this stream
    pub packets: u64,
    /// Payload bytes delivered to this stream
    pub bytes: u64,
    /// TS validity and PCR clock analysis
    pub analyser: PcrAnalyser,
}

impl Stream {
    fn new(stream_no: usize, dg: &UdpDatagram, analyser: PcrAnalyser) -> Self {
        let levels = dg.vlans.len();
        Self {
            stream_no,
            vlans: dg.vlans.clone(),
            dst_ip: dg.dst_ip,
            dst_port: dg.dst_port,
            pcp_seen: vec![0; levels],
            cfi_seen: vec![0; levels],
            packets: 0,
            bytes: 0,
            analyser,
        }
    }

    /// Folds this packet's VLAN pcp/cfi values into the seen-masks.
    pub fn note_vlans(&mut self, vlans: &[VlanTag]) {
        for (level, tag) in vlans.iter().enumerate().take(self.pcp_seen.len()) {
            self.pcp_seen[level] |= 1 << (tag.pcp & 0x07);
            self.cfi_seen[level] |= if tag.cfi { 0b10 } else { 0b01 };
        }
    }

    /// `dst_ip:dst_port` display form.
    pub fn name(&self) -> String {
        format!("{}:{}", self.dst_ip, self.dst_port)
    }
}

/// Table of discovered streams.
#[derive(Default)]
pub struct StreamTable {
    // (dst ip, dst port) → indices into `streams` differing by VLAN path
    buckets: HashMap<(Ipv4Addr, u16), Vec<usize>>,
    streams: Vec<Stream>,
}

impl StreamTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the stream for a datagram's identity, creating it on
    /// first sight. `make_analyser` supplies the per-stream analyser so
    /// the caller controls thresholds and trust.
    pub fn get_or_create(
        &mut self,
        dg: &UdpDatagram,
        make_analyser: impl FnOnce(&UdpDatagram) -> PcrAnalyser,
    ) -> &mut Stream {
        let key = (dg.dst_ip, dg.dst_port);
        let bucket = self.buckets.entry(key).or_default();
        let found = bucket
            .iter()
            .copied()
            .find(|&i| self.streams[i].vlans == dg.vlans);
        let idx = match found {
            Some(i) => i,
            None => {
                let stream_no = self.streams.len();
                log::info!(
                    "new stream {}: {}:{} (vlan path {:?})",
                    stream_no,
                    dg.dst_ip,
                    dg.dst_port,
                    dg.vlans.iter().map(|v| v.vid).collect::<Vec<_>>()
                );
                self.streams
                    .push(Stream::new(stream_no, dg, make_analyser(dg)));
                bucket.push(stream_no);
                stream_no
            }
        };
        let stream = &mut self.streams[idx];
        stream.note_vlans(&dg.vlans);
        stream
    }

    /// All streams in discovery order.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Mutable access in discovery order.
    pub fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }

    /// Number of discovered streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when no streams have been seen.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
