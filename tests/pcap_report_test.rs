//! End-to-end capture analysis: PCAP bytes in, stream table and PCR
//! sections out.

use pretty_assertions::assert_eq;
use std::io::Cursor;
use tskit::analysis::{PcrAnalyser, StreamTable};
use tskit::net::Dissector;
use tskit::pcap::CaptureReader;

const TS_PACKET_SIZE: usize = 188;

fn ts_packet() -> Vec<u8> {
    let mut packet = vec![0u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[3] = 0x10;
    packet
}

fn pcr_packet(pid: u16, pcr_90khz: u64) -> Vec<u8> {
    let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = ((pid >> 8) & 0x1F) as u8;
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x20;
    packet[4] = 183;
    packet[5] = 0x10;
    packet[6] = (pcr_90khz >> 25) as u8;
    packet[7] = (pcr_90khz >> 17) as u8;
    packet[8] = (pcr_90khz >> 9) as u8;
    packet[9] = (pcr_90khz >> 1) as u8;
    packet[10] = (((pcr_90khz & 1) << 7) as u8) | 0x7E;
    packet[11] = 0;
    packet
}

fn udp_ip_eth(vlans: &[u16], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len() as u16;
    let total = 20 + udp_len;

    let mut frame = vec![0u8; 12];
    for vid in vlans {
        frame.extend_from_slice(&0x8100u16.to_be_bytes());
        frame.extend_from_slice(&vid.to_be_bytes());
    }
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&0x0042u16.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.push(64);
    frame.push(17);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&[239, 100, 1, 1]);
    frame.extend_from_slice(&5000u16.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn classic_pcap_be(records: &[(u32, u32, &[u8])]) -> Vec<u8> {
    let mut file = Vec::new();
    file.extend_from_slice(&0xA1B2C3D4u32.to_be_bytes());
    file.extend_from_slice(&2u16.to_be_bytes());
    file.extend_from_slice(&4u16.to_be_bytes());
    file.extend_from_slice(&0i32.to_be_bytes());
    file.extend_from_slice(&0u32.to_be_bytes());
    file.extend_from_slice(&65535u32.to_be_bytes());
    file.extend_from_slice(&1u32.to_be_bytes()); // Ethernet
    for (sec, usec, data) in records {
        file.extend_from_slice(&sec.to_be_bytes());
        file.extend_from_slice(&usec.to_be_bytes());
        file.extend_from_slice(&(data.len() as u32).to_be_bytes());
        file.extend_from_slice(&(data.len() as u32).to_be_bytes());
        file.extend_from_slice(data);
    }
    file
}

struct Harness {
    dissector: Dissector,
    streams: StreamTable,
}

impl Harness {
    fn new() -> Self {
        Self {
            dissector: Dissector::new(),
            streams: StreamTable::new(),
        }
    }

    fn feed(&mut self, pcap: Vec<u8>) {
        let mut reader = CaptureReader::open(Cursor::new(pcap)).unwrap();
        while let Some(pkt) = reader.next_packet().unwrap() {
            if let Ok(Some(dg)) = self.dissector.dissect(&pkt.data) {
                let rtp = dg.rtp;
                let stream = self
                    .streams
                    .get_or_create(&dg, |_| PcrAnalyser::default());
                stream.packets += 1;
                stream.bytes += dg.payload.len() as u64;
                let stream_no = stream.stream_no;
                let _ = stream
                    .analyser
                    .add_payload(stream_no, pkt.timestamp, &dg.payload, rtp);
            }
        }
    }
}

#[test]
fn classic_big_endian_single_ts_stream() {
    let payload = ts_packet();
    let frame = udp_ip_eth(&[], 1234, &payload);
    let pcap = classic_pcap_be(&[(1, 0, &frame)]);

    let mut h = Harness::new();
    h.feed(pcap);

    assert_eq!(h.streams.len(), 1);
    let stream = &h.streams.streams()[0];
    assert_eq!(stream.dst_port, 1234);
    assert_eq!(stream.analyser.ts_good(), 1);
    assert_eq!(stream.analyser.seen_good, 1);
}

#[test]
fn vlan_path_is_part_of_stream_identity() {
    let payload = ts_packet();
    let single = udp_ip_eth(&[100], 1234, &payload);
    let double = udp_ip_eth(&[100, 200], 1234, &payload);
    let pcap = classic_pcap_be(&[(1, 0, &single), (1, 100, &double), (2, 0, &single)]);

    let mut h = Harness::new();
    h.feed(pcap);

    assert_eq!(h.streams.len(), 2);
    let vids: Vec<Vec<u16>> = h
        .streams
        .streams()
        .iter()
        .map(|s| s.vlans.iter().map(|v| v.vid).collect())
        .collect();
    assert_eq!(vids, vec![vec![100], vec![100, 200]]);
    assert_eq!(h.streams.streams()[0].packets, 2);
    assert_eq!(h.streams.streams()[1].packets, 1);
}

#[test]
fn pcr_jump_splits_sections() {
    // Two PCRs 10s apart in capture but 16s apart in PCR
    let first = udp_ip_eth(&[], 5000, &pcr_packet(0x68, 0));
    let second = udp_ip_eth(&[], 5000, &pcr_packet(0x68, 16 * 90_000));
    let pcap = classic_pcap_be(&[(0, 0, &first), (10, 0, &second)]);

    let mut h = Harness::new();
    h.feed(pcap);

    assert_eq!(h.streams.len(), 1);
    let sections = h.streams.streams()[0].analyser.sections();
    assert_eq!(sections.len(), 2);
}

#[test]
fn contiguous_pcrs_stay_in_one_section_with_skew() {
    // Capture clock runs 0.5s ahead of PCR by the second packet
    let first = udp_ip_eth(&[], 5000, &pcr_packet(0x68, 90_000));
    let second = udp_ip_eth(&[], 5000, &pcr_packet(0x68, 2 * 90_000));
    let pcap = classic_pcap_be(&[(1, 0, &first), (2, 500_000, &second)]);

    let mut h = Harness::new();
    h.feed(pcap);

    let sections = h.streams.streams()[0].analyser.sections();
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0].min_skew, 0);
    assert_eq!(sections[0].max_skew, 45_000);
    assert_eq!(sections[0].drift(), 45_000);
}

#[test]
fn misaligned_payload_counts_bad_without_breaking_the_stream() {
    let good = udp_ip_eth(&[], 7000, &ts_packet());
    let bad = udp_ip_eth(&[], 7000, &[0x47u8; 100]);
    let pcap = classic_pcap_be(&[(1, 0, &good), (1, 1, &bad), (1, 2, &good)]);

    let mut h = Harness::new();
    h.feed(pcap);

    let stream = &h.streams.streams()[0];
    assert_eq!(stream.analyser.seen_good, 2);
    assert_eq!(stream.analyser.seen_bad, 1);
}
