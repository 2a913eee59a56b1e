//! Per-stream TS validity scoring and PCR clock analysis.
//!
//! Every UDP payload delivered to a stream is first scored for TS
//! alignment (188-byte framing with 0x47 sync bytes), then each
//! PCR-carrying packet feeds the skew/jitter/drift bookkeeping. A
//! *section* is a contiguous run of packets whose capture-time vs PCR
//! skew stays within the discontinuity threshold; sections split when
//! either clock jumps.

use super::jitter::JitterWindow;
use crate::error::{Result, TsKitError};
use crate::format::ts::parser::TsPacketParser;
use crate::format::ts::types::{pcr_to_90khz, TS_PACKET_SIZE};
use crate::net::RtpInfo;
use std::io::Write;

/// Default section-split threshold: 6 seconds on the 90 kHz clock.
pub const DEFAULT_DISCONTINUITY_THRESHOLD: u64 = 6 * 90_000;

/// Alignment score bounds.
const TS_GOOD_MAX: i32 = 10;
const TS_GOOD_MIN: i32 = -10;

/// A contiguous sub-range of a stream with bounded PCR/capture skew.
#[derive(Debug, Clone)]
pub struct StreamSection {
    /// Packet number of the first PCR-carrying packet in the section
    pub first_packet: u64,
    /// Packet number of the latest PCR-carrying packet
    pub last_packet: u64,
    /// First PCR (90 kHz)
    pub first_pcr: u64,
    /// Latest PCR (90 kHz)
    pub last_pcr: u64,
    /// Capture time at the first PCR (90 kHz)
    pub first_capture: u64,
    /// Capture time at the latest PCR (90 kHz)
    pub last_capture: u64,
    /// TS bytes accumulated over the section
    pub byte_count: u64,
    /// Minimum skew observed
    pub min_skew: i64,
    /// Maximum skew observed
    pub max_skew: i64,
    /// Maximum jitter observed
    pub max_jitter: u64,
    /// Minimum RTP-timestamp skew, when RTP wrapped the stream
    pub rtp_skew_min: i64,
    /// Maximum RTP-timestamp skew
    pub rtp_skew_max: i64,
    first_rtp: Option<(u64, u64)>, // (capture, rtp timestamp 90kHz)
    last_skew: i64,
}

impl StreamSection {
    fn new(packet_no: u64, pcr: u64, capture: u64) -> Self {
        Self {
            first_packet: packet_no,
            last_packet: packet_no,
            first_pcr: pcr,
            last_pcr: pcr,
            first_capture: capture,
            last_capture: capture,
            byte_count: 0,
            min_skew: 0,
            max_skew: 0,
            max_jitter: 0,
            rtp_skew_min: 0,
            rtp_skew_max: 0,
            first_rtp: None,
            last_skew: 0,
        }
    }

    /// Skew of a (capture, pcr) pair relative to the section's first
    /// PCR. Zero at the section start by construction.
    pub fn skew(&self, capture: u64, pcr: u64) -> i64 {
        (capture as i64 - pcr as i64) - (self.first_capture as i64 - self.first_pcr as i64)
    }

    /// Capture duration minus PCR duration over the section, in 90 kHz
    /// ticks. Positive when capture time runs ahead of the PCR clock.
    pub fn drift(&self) -> i64 {
        (self.last_capture - self.first_capture) as i64 - (self.last_pcr - self.first_pcr) as i64
    }

    /// PCR span of the section in 90 kHz ticks.
    pub fn pcr_duration(&self) -> u64 {
        self.last_pcr - self.first_pcr
    }

    /// Human-readable drift rate: per-minute amount and "1s per Ns".
    pub fn drift_desc(&self) -> String {
        let drift = self.drift();
        let span = self.pcr_duration();
        if drift == 0 || span == 0 {
            return "no drift".to_string();
        }
        let per_minute_ms = drift as f64 * 1000.0 / 90_000.0 * (60.0 * 90_000.0 / span as f64);
        let one_sec_per = span as f64 / drift.unsigned_abs() as f64 / 90_000.0;
        format!(
            "{:+.1}ms/min ({}1s per {:.0}s)",
            per_minute_ms,
            if drift > 0 { "+" } else { "-" },
            one_sec_per
        )
    }
}

/// TS alignment and PCR clock analyser for one stream.
pub struct PcrAnalyser {
    threshold: u64,
    trusted: bool,
    ts_good: i32,
    /// Payloads that scored fully aligned
    pub seen_good: u64,
    /// Payloads accepted with sync-byte warnings
    pub seen_dodgy: u64,
    /// Payloads rejected as not TS
    pub seen_bad: u64,
    /// TS packets examined
    pub packet_no: u64,
    pcr_pid: Option<u16>,
    alien_pid_logged: bool,
    sections: Vec<StreamSection>,
    jitter: JitterWindow,
    parser: TsPacketParser,
    csv: Option<Box<dyn Write + Send>>,
}

impl Default for PcrAnalyser {
    fn default() -> Self {
        Self::new(DEFAULT_DISCONTINUITY_THRESHOLD, false)
    }
}

impl PcrAnalyser {
    /// Creates an analyser with the given section-split threshold.
    /// `trusted` pins the alignment score at its maximum (the explicit
    /// dst:port filter case).
    pub fn new(threshold: u64, trusted: bool) -> Self {
        Self {
            threshold,
            trusted,
            ts_good: if trusted { TS_GOOD_MAX } else { 0 },
            seen_good: 0,
            seen_dodgy: 0,
            seen_bad: 0,
            packet_no: 0,
            pcr_pid: None,
            alien_pid_logged: false,
            sections: Vec::new(),
            jitter: JitterWindow::default(),
            parser: TsPacketParser::new(),
            csv: None,
        }
    }

    /// Attaches a CSV sink; the header row is written immediately.
    pub fn set_csv_sink(&mut self, mut sink: Box<dyn Write + Send>) -> Result<()> {
        writeln!(sink, "\"PKT\",\"Time\",\"PCR\",\"Skew\",\"Jitter\"")?;
        self.csv = Some(sink);
        Ok(())
    }

    /// Current alignment score (test hook; [-10, +10]).
    pub fn ts_good(&self) -> i32 {
        self.ts_good
    }

    /// Sections accumulated so far.
    pub fn sections(&self) -> &[StreamSection] {
        &self.sections
    }

    /// Feeds one UDP payload belonging to this stream.
    ///
    /// Alignment failures are reported as errors but leave the analyser
    /// consistent; the caller logs them and carries on (per-packet
    /// policy).
    pub fn add_payload(
        &mut self,
        stream_no: usize,
        capture: u64,
        payload: &[u8],
        rtp: Option<RtpInfo>,
    ) -> Result<()> {
        if payload.len() % TS_PACKET_SIZE != 0 {
            self.seen_bad += 1;
            self.bump_score(-2);
            return Err(TsKitError::MisalignedTs(payload.len()));
        }

        // Sync-byte sweep before anything is consumed
        let mut bad_sync = None;
        for (i, chunk) in payload.chunks_exact(TS_PACKET_SIZE).enumerate() {
            if chunk[0] != 0x47 {
                bad_sync = Some(i * TS_PACKET_SIZE);
                break;
            }
        }

        match bad_sync {
            None => {
                self.bump_score(1);
                self.seen_good += 1;
            }
            Some(offset) => {
                self.bump_score(-2);
                if self.ts_good < 0 {
                    self.seen_bad += 1;
                    return Err(TsKitError::NoSyncByte(offset));
                }
                // dodgy: accepted with a warning while the score holds up
                self.seen_dodgy += 1;
                log::warn!(
                    "stream {}: missing sync byte at offset {} (score {}), accepting",
                    stream_no,
                    offset,
                    self.ts_good
                );
            }
        }

        for chunk in payload.chunks_exact(TS_PACKET_SIZE) {
            self.packet_no += 1;
            if chunk[0] != 0x47 {
                continue;
            }
            self.add_ts_packet(stream_no, capture, chunk, rtp)?;
        }

        if let Some(section) = self.sections.last_mut() {
            section.byte_count += payload.len() as u64;
        }

        Ok(())
    }

    fn bump_score(&mut self, delta: i32) {
        if self.trusted {
            self.ts_good = TS_GOOD_MAX;
            return;
        }
        self.ts_good = (self.ts_good + delta).clamp(TS_GOOD_MIN, TS_GOOD_MAX);
    }

    fn add_ts_packet(
        &mut self,
        stream_no: usize,
        capture: u64,
        packet: &[u8],
        rtp: Option<RtpInfo>,
    ) -> Result<()> {
        let header = self.parser.parse_header(packet)?;
        let field = match self.parser.parse_adaptation_field(packet, 4)? {
            Some(f) => f,
            None => return Ok(()),
        };
        let pcr = match field.pcr {
            Some(p) => pcr_to_90khz(p),
            None => return Ok(()),
        };

        // One PCR PID per stream is assumed; a second logs once
        match self.pcr_pid {
            None => self.pcr_pid = Some(header.pid),
            Some(pid) if pid != header.pid => {
                if !self.alien_pid_logged {
                    self.alien_pid_logged = true;
                    let err = TsKitError::MultiplePcrPids {
                        first: pid,
                        second: header.pid,
                    };
                    log::warn!(
                        "stream {} packet {}: {} (capture {})",
                        stream_no,
                        self.packet_no,
                        err,
                        capture
                    );
                }
                return Ok(());
            }
            _ => {}
        }

        let start_new = match self.sections.last() {
            None => true,
            Some(section) => {
                let d_pcr = (pcr as i64 - section.last_pcr as i64).unsigned_abs();
                let d_cap = (capture as i64 - section.last_capture as i64).unsigned_abs();
                let skew = section.skew(capture, pcr);
                let d_skew = (skew - section.last_skew).unsigned_abs();
                d_pcr > self.threshold || d_cap > self.threshold || d_skew > self.threshold
            }
        };

        if start_new {
            if let Some(prev) = self.sections.last() {
                log::info!(
                    "stream {}: section {} ends at packet {} (pcr {}, capture {})",
                    stream_no,
                    self.sections.len() - 1,
                    prev.last_packet,
                    prev.last_pcr,
                    prev.last_capture
                );
            }
            self.jitter.clear();
            self.sections
                .push(StreamSection::new(self.packet_no, pcr, capture));
        }

        let section = self.sections.last_mut().expect("current section");
        let skew = section.skew(capture, pcr);
        let jitter = self.jitter.add(skew, capture);

        section.last_packet = self.packet_no;
        section.last_pcr = pcr;
        section.last_capture = capture;
        section.last_skew = skew;
        section.min_skew = section.min_skew.min(skew);
        section.max_skew = section.max_skew.max(skew);
        section.max_jitter = section.max_jitter.max(jitter);

        if let Some(info) = rtp {
            let rtp_90k = info.timestamp as u64;
            match section.first_rtp {
                None => section.first_rtp = Some((capture, rtp_90k)),
                Some((cap0, rtp0)) => {
                    let rtp_skew =
                        (capture as i64 - rtp_90k as i64) - (cap0 as i64 - rtp0 as i64);
                    section.rtp_skew_min = section.rtp_skew_min.min(rtp_skew);
                    section.rtp_skew_max = section.rtp_skew_max.max(rtp_skew);
                }
            }
        }

        if let Some(csv) = &mut self.csv {
            writeln!(
                csv,
                "{},{},{},{},{}",
                self.packet_no, capture, pcr, skew, jitter
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 188-byte TS packet with a PCR on the given PID.
    fn pcr_packet(pid: u16, pcr_90khz: u64) -> Vec<u8> {
        let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = ((pid >> 8) & 0x1F) as u8;
        packet[2] = (pid & 0xFF) as u8;
        packet[3] = 0x20; // adaptation field only
        packet[4] = 183; // fill the rest of the packet
        packet[5] = 0x10; // PCR flag
        let base = pcr_90khz; // extension zero
        packet[6] = (base >> 25) as u8;
        packet[7] = (base >> 17) as u8;
        packet[8] = (base >> 9) as u8;
        packet[9] = (base >> 1) as u8;
        packet[10] = (((base & 1) << 7) as u8) | 0x7E;
        packet[11] = 0;
        packet
    }

    fn plain_packet() -> Vec<u8> {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[3] = 0x10;
        packet
    }

    #[test]
    fn good_payload_scores_up() {
        let mut a = PcrAnalyser::default();
        a.add_payload(0, 0, &plain_packet(), None).unwrap();
        assert_eq!(a.ts_good(), 1);
        assert_eq!(a.seen_good, 1);
    }

    #[test]
    fn misaligned_payload_is_rejected() {
        let mut a = PcrAnalyser::default();
        assert!(matches!(
            a.add_payload(0, 0, &[0x47; 100], None),
            Err(TsKitError::MisalignedTs(100))
        ));
        assert_eq!(a.seen_bad, 1);
    }

    #[test]
    fn dodgy_payload_accepted_while_score_positive() {
        let mut a = PcrAnalyser::default();
        for _ in 0..4 {
            a.add_payload(0, 0, &plain_packet(), None).unwrap();
        }
        let mut bad = plain_packet();
        bad[0] = 0x48;
        a.add_payload(0, 0, &bad, None).unwrap();
        assert_eq!(a.seen_dodgy, 1);
        assert_eq!(a.ts_good(), 2);
    }

    #[test]
    fn trusted_score_is_pinned() {
        let mut a = PcrAnalyser::new(DEFAULT_DISCONTINUITY_THRESHOLD, true);
        let mut bad = plain_packet();
        bad[0] = 0x48;
        a.add_payload(0, 0, &bad, None).unwrap();
        assert_eq!(a.ts_good(), 10);
    }

    #[test]
    fn skew_zero_at_section_start() {
        let mut a = PcrAnalyser::default();
        a.add_payload(0, 1_000_000, &pcr_packet(0x68, 5_000_000), None)
            .unwrap();
        let section = &a.sections()[0];
        assert_eq!(section.skew(section.first_capture, section.first_pcr), 0);
        assert_eq!(section.min_skew, 0);
        assert_eq!(section.max_skew, 0);
    }

    #[test]
    fn section_splits_on_pcr_jump() {
        let mut a = PcrAnalyser::default();
        // Two PCRs 10s apart in capture but 16s apart in PCR
        a.add_payload(0, 0, &pcr_packet(0x68, 0), None).unwrap();
        a.add_payload(0, 10 * 90_000, &pcr_packet(0x68, 16 * 90_000), None)
            .unwrap();
        assert_eq!(a.sections().len(), 2);
    }

    #[test]
    fn contiguous_pcrs_share_a_section() {
        let mut a = PcrAnalyser::default();
        for i in 0..5u64 {
            a.add_payload(0, i * 90_000, &pcr_packet(0x68, i * 90_000), None)
                .unwrap();
        }
        assert_eq!(a.sections().len(), 1);
        let section = &a.sections()[0];
        assert_eq!(section.drift(), 0);
        assert_eq!(section.pcr_duration(), 4 * 90_000);
    }

    #[test]
    fn second_pcr_pid_is_ignored_after_warning() {
        let mut a = PcrAnalyser::default();
        a.add_payload(0, 0, &pcr_packet(0x68, 0), None).unwrap();
        a.add_payload(0, 90_000, &pcr_packet(0x69, 8_000_000), None)
            .unwrap();
        // the alien PID did not open a new section or move the clock
        assert_eq!(a.sections().len(), 1);
        assert_eq!(a.sections()[0].last_pcr, 0);
    }
}
