//! Transport Stream input for the server: demultiplexes by PID,
//! reassembles PES packets on payload_unit_start boundaries, and
//! surfaces PCRs from adaptation fields.
//!
//! Stream discovery follows PAT → PMT; the first video and first audio
//! elementary streams of the first program are served. The raw TS
//! packets spanning each PES are retained so `tsdirect` mode can mirror
//! the input byte-exactly.

use super::parser::TsPacketParser;
use super::types::*;
use crate::error::{Result, TsKitError};
use crate::format::pes::{pes_es_offset, PesKind, PesPacket, PesSource};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

struct PartialPes {
    first_offset: u64,
    pid: u16,
    kind: PesKind,
    data: BytesMut,
    pcr: Option<u64>,
}

impl PartialPes {
    fn declared_len(&self) -> Option<usize> {
        if self.data.len() < 6 {
            return None;
        }
        let len = u16::from_be_bytes([self.data[4], self.data[5]]) as usize;
        if len == 0 {
            None
        } else {
            Some(6 + len)
        }
    }

    fn finish(self, ts_packets: Option<Bytes>) -> Result<PesPacket> {
        let data: Bytes = self.data.freeze();
        if data.len() < 6 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
            return Err(TsKitError::Parser(format!(
                "PES accumulation on pid {:#06x} did not start with a PES header",
                self.pid
            )));
        }
        let stream_id = data[3];
        let es_offset = pes_es_offset(&data)?;
        Ok(PesPacket {
            file_offset: self.first_offset,
            stream_id,
            kind: self.kind,
            data,
            es_offset,
            pcr: self.pcr,
            ts_packets,
        })
    }
}

/// PES source over a Transport Stream file.
pub struct TsPesSource {
    path: PathBuf,
    file: BufReader<File>,
    posn: u64,
    parser: TsPacketParser,
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    /// Stream type byte of the served video stream, once the PMT is seen
    video_stream_type: Option<u8>,
    video_partial: Option<PartialPes>,
    audio_partial: Option<PartialPes>,
    ready: VecDeque<PesPacket>,
    /// Raw TS packets read since the last PES was delivered (attached
    /// to the next delivery for tsdirect)
    raw_since_delivery: BytesMut,
    keep_raw: bool,
    noaudio: bool,
    eof: bool,
}

impl TsPesSource {
    /// Opens a TS file. `keep_raw` retains the original TS packets per
    /// delivered PES (the tsdirect feed).
    pub async fn open(path: impl AsRef<Path>, noaudio: bool, keep_raw: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            file: BufReader::new(file),
            posn: 0,
            parser: TsPacketParser::new(),
            pmt_pid: None,
            video_pid: None,
            audio_pid: None,
            video_stream_type: None,
            video_partial: None,
            audio_partial: None,
            ready: VecDeque::new(),
            raw_since_delivery: BytesMut::new(),
            keep_raw,
            noaudio,
            eof: false,
        })
    }

    /// Stream type byte of the video stream (known after the PMT).
    pub fn video_stream_type(&self) -> Option<u8> {
        self.video_stream_type
    }

    fn take_raw(&mut self) -> Option<Bytes> {
        if self.keep_raw {
            Some(std::mem::take(&mut self.raw_since_delivery).freeze())
        } else {
            None
        }
    }

    fn handle_pmt(&mut self, pmt: &Pmt) {
        for info in &pmt.elementary_stream_infos {
            match info.stream_type {
                0x01 | STREAM_TYPE_H262 | STREAM_TYPE_H264 if self.video_pid.is_none() => {
                    self.video_pid = Some(info.elementary_pid);
                    self.video_stream_type = Some(info.stream_type);
                }
                STREAM_TYPE_MPEG_AUDIO
                | 0x04
                | 0x0F
                | STREAM_TYPE_AC3_DVB
                | STREAM_TYPE_AC3_ATSC
                    if self.audio_pid.is_none() =>
                {
                    self.audio_pid = Some(info.elementary_pid);
                }
                _ => {}
            }
        }
        log::debug!(
            "{}: PMT maps video pid {:?} (type {:?}), audio pid {:?}",
            self.path.display(),
            self.video_pid,
            self.video_stream_type,
            self.audio_pid
        );
    }

    /// Processes one TS packet, queueing any PES it completes.
    fn handle_packet(&mut self, offset: u64, packet: &[u8]) -> Result<()> {
        let header = self.parser.parse_header(packet)?;
        if header.transport_error {
            return Ok(());
        }

        let mut payload_offset = TS_HEADER_SIZE;
        let mut pcr = None;
        if header.adaptation_field_exists {
            if let Some(field) = self.parser.parse_adaptation_field(packet, 4)? {
                payload_offset += field.length + 1;
                pcr = field.pcr;
            }
        }
        if !header.contains_payload || payload_offset >= packet.len() {
            return Ok(());
        }
        let payload = &packet[payload_offset..];

        match header.pid {
            PID_PAT if header.payload_unit_start => {
                let table_offset = 1 + payload[0] as usize;
                if table_offset < payload.len() {
                    let pat = self.parser.parse_pat(&payload[table_offset..])?;
                    if let Some(entry) = pat.entries.iter().find(|e| e.program_number != 0) {
                        self.pmt_pid = Some(entry.program_map_pid);
                    }
                }
            }
            pid if Some(pid) == self.pmt_pid && header.payload_unit_start => {
                let table_offset = 1 + payload[0] as usize;
                if table_offset < payload.len() {
                    let pmt = self.parser.parse_pmt(&payload[table_offset..])?;
                    self.handle_pmt(&pmt);
                }
            }
            pid if Some(pid) == self.video_pid => {
                if header.payload_unit_start {
                    if let Some(done) = self.video_partial.take() {
                        let raw = self.take_raw();
                        self.ready.push_back(done.finish(raw)?);
                    }
                    self.video_partial = Some(PartialPes {
                        first_offset: offset,
                        pid,
                        kind: PesKind::Video,
                        data: BytesMut::from(payload),
                        pcr,
                    });
                } else if let Some(partial) = &mut self.video_partial {
                    partial.data.extend_from_slice(payload);
                    if partial.pcr.is_none() {
                        partial.pcr = pcr;
                    }
                }
            }
            pid if Some(pid) == self.audio_pid && !self.noaudio => {
                if header.payload_unit_start {
                    if let Some(done) = self.audio_partial.take() {
                        self.ready.push_back(done.finish(None)?);
                    }
                    self.audio_partial = Some(PartialPes {
                        first_offset: offset,
                        pid,
                        kind: PesKind::Audio,
                        data: BytesMut::from(payload),
                        pcr,
                    });
                } else if let Some(partial) = &mut self.audio_partial {
                    partial.data.extend_from_slice(payload);
                }
                // Audio PES declare their length; complete without
                // waiting for the next unit start
                if let Some(partial) = &self.audio_partial {
                    if let Some(total) = partial.declared_len() {
                        if partial.data.len() >= total {
                            let mut done = self.audio_partial.take().expect("audio partial");
                            done.data.truncate(total);
                            self.ready.push_back(done.finish(None)?);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PesSource for TsPesSource {
    async fn next_pes(&mut self) -> Result<Option<PesPacket>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }
            if self.eof {
                return Ok(None);
            }

            let offset = self.posn;
            let mut packet = [0u8; TS_PACKET_SIZE];
            match self.file.read_exact(&mut packet).await {
                Ok(_) => {
                    self.posn += TS_PACKET_SIZE as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    // Flush the in-flight video PES
                    if let Some(done) = self.video_partial.take() {
                        let raw = self.take_raw();
                        self.ready.push_back(done.finish(raw)?);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if self.keep_raw {
                self.raw_since_delivery.extend_from_slice(&packet);
            }
            if let Err(e) = self.handle_packet(offset, &packet) {
                if e.is_per_packet() {
                    log::warn!("{} at offset {}: {}, skipping packet", self.path.display(), offset, e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    async fn seek(&mut self, file_offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(file_offset)).await?;
        self.posn = file_offset;
        self.video_partial = None;
        self.audio_partial = None;
        self.ready.clear();
        self.raw_since_delivery.clear();
        self.eof = false;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        self.seek(0).await?;
        // Re-discover the program from scratch
        self.pmt_pid = None;
        self.video_pid = None;
        self.audio_pid = None;
        self.video_stream_type = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Crc32Mpeg2;
    use std::io::Write;

    fn psi_packet(pid: u16, table: &[u8]) -> Vec<u8> {
        let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x40 | ((pid >> 8) & 0x1F) as u8;
        packet[2] = (pid & 0xFF) as u8;
        packet[3] = 0x10;
        packet[4] = 0x00; // pointer field
        packet[5..5 + table.len()].copy_from_slice(table);
        packet
    }

    fn pat_packet(pmt_pid: u16) -> Vec<u8> {
        let mut table = vec![
            TABLE_ID_PAT,
            0xB0,
            0x0D,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0x00,
            0x01,
            0xE0 | ((pmt_pid >> 8) & 0x1F) as u8,
            (pmt_pid & 0xFF) as u8,
        ];
        let crc = Crc32Mpeg2::new().calculate(&table);
        table.extend_from_slice(&crc.to_be_bytes());
        psi_packet(PID_PAT, &table)
    }

    fn pmt_packet(pmt_pid: u16, video_pid: u16, stream_type: u8) -> Vec<u8> {
        let mut table = vec![
            TABLE_ID_PMT,
            0xB0,
            0x12,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | ((video_pid >> 8) & 0x1F) as u8,
            (video_pid & 0xFF) as u8,
            0xF0,
            0x00,
            stream_type,
            0xE0 | ((video_pid >> 8) & 0x1F) as u8,
            (video_pid & 0xFF) as u8,
            0xF0,
            0x00,
        ];
        let crc = Crc32Mpeg2::new().calculate(&table);
        table.extend_from_slice(&crc.to_be_bytes());
        psi_packet(pmt_pid, &table)
    }

    fn pes_packets(pid: u16, es: &[u8], continuity: &mut u8) -> Vec<u8> {
        // One PES packet spread over as many TS packets as needed
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0];
        let len = es.len() + 3;
        pes.extend_from_slice(&(len as u16).to_be_bytes());
        pes.extend_from_slice(&[0x80, 0x00, 0x00]);
        pes.extend_from_slice(es);

        let mut out = Vec::new();
        let mut first = true;
        for chunk in pes.chunks(TS_PACKET_SIZE - 4) {
            let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
            packet.push(0x47);
            packet.push(if first { 0x40 } else { 0x00 } | ((pid >> 8) & 0x1F) as u8);
            packet.push((pid & 0xFF) as u8);
            if chunk.len() == TS_PACKET_SIZE - 4 {
                packet.push(0x10 | *continuity);
                packet.extend_from_slice(chunk);
            } else {
                // adaptation-field stuffing to fill the packet
                let stuffing = TS_PACKET_SIZE - 4 - chunk.len();
                packet.push(0x30 | *continuity);
                packet.push((stuffing - 1) as u8);
                if stuffing > 1 {
                    packet.push(0x00);
                    packet.extend(std::iter::repeat(0xFF).take(stuffing - 2));
                }
                packet.extend_from_slice(chunk);
            }
            *continuity = (*continuity + 1) & 0x0F;
            out.extend(packet);
            first = false;
        }
        out
    }

    async fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tskit-ts-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn discovers_program_and_reassembles_pes() {
        let mut file = Vec::new();
        file.extend(pat_packet(0x20));
        file.extend(pmt_packet(0x20, 0x68, STREAM_TYPE_H262));
        let mut cc = 0u8;
        let es_a: Vec<u8> = [0x00, 0x00, 0x01, 0xB3]
            .iter()
            .copied()
            .chain(std::iter::repeat(0xAA).take(300))
            .collect();
        file.extend(pes_packets(0x68, &es_a, &mut cc));
        file.extend(pes_packets(0x68, &[0x00, 0x00, 0x01, 0x00, 0xBB], &mut cc));
        let path = write_temp("reassemble", &file).await;

        let mut src = TsPesSource::open(&path, false, false).await.unwrap();
        let a = src.next_pes().await.unwrap().unwrap();
        assert_eq!(a.kind, PesKind::Video);
        assert_eq!(a.es().len(), es_a.len());
        assert_eq!(&a.es()[..4], &[0x00, 0x00, 0x01, 0xB3]);
        assert_eq!(src.video_stream_type(), Some(STREAM_TYPE_H262));
        // first PES began in the third TS packet of the file
        assert_eq!(a.file_offset, 2 * TS_PACKET_SIZE as u64);

        let b = src.next_pes().await.unwrap().unwrap();
        assert_eq!(&b.es()[..], &[0x00, 0x00, 0x01, 0x00, 0xBB]);
        assert!(src.next_pes().await.unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn seek_restarts_at_a_pes_boundary() {
        let mut file = Vec::new();
        file.extend(pat_packet(0x20));
        file.extend(pmt_packet(0x20, 0x68, STREAM_TYPE_H264));
        let mut cc = 0u8;
        file.extend(pes_packets(0x68, &[0x00, 0x00, 0x01, 0x65, 0x11], &mut cc));
        file.extend(pes_packets(0x68, &[0x00, 0x00, 0x01, 0x41, 0x22], &mut cc));
        let path = write_temp("seek", &file).await;

        let mut src = TsPesSource::open(&path, false, false).await.unwrap();
        let first = src.next_pes().await.unwrap().unwrap();
        let second = src.next_pes().await.unwrap().unwrap();
        assert!(second.file_offset > first.file_offset);

        src.seek(second.file_offset).await.unwrap();
        let again = src.next_pes().await.unwrap().unwrap();
        assert_eq!(&again.data[..], &second.data[..]);
        std::fs::remove_file(&path).ok();
    }
}
