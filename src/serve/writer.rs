//! The output side of the server: PES→TS packetisation into a bounded
//! ring buffer, drained to the client socket by its own task.
//!
//! The producer (the trick-play loop) is the only writer; the drainer
//! is the only consumer. Decorators for load and loss testing sit at
//! the send point: N PES padding packets per real packet, and dropping
//! the last `d` of every `k + d` TS packets.

use crate::error::{Result, TsKitError};
use crate::format::ts::types::*;
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// PID the padding decorator's PES packets ride on.
pub const PID_PES_PADDING: u16 = 0x1ffe;

/// Ring buffer depth, in TS packets.
pub const RING_CAPACITY: usize = 1024;

/// How the output is packetised and decorated.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// PID for the served video stream
    pub video_pid: u16,
    /// PID for the served audio stream
    pub audio_pid: u16,
    /// PID for the synthesised PMT
    pub pmt_pid: u16,
    /// Stream type byte advertised for video
    pub video_stream_type: u8,
    /// Stream type byte advertised for audio
    pub audio_stream_type: u8,
    /// AC-3 announcement descriptor tag, when audio is Dolby
    pub ac3_descriptor: Option<u8>,
    /// PES padding packets to insert per real packet
    pub pes_padding: u32,
    /// Drop the last `d` of every `k + d` packets: `(k, d)`
    pub drop: Option<(u32, u32)>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            video_pid: PID_VIDEO,
            audio_pid: PID_AUDIO,
            pmt_pid: PID_PMT,
            video_stream_type: STREAM_TYPE_H262,
            audio_stream_type: STREAM_TYPE_MPEG_AUDIO,
            ac3_descriptor: None,
            pes_padding: 0,
            drop: None,
        }
    }
}

/// Producer handle over the ring buffer.
pub struct TsWriter {
    tx: mpsc::Sender<Bytes>,
    config: WriterConfig,
    continuity: HashMap<u16, u8>,
    crc: Crc32Mpeg2,
    psi_version: u8,
    drop_counter: u32,
    padding_pes: Bytes,
}

impl TsWriter {
    /// Creates the writer and the receiving end for a drainer.
    pub fn channel(config: WriterConfig) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(RING_CAPACITY);
        let padding_pes = build_padding_pes();
        (
            Self {
                tx,
                config,
                continuity: HashMap::new(),
                crc: Crc32Mpeg2::new(),
                psi_version: 0,
                drop_counter: 0,
                padding_pes,
            },
            rx,
        )
    }

    /// The writer's configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Mutable configuration access: the worker adjusts the advertised
    /// stream types once it knows what a file carries.
    pub fn config_mut(&mut self) -> &mut WriterConfig {
        &mut self.config
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0x0F);
        *counter = (*counter + 1) & 0x0F;
        *counter
    }

    /// Sends one 188-byte packet through the decorators into the ring.
    async fn send(&mut self, packet: Bytes) -> Result<()> {
        debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
        self.send_one(packet).await?;
        for _ in 0..self.config.pes_padding {
            let padding = self.padding_pes.clone();
            let ts = self.packetise_pes(&padding, PID_PES_PADDING)?;
            for p in ts {
                self.send_one(p).await?;
            }
        }
        Ok(())
    }

    async fn send_one(&mut self, packet: Bytes) -> Result<()> {
        if let Some((keep, drop)) = self.config.drop {
            let cycle = keep + drop;
            if cycle > 0 {
                let position = self.drop_counter;
                self.drop_counter = (self.drop_counter + 1) % cycle;
                if position >= keep {
                    return Ok(());
                }
            }
        }
        self.tx
            .send(packet)
            .await
            .map_err(|_| TsKitError::WriterClosed)
    }

    /// Mirrors a raw chunk of 188-byte packets (tsdirect mode).
    pub async fn write_raw_ts(&mut self, packets: &[u8]) -> Result<()> {
        if packets.len() % TS_PACKET_SIZE != 0 {
            return Err(TsKitError::MisalignedTs(packets.len()));
        }
        for chunk in packets.chunks_exact(TS_PACKET_SIZE) {
            self.send(Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(())
    }

    /// Writes `n` null packets (the `-pad` leader).
    pub async fn write_null_packets(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
            packet.extend_from_slice(&[0x47, 0x1f, 0xff, 0x10]);
            packet.resize(TS_PACKET_SIZE, 0xFF);
            self.send(packet.freeze()).await?;
        }
        Ok(())
    }

    /// Packetises a complete PES packet onto `pid`.
    pub async fn write_pes_as_ts(&mut self, pes: &[u8], pid: u16) -> Result<()> {
        let packets = self.packetise_pes(pes, pid)?;
        for packet in packets {
            self.send(packet).await?;
        }
        Ok(())
    }

    /// Builds a PES packet around elementary-stream parts and writes it.
    /// Used for reversed and filtered pictures, and for the suffix data
    /// emitted when normal play resumes mid-packet.
    pub async fn write_es_as_pes(
        &mut self,
        parts: &[&[u8]],
        stream_id: u8,
        pid: u16,
    ) -> Result<()> {
        let pes = build_pes(parts, stream_id);
        self.write_pes_as_ts(&pes, pid).await
    }

    /// Emits fresh PAT and PMT packets.
    pub async fn write_program_tables(&mut self) -> Result<()> {
        let pat = self.build_pat_packet()?;
        let pmt = self.build_pmt_packet()?;
        self.send(pat).await?;
        self.send(pmt).await?;
        Ok(())
    }

    fn packetise_pes(&mut self, pes: &[u8], pid: u16) -> Result<Vec<Bytes>> {
        let mut out = Vec::with_capacity(pes.len() / (TS_PACKET_SIZE - 4) + 1);
        let mut first = true;
        for chunk in pes.chunks(TS_PACKET_SIZE - 4) {
            let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
            let header = TsHeader {
                payload_unit_start: first,
                pid,
                adaptation_field_exists: chunk.len() < TS_PACKET_SIZE - 4,
                contains_payload: true,
                continuity_counter: self.next_continuity(pid),
                ..Default::default()
            };
            header.write_to(&mut packet)?;
            if chunk.len() < TS_PACKET_SIZE - 4 {
                // stuff the shortfall into an adaptation field
                let stuffing = TS_PACKET_SIZE - 4 - chunk.len();
                packet.put_u8((stuffing - 1) as u8);
                if stuffing > 1 {
                    packet.put_u8(0x00);
                    for _ in 0..stuffing - 2 {
                        packet.put_u8(0xFF);
                    }
                }
            }
            packet.extend_from_slice(chunk);
            debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
            out.push(packet.freeze());
            first = false;
        }
        Ok(out)
    }

    fn build_pat_packet(&mut self) -> Result<Bytes> {
        let pat = Pat::single_program(self.config.pmt_pid);
        let mut body = BytesMut::new();
        pat.write_to(&mut body)?;
        self.build_section_packet(PID_PAT, TABLE_ID_PAT, 1, &body)
    }

    fn build_pmt_packet(&mut self) -> Result<Bytes> {
        let mut pmt = Pmt::new();
        pmt.pcr_pid = self.config.video_pid;
        pmt.elementary_stream_infos.push(ElementaryStreamInfo {
            stream_type: self.config.video_stream_type,
            elementary_pid: self.config.video_pid,
            descriptors: Vec::new(),
        });
        let audio_descriptors = match self.config.ac3_descriptor {
            Some(tag) => vec![Descriptor {
                tag,
                data: Vec::new(),
            }],
            None => Vec::new(),
        };
        pmt.elementary_stream_infos.push(ElementaryStreamInfo {
            stream_type: self.config.audio_stream_type,
            elementary_pid: self.config.audio_pid,
            descriptors: audio_descriptors,
        });
        let mut body = BytesMut::new();
        pmt.write_to(&mut body)?;
        self.build_section_packet(self.config.pmt_pid, TABLE_ID_PMT, 1, &body)
    }

    fn build_section_packet(
        &mut self,
        pid: u16,
        table_id: u8,
        table_id_ext: u16,
        body: &[u8],
    ) -> Result<Bytes> {
        let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
        let header = TsHeader {
            payload_unit_start: true,
            pid,
            contains_payload: true,
            continuity_counter: self.next_continuity(pid),
            ..Default::default()
        };
        header.write_to(&mut packet)?;

        packet.put_u8(0x00); // pointer field
        let section_start = packet.len();
        packet.put_u8(table_id);
        let section_length = 5 + body.len() + 4;
        packet.put_u16(0xB000 | (section_length as u16 & 0x03FF));
        packet.put_u16(table_id_ext);
        packet.put_u8(0xC0 | ((self.psi_version & 0x1F) << 1) | 0x01);
        packet.put_u8(0x00); // section number
        packet.put_u8(0x00); // last section number
        packet.extend_from_slice(body);

        let crc = self.crc.calculate(&packet[section_start..]);
        packet.put_u32(crc);

        packet.resize(TS_PACKET_SIZE, 0xFF);
        Ok(packet.freeze())
    }
}

/// Builds a PES packet around ES parts. Lengths that fit the 16-bit
/// field are declared; larger video payloads use the unbounded form.
pub fn build_pes(parts: &[&[u8]], stream_id: u8) -> Bytes {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut pes = BytesMut::with_capacity(total + 9);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let declared = total + 3;
    if declared <= u16::MAX as usize {
        pes.put_u16(declared as u16);
    } else {
        pes.put_u16(0);
    }
    pes.extend_from_slice(&[0x80, 0x00, 0x00]);
    for part in parts {
        pes.extend_from_slice(part);
    }
    pes.freeze()
}

fn build_padding_pes() -> Bytes {
    let mut pes = BytesMut::with_capacity(46);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, STREAM_ID_PADDING]);
    pes.put_u16(40);
    pes.extend_from_slice(&[0xFF; 40]);
    pes.freeze()
}

/// Spawns the drainer task: pulls packets from the ring and writes them
/// to the socket, pacing in bursts when requested.
pub fn spawn_drainer<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut sink: W,
    pace: Option<Duration>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        const BURST: usize = 64;
        let mut in_burst = 0usize;
        while let Some(packet) = rx.recv().await {
            if let Err(e) = sink.write_all(&packet).await {
                log::info!("output drain stopped: {}", e);
                rx.close();
                return;
            }
            in_burst += 1;
            if in_burst >= BURST {
                in_burst = 0;
                if sink.flush().await.is_err() {
                    rx.close();
                    return;
                }
                if let Some(gap) = pace {
                    tokio::time::sleep(gap).await;
                }
            }
        }
        let _ = sink.flush().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::parser::TsPacketParser;

    fn writer() -> (TsWriter, mpsc::Receiver<Bytes>) {
        TsWriter::channel(WriterConfig::default())
    }

    async fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            out.push(packet);
        }
        out
    }

    #[tokio::test]
    async fn every_packet_is_188_with_sync() {
        let (mut w, mut rx) = writer();
        w.write_program_tables().await.unwrap();
        w.write_es_as_pes(&[&[0u8; 500]], STREAM_ID_VIDEO, PID_VIDEO)
            .await
            .unwrap();
        for packet in drain(&mut rx).await {
            assert_eq!(packet.len(), TS_PACKET_SIZE);
            assert_eq!(packet[0], 0x47);
        }
    }

    #[tokio::test]
    async fn pes_packetisation_sets_pusi_on_first_only() {
        let (mut w, mut rx) = writer();
        w.write_es_as_pes(&[&[0u8; 400]], STREAM_ID_VIDEO, PID_VIDEO)
            .await
            .unwrap();
        let packets = drain(&mut rx).await;
        assert!(packets.len() >= 3);
        let parser = TsPacketParser::new();
        for (i, packet) in packets.iter().enumerate() {
            let header = parser.parse_header(packet).unwrap();
            assert_eq!(header.payload_unit_start, i == 0);
            assert_eq!(header.pid, PID_VIDEO);
        }
    }

    #[tokio::test]
    async fn continuity_counters_increment_per_pid() {
        let (mut w, mut rx) = writer();
        w.write_es_as_pes(&[&[0u8; 600]], STREAM_ID_VIDEO, PID_VIDEO)
            .await
            .unwrap();
        let packets = drain(&mut rx).await;
        let parser = TsPacketParser::new();
        let counters: Vec<u8> = packets
            .iter()
            .map(|p| parser.parse_header(p).unwrap().continuity_counter)
            .collect();
        for pair in counters.windows(2) {
            assert_eq!(pair[1], (pair[0] + 1) & 0x0F);
        }
    }

    #[tokio::test]
    async fn program_tables_parse_back() {
        let (mut w, mut rx) = writer();
        w.write_program_tables().await.unwrap();
        let packets = drain(&mut rx).await;
        assert_eq!(packets.len(), 2);
        let parser = TsPacketParser::new();

        let pat_payload = &packets[0][4..];
        let pat = parser.parse_pat(&pat_payload[1 + pat_payload[0] as usize..]).unwrap();
        assert_eq!(pat.entries[0].program_map_pid, PID_PMT);

        let pmt_payload = &packets[1][4..];
        let pmt = parser.parse_pmt(&pmt_payload[1 + pmt_payload[0] as usize..]).unwrap();
        assert_eq!(pmt.pcr_pid, PID_VIDEO);
        assert_eq!(pmt.elementary_stream_infos.len(), 2);
    }

    #[tokio::test]
    async fn drop_decorator_removes_tail_of_cycle() {
        let config = WriterConfig {
            drop: Some((3, 1)),
            ..Default::default()
        };
        let (mut w, mut rx) = TsWriter::channel(config);
        w.write_null_packets(8).await.unwrap();
        let packets = drain(&mut rx).await;
        // 8 offered, cycle keeps 3 of every 4
        assert_eq!(packets.len(), 6);
    }

    #[tokio::test]
    async fn pes_padding_decorator_inserts_packets() {
        let config = WriterConfig {
            pes_padding: 1,
            ..Default::default()
        };
        let (mut w, mut rx) = TsWriter::channel(config);
        w.write_null_packets(1).await.unwrap();
        let packets = drain(&mut rx).await;
        assert_eq!(packets.len(), 2);
        let parser = TsPacketParser::new();
        let header = parser.parse_header(&packets[1]).unwrap();
        assert_eq!(header.pid, PID_PES_PADDING);
    }

    #[tokio::test]
    async fn closed_ring_reports_writer_closed() {
        let (mut w, rx) = writer();
        drop(rx);
        assert!(matches!(
            w.write_null_packets(1).await,
            Err(TsKitError::WriterClosed)
        ));
    }

    #[test]
    fn build_pes_declares_small_lengths() {
        let pes = build_pes(&[&[1, 2, 3]], STREAM_ID_VIDEO);
        assert_eq!(&pes[..4], &[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);
        assert_eq!(u16::from_be_bytes([pes[4], pes[5]]), 6);
        assert_eq!(&pes[9..], &[1, 2, 3]);
    }
}
