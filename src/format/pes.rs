//! PES packets and the elementary-stream reader.
//!
//! [`PesSource`] is the one face the serving core sees for its two input
//! formats: a PS file or a TS file, each yielding PES packets in file
//! order. [`EsReader`] sits on top and turns the video PES sequence into
//! elementary-stream *items* (start-code delimited units), tracking the
//! position of every byte so pictures can be re-read later by offset.
//!
//! The reader's start-code detection is an explicit three-byte rolling
//! window. Seeking re-primes that window: three bytes are read at the
//! target and the next-byte position is stepped back by two, so item
//! scanning resumes exactly at the sought start code.

use crate::error::{Result, TsKitError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Coarse classification of a PES packet's stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesKind {
    /// Video elementary stream (0xE0..=0xEF)
    Video,
    /// Audio elementary stream (0xC0..=0xDF) or private_stream_1
    Audio,
    /// Anything else (padding, system use)
    Other,
}

impl PesKind {
    /// Classifies a PES stream id byte.
    pub fn from_stream_id(stream_id: u8) -> Self {
        match stream_id {
            0xE0..=0xEF => PesKind::Video,
            0xC0..=0xDF | 0xBD => PesKind::Audio,
            _ => PesKind::Other,
        }
    }
}

/// One PES packet as read from the input, with enough position
/// information to find it again.
#[derive(Debug, Clone)]
pub struct PesPacket {
    /// File offset where this packet (or its first TS packet) begins
    pub file_offset: u64,
    /// The PES stream id byte
    pub stream_id: u8,
    /// Video / audio / other classification
    pub kind: PesKind,
    /// The whole PES packet: start code, header, ES data
    pub data: Bytes,
    /// Offset of the ES data within `data`
    pub es_offset: usize,
    /// PCR from the containing TS packets, 27 MHz (TS input only)
    pub pcr: Option<u64>,
    /// The original TS packets this PES was carried in (TS input only,
    /// kept for tsdirect mirroring)
    pub ts_packets: Option<Bytes>,
}

impl PesPacket {
    /// The elementary-stream bytes of this packet.
    pub fn es(&self) -> &[u8] {
        &self.data[self.es_offset..]
    }
}

/// Computes the offset of the ES data inside a PES packet, handling
/// both H.222.0 and MPEG-1 style headers. `data` starts at the
/// `00 00 01 sid` prefix.
pub fn pes_es_offset(data: &[u8]) -> Result<usize> {
    if data.len() < 6 {
        return Err(TsKitError::PacketTooShort("PES packet".into()));
    }
    let stream_id = data[3];
    // Stream ids with no PES header beyond the length field
    if let 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF = stream_id {
        return Ok(6);
    }
    if data.len() < 7 {
        return Err(TsKitError::PacketTooShort("PES header".into()));
    }
    if data[6] & 0xC0 == 0x80 {
        // H.222.0: flags then a header-data length byte
        if data.len() < 9 {
            return Err(TsKitError::PacketTooShort("PES header".into()));
        }
        return Ok(9 + data[8] as usize);
    }
    // MPEG-1: stuffing bytes, optional STD buffer size, then PTS/DTS
    let mut pos = 6;
    while pos < data.len() && data[pos] == 0xFF {
        pos += 1;
    }
    if pos < data.len() && data[pos] & 0xC0 == 0x40 {
        pos += 2;
    }
    if pos >= data.len() {
        return Err(TsKitError::PacketTooShort("MPEG-1 PES header".into()));
    }
    match data[pos] & 0xF0 {
        0x20 => Ok(pos + 5),       // PTS only
        0x30 => Ok(pos + 10),      // PTS + DTS
        _ => Ok(pos + 1),          // the 0x0F "no timestamps" byte
    }
}

/// A position in the elementary stream, expressed so the byte can be
/// found again: the file offset of the containing PES packet plus the
/// byte offset within that packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EsPosition {
    /// File offset of the containing PES packet
    pub infile: u64,
    /// Byte offset within the PES packet (header included)
    pub inpacket: u32,
}

impl PartialOrd for EsPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EsPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.infile, self.inpacket).cmp(&(other.infile, other.inpacket))
    }
}

impl std::fmt::Display for EsPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.infile, self.inpacket)
    }
}

/// A PES packet source: PS or TS file behind one face.
#[async_trait]
pub trait PesSource: Send {
    /// Reads the next PES packet in file order, or `None` at EOF.
    async fn next_pes(&mut self) -> Result<Option<PesPacket>>;

    /// Positions the source so the next packet read is the one starting
    /// at `file_offset`.
    async fn seek(&mut self, file_offset: u64) -> Result<()>;

    /// Rewinds to the start of the input, fully re-priming internal
    /// state (PAT/PMT discovery included for TS input).
    async fn rewind(&mut self) -> Result<()>;
}

/// An elementary-stream item: one start-code delimited unit, prefix
/// included.
#[derive(Debug, Clone)]
pub struct EsItem {
    /// The byte following the `00 00 01` prefix
    pub start_code: u8,
    /// The unit's bytes, `00 00 01` prefix included
    pub data: Bytes,
    /// Position of the first prefix byte
    pub start: EsPosition,
}

impl EsItem {
    /// Payload bytes after the prefix and start-code byte.
    pub fn payload(&self) -> &[u8] {
        &self.data[4..]
    }
}

struct CurrentPes {
    packet: PesPacket,
    /// Next ES byte to consume, as an index into `packet.data`
    pos: usize,
}

/// Elementary-stream reader over the video PES sequence.
///
/// Audio and completed video packets encountered along the way are
/// queued on `outgoing` in file order so the serving loop can mirror
/// them; trick-play modes drain and drop the queue instead.
pub struct EsReader {
    source: Box<dyn PesSource>,
    cur: Option<CurrentPes>,
    /// Packets to mirror downstream: audio on arrival, video when the
    /// reader has consumed past them
    outgoing: VecDeque<PesPacket>,
    /// Rolling window of the last three consumed bytes and positions
    window: [(u8, EsPosition); 3],
    window_len: u8,
    /// Item whose start code terminated the previous picture
    pending: Option<EsItem>,
    /// Suppress the auto-mirror of the current packet when it completes
    /// (set when the packet has already been partially emitted around a
    /// mode transition)
    dont_write_current_packet: bool,
    eof: bool,
}

impl EsReader {
    /// Wraps a PES source.
    pub fn new(source: Box<dyn PesSource>) -> Self {
        Self {
            source,
            cur: None,
            outgoing: VecDeque::new(),
            window: [(0, EsPosition::default()); 3],
            window_len: 0,
            pending: None,
            dont_write_current_packet: false,
            eof: false,
        }
    }

    /// True once the underlying source has been exhausted.
    pub fn at_eof(&self) -> bool {
        self.eof && self.cur.is_none() && self.pending.is_none()
    }

    /// Position of the item that terminated the previous picture: the
    /// split point for partial-packet flushes at mode transitions.
    pub fn pending_item_start(&self) -> Option<EsPosition> {
        self.pending.as_ref().map(|item| item.start)
    }

    /// File offset of the PES packet currently being consumed.
    pub fn current_packet_offset(&self) -> Option<u64> {
        self.cur.as_ref().map(|c| c.packet.file_offset)
    }

    /// The PES packet currently being consumed.
    pub fn current_packet(&self) -> Option<&PesPacket> {
        self.cur.as_ref().map(|c| &c.packet)
    }

    /// Drains the mirror queue (audio packets, and video packets the
    /// reader has moved past).
    pub fn take_outgoing(&mut self) -> VecDeque<PesPacket> {
        std::mem::take(&mut self.outgoing)
    }

    /// Marks the current packet as already emitted so it is not
    /// mirrored again when the reader consumes past its end.
    pub fn suppress_current_packet_write(&mut self) {
        self.dont_write_current_packet = true;
    }

    /// Puts an item back so the next [`next_item`](Self::next_item)
    /// returns it again.
    pub fn push_back_item(&mut self, item: EsItem) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(item);
    }

    async fn next_video_packet(&mut self) -> Result<Option<PesPacket>> {
        loop {
            match self.source.next_pes().await? {
                None => return Ok(None),
                Some(packet) => match packet.kind {
                    PesKind::Video => return Ok(Some(packet)),
                    PesKind::Audio => self.outgoing.push_back(packet),
                    PesKind::Other => {}
                },
            }
        }
    }

    /// Consumes one ES byte, rolling the window.
    async fn next_byte(&mut self) -> Result<Option<(u8, EsPosition)>> {
        loop {
            match &mut self.cur {
                Some(cur) if cur.pos < cur.packet.data.len() => {
                    let byte = cur.packet.data[cur.pos];
                    let posn = EsPosition {
                        infile: cur.packet.file_offset,
                        inpacket: cur.pos as u32,
                    };
                    cur.pos += 1;
                    self.window.rotate_left(1);
                    self.window[2] = (byte, posn);
                    self.window_len = (self.window_len + 1).min(3);
                    return Ok(Some((byte, posn)));
                }
                _ => {
                    // Move past the current packet, mirroring it unless
                    // a transition already emitted it piecemeal.
                    if let Some(done) = self.cur.take() {
                        if self.dont_write_current_packet {
                            self.dont_write_current_packet = false;
                        } else {
                            self.outgoing.push_back(done.packet);
                        }
                    }
                    match self.next_video_packet().await? {
                        None => {
                            self.eof = true;
                            return Ok(None);
                        }
                        Some(packet) => {
                            let pos = packet.es_offset;
                            self.cur = Some(CurrentPes { packet, pos });
                        }
                    }
                }
            }
        }
    }

    fn window_is_prefix(&self) -> bool {
        self.window_len >= 3
            && self.window[0].0 == 0
            && self.window[1].0 == 0
            && self.window[2].0 == 1
    }

    /// Reads the next ES item, or `None` at end of stream.
    pub async fn next_item(&mut self) -> Result<Option<EsItem>> {
        if let Some(item) = self.pending.take() {
            return Ok(Some(item));
        }

        // Hunt for a start-code prefix unless the window already holds
        // one (left there by the previous item, or by a seek re-prime).
        while !self.window_is_prefix() {
            match self.next_byte().await? {
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let start = self.window[0].1;
        let mut data = BytesMut::from(&[0u8, 0, 1][..]);
        let start_code = match self.next_byte().await? {
            Some((byte, _)) => byte,
            None => return Ok(None), // dangling prefix at EOF
        };
        data.extend_from_slice(&[start_code]);

        loop {
            match self.next_byte().await? {
                None => break,
                Some((byte, _)) => {
                    data.extend_from_slice(&[byte]);
                    if self.window_is_prefix() {
                        // The trailing three bytes belong to the next item
                        data.truncate(data.len() - 3);
                        break;
                    }
                }
            }
        }

        Ok(Some(EsItem {
            start_code,
            data: data.freeze(),
            start,
        }))
    }

    /// Seeks the elementary stream to an item boundary.
    ///
    /// The window is re-primed by reading three bytes at the target and
    /// stepping the logical next-byte position back past two of them:
    /// the re-primed window is exactly the `00 00 01` prefix of the
    /// item at `pos`, so the next [`next_item`](Self::next_item) call
    /// frames that item.
    pub async fn seek(&mut self, pos: EsPosition) -> Result<()> {
        self.source.seek(pos.infile).await?;
        let packet = self
            .next_video_packet()
            .await?
            .ok_or_else(|| TsKitError::SeekFailed(format!("no PES packet at {}", pos.infile)))?;
        if packet.file_offset != pos.infile {
            return Err(TsKitError::SeekFailed(format!(
                "sought {} but found packet at {}",
                pos.infile, packet.file_offset
            )));
        }
        if (pos.inpacket as usize) >= packet.data.len() {
            return Err(TsKitError::SeekFailed(format!(
                "offset {} beyond packet of {} bytes",
                pos.inpacket,
                packet.data.len()
            )));
        }
        self.cur = Some(CurrentPes {
            packet,
            pos: pos.inpacket as usize,
        });
        self.pending = None;
        self.eof = false;
        self.window_len = 0;
        self.dont_write_current_packet = false;
        // Re-prime the three-byte window
        for _ in 0..3 {
            if self.next_byte().await?.is_none() {
                return Err(TsKitError::SeekFailed(format!(
                    "EOF re-priming window at {}",
                    pos
                )));
            }
        }
        // Seeks land on item boundaries; anything else means the caller
        // handed us a position that was never an item start.
        if !self.window_is_prefix() {
            return Err(TsKitError::SeekFailed(format!(
                "no start-code prefix at {}",
                pos
            )));
        }
        // Discard the mirror of the partially-consumed target packet:
        // the transition logic emits the right parts itself.
        self.outgoing.clear();
        Ok(())
    }

    /// Rewinds to the start of the input and fully re-primes.
    pub async fn rewind(&mut self) -> Result<()> {
        self.source.rewind().await?;
        self.cur = None;
        self.outgoing.clear();
        self.pending = None;
        self.window_len = 0;
        self.dont_write_current_packet = false;
        self.eof = false;
        Ok(())
    }

    /// Re-reads `len` ES bytes starting at `pos`, following the ES
    /// across PES packet boundaries. Used by reverse play; does not
    /// disturb the mirror queue. Moves the underlying source, so
    /// forward framing must be re-seeked before it resumes.
    pub async fn read_at(&mut self, pos: EsPosition, len: u32) -> Result<Bytes> {
        self.source.seek(pos.infile).await?;
        let mut collected = BytesMut::with_capacity(len as usize);
        let mut offset_in_packet = Some(pos.inpacket as usize);

        while collected.len() < len as usize {
            let packet = loop {
                match self.source.next_pes().await? {
                    None => {
                        return Err(TsKitError::PictureRead(format!(
                            "EOF re-reading {} bytes at {}",
                            len, pos
                        )))
                    }
                    Some(p) if p.kind == PesKind::Video => break p,
                    Some(_) => {}
                }
            };
            let from = match offset_in_packet.take() {
                Some(inpacket) => {
                    if inpacket < packet.es_offset || inpacket >= packet.data.len() {
                        return Err(TsKitError::PictureRead(format!(
                            "offset {} outside ES data of packet at {}",
                            inpacket, packet.file_offset
                        )));
                    }
                    inpacket
                }
                None => packet.es_offset,
            };
            let want = len as usize - collected.len();
            let avail = packet.data.len() - from;
            collected.extend_from_slice(&packet.data[from..from + avail.min(want)]);
        }

        Ok(collected.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory PES source: one video PES packet per entry.
    pub(crate) struct VecPesSource {
        packets: Vec<PesPacket>,
        next: usize,
    }

    impl VecPesSource {
        pub(crate) fn from_es_chunks(chunks: &[&[u8]]) -> Self {
            let mut packets = Vec::new();
            let mut offset = 0u64;
            for chunk in chunks {
                // Minimal H.222.0 video PES header with no options
                let mut data = BytesMut::new();
                data.extend_from_slice(&[0x00, 0x00, 0x01, 0xE0]);
                let len = chunk.len() + 3;
                data.extend_from_slice(&(len as u16).to_be_bytes());
                data.extend_from_slice(&[0x80, 0x00, 0x00]);
                data.extend_from_slice(chunk);
                let total = data.len() as u64;
                packets.push(PesPacket {
                    file_offset: offset,
                    stream_id: 0xE0,
                    kind: PesKind::Video,
                    data: data.freeze(),
                    es_offset: 9,
                    pcr: None,
                    ts_packets: None,
                });
                offset += total;
            }
            Self { packets, next: 0 }
        }
    }

    #[async_trait]
    impl PesSource for VecPesSource {
        async fn next_pes(&mut self) -> Result<Option<PesPacket>> {
            let packet = self.packets.get(self.next).cloned();
            if packet.is_some() {
                self.next += 1;
            }
            Ok(packet)
        }

        async fn seek(&mut self, file_offset: u64) -> Result<()> {
            self.next = self
                .packets
                .iter()
                .position(|p| p.file_offset == file_offset)
                .ok_or_else(|| {
                    TsKitError::SeekFailed(format!("no packet at {}", file_offset))
                })?;
            Ok(())
        }

        async fn rewind(&mut self) -> Result<()> {
            self.next = 0;
            Ok(())
        }
    }

    #[tokio::test]
    async fn items_are_framed_across_packets() {
        // Two items, the second split across two PES packets
        let source = VecPesSource::from_es_chunks(&[
            &[0x00, 0x00, 0x01, 0xB3, 0xAA, 0xBB, 0x00, 0x00, 0x01],
            &[0x00, 0x11, 0x22],
        ]);
        let mut es = EsReader::new(Box::new(source));

        let first = es.next_item().await.unwrap().unwrap();
        assert_eq!(first.start_code, 0xB3);
        assert_eq!(&first.data[..], &[0x00, 0x00, 0x01, 0xB3, 0xAA, 0xBB]);

        let second = es.next_item().await.unwrap().unwrap();
        assert_eq!(second.start_code, 0x00);
        assert_eq!(&second.data[..], &[0x00, 0x00, 0x01, 0x00, 0x11, 0x22]);

        assert!(es.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_positions_are_recorded() {
        let source = VecPesSource::from_es_chunks(&[&[
            0x00, 0x00, 0x01, 0xB3, 0xAA, 0x00, 0x00, 0x01, 0x00, 0xBB,
        ]]);
        let mut es = EsReader::new(Box::new(source));

        let first = es.next_item().await.unwrap().unwrap();
        // ES data begins at byte 9 of the PES packet
        assert_eq!(first.start, EsPosition { infile: 0, inpacket: 9 });
        let second = es.next_item().await.unwrap().unwrap();
        assert_eq!(
            second.start,
            EsPosition {
                infile: 0,
                inpacket: 14
            }
        );
    }

    #[tokio::test]
    async fn seek_reprimes_the_window() {
        let source = VecPesSource::from_es_chunks(&[&[
            0x00, 0x00, 0x01, 0xB3, 0xAA, 0x00, 0x00, 0x01, 0x00, 0xBB,
        ]]);
        let mut es = EsReader::new(Box::new(source));
        let _ = es.next_item().await.unwrap().unwrap();
        let second = es.next_item().await.unwrap().unwrap();

        es.seek(second.start).await.unwrap();
        let again = es.next_item().await.unwrap().unwrap();
        assert_eq!(again.start_code, second.start_code);
        assert_eq!(&again.data[..], &second.data[..]);
        assert_eq!(again.start, second.start);
    }

    #[tokio::test]
    async fn read_at_spans_packets() {
        let source = VecPesSource::from_es_chunks(&[
            &[0x00, 0x00, 0x01, 0xB3, 0xAA, 0xBB],
            &[0xCC, 0xDD],
        ]);
        let mut es = EsReader::new(Box::new(source));
        let got = es
            .read_at(EsPosition { infile: 0, inpacket: 9 }, 8)
            .await
            .unwrap();
        assert_eq!(
            &got[..],
            &[0x00, 0x00, 0x01, 0xB3, 0xAA, 0xBB, 0xCC, 0xDD]
        );
    }

    #[tokio::test]
    async fn completed_packets_are_mirrored_once() {
        let source = VecPesSource::from_es_chunks(&[
            &[0x00, 0x00, 0x01, 0xB3, 0xAA],
            &[0x00, 0x00, 0x01, 0x00, 0xBB],
        ]);
        let mut es = EsReader::new(Box::new(source));
        let _ = es.next_item().await.unwrap();
        let _ = es.next_item().await.unwrap();
        assert!(es.next_item().await.unwrap().is_none());
        let outgoing = es.take_outgoing();
        assert_eq!(outgoing.len(), 2);
        assert!(es.take_outgoing().is_empty());
    }
}
