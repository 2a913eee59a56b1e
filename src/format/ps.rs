//! Program Stream reading.
//!
//! Locates pack headers (`00 00 01 BA`), tolerates inter-pack padding
//! (long zero runs from DVD authoring tools), and yields the PES
//! packets inside each pack. MPEG-1 and H.222.0 pack headers are
//! distinguished by the nibble after the start code.

use super::pes::{pes_es_offset, PesKind, PesPacket, PesSource};
use crate::error::{Result, TsKitError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

const PACK_HEADER: u8 = 0xBA;
const SYSTEM_HEADER: u8 = 0xBB;
const PROGRAM_END: u8 = 0xB9;

/// PES source over a Program Stream file.
pub struct PsPesSource {
    path: PathBuf,
    file: BufReader<File>,
    /// Absolute file offset of the next unread byte
    posn: u64,
    /// Count of packs seen since open/rewind (drives PAT/PMT repetition
    /// upstream)
    packs_seen: u64,
    /// Skip audio PES entirely
    noaudio: bool,
    eof: bool,
    padding_logged: bool,
}

impl PsPesSource {
    /// Opens a PS file.
    pub async fn open(path: impl AsRef<Path>, noaudio: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            file: BufReader::new(file),
            posn: 0,
            packs_seen: 0,
            noaudio,
            eof: false,
            padding_logged: false,
        })
    }

    /// Packs seen since open or rewind.
    pub fn packs_seen(&self) -> u64 {
        self.packs_seen
    }

    async fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.file.read_exact(&mut b).await {
            Ok(_) => {
                self.posn += 1;
                Ok(Some(b[0]))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.file.read_exact(buf).await {
            Ok(_) => {
                self.posn += buf.len() as u64;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Scans to the next `00 00 01` prefix, tolerating padding, and
    /// returns the code byte after it. The prefix position lands in
    /// `self.start_of_unit`.
    async fn next_start_code(&mut self) -> Result<Option<(u64, u8)>> {
        let mut zeros: u32 = 0;
        let mut skipped: u64 = 0;
        loop {
            let byte = match self.read_byte().await? {
                Some(b) => b,
                None => return Ok(None),
            };
            if byte == 0x00 {
                zeros += 1;
                continue;
            }
            if byte == 0x01 && zeros >= 2 {
                let start = self.posn - 3;
                if skipped > 0 && !self.padding_logged {
                    self.padding_logged = true;
                    log::info!(
                        "{}: {} bytes of inter-pack padding before offset {}",
                        self.path.display(),
                        skipped,
                        start
                    );
                }
                let code = match self.read_byte().await? {
                    Some(b) => b,
                    None => return Ok(None),
                };
                return Ok(Some((start, code)));
            }
            skipped += zeros as u64 + 1;
            zeros = 0;
        }
    }

    /// Skips a pack header, whichever vintage it is.
    async fn skip_pack_header(&mut self) -> Result<()> {
        let mut first = [0u8; 1];
        if !self.read_exact(&mut first).await? {
            self.eof = true;
            return Ok(());
        }
        if first[0] >> 6 == 0b01 {
            // H.222.0: 10 octets total, then 3 reserved bits + stuffing length
            let mut rest = [0u8; 9];
            if !self.read_exact(&mut rest).await? {
                self.eof = true;
                return Ok(());
            }
            let stuffing = (rest[8] & 0x07) as usize;
            if stuffing > 0 {
                let mut pad = [0u8; 7];
                if !self.read_exact(&mut pad[..stuffing]).await? {
                    self.eof = true;
                }
            }
        } else if first[0] >> 4 == 0b0010 {
            // MPEG-1: 8 more octets of SCR and mux rate
            let mut rest = [0u8; 7];
            if !self.read_exact(&mut rest).await? {
                self.eof = true;
            }
        } else {
            return Err(TsKitError::Parser(format!(
                "unrecognised pack header discriminator 0x{:02x} at {}",
                first[0],
                self.posn - 1
            )));
        }
        self.packs_seen += 1;
        Ok(())
    }
}

#[async_trait]
impl PesSource for PsPesSource {
    async fn next_pes(&mut self) -> Result<Option<PesPacket>> {
        loop {
            if self.eof {
                return Ok(None);
            }
            let (start, code) = match self.next_start_code().await? {
                Some(pair) => pair,
                None => {
                    self.eof = true;
                    return Ok(None);
                }
            };
            match code {
                PACK_HEADER => {
                    self.skip_pack_header().await?;
                }
                PROGRAM_END => {
                    self.eof = true;
                    return Ok(None);
                }
                SYSTEM_HEADER | 0xBC..=0xFF => {
                    let mut len_bytes = [0u8; 2];
                    if !self.read_exact(&mut len_bytes).await? {
                        self.eof = true;
                        return Ok(None);
                    }
                    let length = u16::from_be_bytes(len_bytes) as usize;
                    if code == SYSTEM_HEADER {
                        let mut sink = vec![0u8; length];
                        if !self.read_exact(&mut sink).await? {
                            self.eof = true;
                            return Ok(None);
                        }
                        continue;
                    }

                    let mut data = BytesMut::with_capacity(6 + length);
                    data.extend_from_slice(&[0x00, 0x00, 0x01, code]);
                    data.extend_from_slice(&len_bytes);
                    let mut body = vec![0u8; length];
                    if !self.read_exact(&mut body).await? {
                        self.eof = true;
                        return Ok(None);
                    }
                    data.extend_from_slice(&body);
                    let data: Bytes = data.freeze();

                    let kind = PesKind::from_stream_id(code);
                    if kind == PesKind::Other {
                        continue;
                    }
                    if kind == PesKind::Audio && self.noaudio {
                        continue;
                    }
                    let mut es_offset = pes_es_offset(&data)?;
                    // DVD private_stream_1: skip the substream header
                    // (id, frame count, first-access offset) so AC-3
                    // frames pass through clean
                    if code == 0xBD
                        && data.len() >= es_offset + 4
                        && (0x80..=0x87).contains(&data[es_offset])
                    {
                        es_offset += 4;
                    }
                    return Ok(Some(PesPacket {
                        file_offset: start,
                        stream_id: code,
                        kind,
                        data,
                        es_offset,
                        pcr: None,
                        ts_packets: None,
                    }));
                }
                other => {
                    log::debug!(
                        "{}: unexpected start code 0x{:02x} at {}, resynchronising",
                        self.path.display(),
                        other,
                        start
                    );
                }
            }
        }
    }

    async fn seek(&mut self, file_offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(file_offset)).await?;
        self.posn = file_offset;
        self.eof = false;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        self.posn = 0;
        self.packs_seen = 0;
        self.eof = false;
        self.padding_logged = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pack_header_mpeg2() -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, PACK_HEADER];
        v.push(0b0100_0100); // H.222.0 discriminator
        v.extend_from_slice(&[0x00, 0x04, 0x00, 0x04, 0x01]); // SCR
        v.extend_from_slice(&[0x00, 0x00, 0x03]); // mux rate
        v.push(0xF8); // reserved + 0 stuffing bytes
        v
    }

    fn video_pes(es: &[u8]) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xE0];
        let len = es.len() + 3;
        v.extend_from_slice(&(len as u16).to_be_bytes());
        v.extend_from_slice(&[0x80, 0x00, 0x00]);
        v.extend_from_slice(es);
        v
    }

    fn audio_pes(es: &[u8]) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xC0];
        let len = es.len() + 3;
        v.extend_from_slice(&(len as u16).to_be_bytes());
        v.extend_from_slice(&[0x80, 0x00, 0x00]);
        v.extend_from_slice(es);
        v
    }

    async fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tskit-ps-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_pes_inside_packs() {
        let mut file = Vec::new();
        file.extend(pack_header_mpeg2());
        file.extend(video_pes(&[0x00, 0x00, 0x01, 0xB3, 0xAA]));
        file.extend(audio_pes(&[0x11, 0x22]));
        file.extend(pack_header_mpeg2());
        file.extend(video_pes(&[0x00, 0x00, 0x01, 0x00, 0xBB]));
        let path = write_temp("basic", &file).await;

        let mut src = PsPesSource::open(&path, false).await.unwrap();
        let a = src.next_pes().await.unwrap().unwrap();
        assert_eq!(a.kind, PesKind::Video);
        assert_eq!(a.file_offset, pack_header_mpeg2().len() as u64);
        let b = src.next_pes().await.unwrap().unwrap();
        assert_eq!(b.kind, PesKind::Audio);
        let c = src.next_pes().await.unwrap().unwrap();
        assert_eq!(c.kind, PesKind::Video);
        assert!(src.next_pes().await.unwrap().is_none());
        assert_eq!(src.packs_seen(), 2);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn padding_between_packs_is_tolerated() {
        let mut file = Vec::new();
        file.extend(pack_header_mpeg2());
        file.extend(std::iter::repeat(0u8).take(64)); // zero-run padding
        file.extend(video_pes(&[0x00, 0x00, 0x01, 0xB3]));
        let path = write_temp("padding", &file).await;

        let mut src = PsPesSource::open(&path, false).await.unwrap();
        let a = src.next_pes().await.unwrap().unwrap();
        assert_eq!(a.kind, PesKind::Video);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn noaudio_drops_audio_pes() {
        let mut file = Vec::new();
        file.extend(pack_header_mpeg2());
        file.extend(audio_pes(&[0x11]));
        file.extend(video_pes(&[0x00, 0x00, 0x01, 0xB3]));
        let path = write_temp("noaudio", &file).await;

        let mut src = PsPesSource::open(&path, true).await.unwrap();
        let a = src.next_pes().await.unwrap().unwrap();
        assert_eq!(a.kind, PesKind::Video);
        assert!(src.next_pes().await.unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn seek_returns_to_a_packet() {
        let mut file = Vec::new();
        file.extend(pack_header_mpeg2());
        file.extend(video_pes(&[0x00, 0x00, 0x01, 0xB3, 0xAA]));
        file.extend(video_pes(&[0x00, 0x00, 0x01, 0x00, 0xBB]));
        let path = write_temp("seek", &file).await;

        let mut src = PsPesSource::open(&path, false).await.unwrap();
        let first = src.next_pes().await.unwrap().unwrap();
        let second = src.next_pes().await.unwrap().unwrap();

        src.seek(second.file_offset).await.unwrap();
        let again = src.next_pes().await.unwrap().unwrap();
        assert_eq!(again.file_offset, second.file_offset);
        assert_eq!(&again.data[..], &second.data[..]);

        src.rewind().await.unwrap();
        let head = src.next_pes().await.unwrap().unwrap();
        assert_eq!(head.file_offset, first.file_offset);
        std::fs::remove_file(&path).ok();
    }
}
