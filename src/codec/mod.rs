//! # Picture classification
//!
//! The serving core never inspects video bitstreams itself; it consumes
//! a [`PictureSource`] that yields framed pictures with a
//! [`PictureKind`] classification and the byte range needed to find the
//! picture again. Two lightweight start-code framers implement the
//! seam: H.262 (picture / GOP / sequence-header units, AFD user data)
//! and H.264 (NAL units classified by type and nal_ref_idc).
//!
//! Stream-type detection for PS input is two-phase: the first ES item
//! is framed and classified, then pushed back so normal framing
//! re-consumes it; the file position is never rewound.

pub mod h262;
pub mod h264;

use crate::error::Result;
use crate::format::pes::{EsPosition, EsReader, PesPacket, PesSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;

/// The two video encodings the server plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoType {
    /// MPEG-2 video (ISO/IEC 13818-2)
    H262,
    /// H.264/AVC
    H264,
}

/// Classification of a framed video unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureKind {
    /// H.262 sequence header (plus trailing extensions/user data)
    SequenceHeader,
    /// H.262 intra picture
    I,
    /// H.262 forward-predicted picture
    P,
    /// H.262 bidirectionally-predicted picture
    B,
    /// H.264 IDR picture
    Idr,
    /// H.264 reference picture that is not an IDR
    NonIdrRef,
    /// H.264 non-reference picture
    NonRef,
}

impl PictureKind {
    /// Reference pictures are what reverse play is built from: I and P
    /// for H.262, IDR and non-IDR reference pictures for H.264.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            PictureKind::I | PictureKind::P | PictureKind::Idr | PictureKind::NonIdrRef
        )
    }

    /// Intra-coded pictures, decodable with no prediction base.
    pub fn is_intra(self) -> bool {
        matches!(self, PictureKind::I | PictureKind::Idr)
    }

    /// True for the H.262 sequence-header pseudo-picture.
    pub fn is_sequence_header(self) -> bool {
        matches!(self, PictureKind::SequenceHeader)
    }
}

/// One framed picture (or H.262 sequence header) with the byte range
/// needed to re-read it from the input.
#[derive(Debug, Clone)]
pub struct Picture {
    /// Classification of this unit
    pub kind: PictureKind,
    /// Position of the unit's first byte in the elementary stream
    pub start: EsPosition,
    /// Length of the unit in ES bytes
    pub byte_len: u32,
    /// AFD byte from user data, H.262 only
    pub afd: Option<u8>,
    /// The unit's assembled ES bytes
    pub data: Bytes,
    /// Index of this picture since open/rewind (sequence headers do not
    /// advance it)
    pub index: u64,
}

/// The picture seam the trick-play core consumes.
#[async_trait]
pub trait PictureSource: Send {
    /// Frames and classifies the next picture, or `None` at EOF.
    async fn next_picture(&mut self) -> Result<Option<Picture>>;

    /// The video encoding being framed.
    fn video_type(&self) -> VideoType;

    /// Split point for partial-packet flushes: the position of the item
    /// that terminated the previous picture, when one is pending.
    fn split_point(&self) -> Option<EsPosition>;
}

/// Picture source over an [`EsReader`]: the sniffing front-end plus the
/// per-encoding framers.
pub struct FileSource {
    es: EsReader,
    video_type: VideoType,
    picture_index: u64,
}

impl FileSource {
    /// Builds a source over a PES source, classifying the encoding from
    /// the first ES item unless `forced` pins it.
    ///
    /// Sniffing is bounded and buffered: the framed item is pushed back
    /// into the reader rather than rewinding the file.
    pub async fn open(
        source: Box<dyn PesSource>,
        forced: Option<VideoType>,
    ) -> Result<Self> {
        let mut es = EsReader::new(source);
        let video_type = match forced {
            Some(t) => t,
            None => sniff(&mut es).await?,
        };
        log::debug!("video stream classified as {:?}", video_type);
        Ok(Self {
            es,
            video_type,
            picture_index: 0,
        })
    }

    /// The underlying ES reader (transition logic needs its packet and
    /// mirror-queue state).
    pub fn es(&mut self) -> &mut EsReader {
        &mut self.es
    }

    /// Pictures framed since open or rewind.
    pub fn picture_index(&self) -> u64 {
        self.picture_index
    }

    /// Drains the mirror queue (audio, completed video packets).
    pub fn take_outgoing(&mut self) -> VecDeque<PesPacket> {
        self.es.take_outgoing()
    }

    /// Seeks to a recorded unit boundary and resumes framing there.
    /// The framer's remembered state is reset; the picture counter is
    /// not meaningful again until the caller resynchronises it.
    pub async fn seek(&mut self, pos: EsPosition) -> Result<()> {
        self.es.seek(pos).await
    }

    /// Rewinds to the start of the file, re-priming the reader and the
    /// picture counter.
    pub async fn rewind(&mut self) -> Result<()> {
        self.es.rewind().await?;
        self.picture_index = 0;
        Ok(())
    }

    /// True once framing has consumed the whole input.
    pub fn at_eof(&self) -> bool {
        self.es.at_eof()
    }
}

#[async_trait]
impl PictureSource for FileSource {
    async fn next_picture(&mut self) -> Result<Option<Picture>> {
        let picture = match self.video_type {
            VideoType::H262 => h262::next_picture(&mut self.es, self.picture_index).await?,
            VideoType::H264 => h264::next_picture(&mut self.es, self.picture_index).await?,
        };
        if let Some(p) = &picture {
            if !p.kind.is_sequence_header() {
                self.picture_index += 1;
            }
        }
        Ok(picture)
    }

    fn video_type(&self) -> VideoType {
        self.video_type
    }

    fn split_point(&self) -> Option<EsPosition> {
        self.es.pending_item_start()
    }
}

/// Classifies the stream from its first ES item and re-injects it.
async fn sniff(es: &mut EsReader) -> Result<VideoType> {
    let item = match es.next_item().await? {
        Some(item) => item,
        None => return Ok(VideoType::H262), // empty stream; arbitrary
    };
    // H.262 opens with a sequence header, GOP or picture start code;
    // H.264 opens with an AUD, SPS or SEI NAL
    let video_type = match item.start_code {
        0x00 | 0xB3 | 0xB8 => VideoType::H262,
        _ => VideoType::H264,
    };
    es.push_back_item(item);
    Ok(video_type)
}


#[cfg(test)]
mod tests {
    use super::test_support::MemoryPesSource;
    use super::*;

    #[tokio::test]
    async fn sniffs_h262_from_sequence_header() {
        let source = MemoryPesSource::from_es_chunks(&[vec![
            0x00, 0x00, 0x01, 0xB3, 0x12, 0x00, 0xF0,
        ]]);
        let src = FileSource::open(Box::new(source), None).await.unwrap();
        assert_eq!(src.video_type(), VideoType::H262);
    }

    #[tokio::test]
    async fn sniffs_h264_from_sps() {
        let source = MemoryPesSource::from_es_chunks(&[vec![
            0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1F,
        ]]);
        let src = FileSource::open(Box::new(source), None).await.unwrap();
        assert_eq!(src.video_type(), VideoType::H264);
    }

    #[tokio::test]
    async fn forced_type_skips_sniffing() {
        let source = MemoryPesSource::from_es_chunks(&[vec![
            0x00, 0x00, 0x01, 0x67, 0x64,
        ]]);
        let src = FileSource::open(Box::new(source), Some(VideoType::H262))
            .await
            .unwrap();
        assert_eq!(src.video_type(), VideoType::H262);
    }
}
