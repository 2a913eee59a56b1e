//! The trick-play state machine.
//!
//! One worker per client, owning its writer, its per-file readers and
//! one reverse index per reader. The states are NORMAL, PAUSED, FAST,
//! FASTER, REVERSE and FAST_REVERSE; skips and file selection are
//! transitions rather than states. The obligations at each transition
//! are the heart of the design:
//!
//! - leaving NORMAL flushes the consumed prefix of the current PES
//!   packet, up to the item that terminated the last picture;
//! - entering NORMAL re-emits the program tables and the unconsumed
//!   suffix of that packet, suppressing its auto-mirror;
//! - leaving the reverse states resynchronises the forward reader and
//!   (H.262) emits one reference picture as a prediction backstop;
//! - leaving the fast states emits one reference picture likewise;
//! - skips are atomic: the command-changed check is suppressed so an
//!   intervening byte cannot tear the stream;
//! - EOF backs off two pictures, resumes, and rests in PAUSED.
//!
//! The orchestrator never guesses frame types; classification comes
//! from the picture source.

use super::command::*;
use super::writer::TsWriter;
use super::{DolbyMode, ServeConfig};
use crate::codec::{h262, FileSource, Picture, PictureSource, VideoType};
use crate::error::{Result, TsKitError};
use crate::format::pes::{EsPosition, PesKind, PesPacket, PesSource};
use crate::format::ps::PsPesSource;
use crate::format::ts::reader::TsPesSource;
use crate::format::ts::types::{
    STREAM_ID_VIDEO, STREAM_TYPE_AC3_ATSC, STREAM_TYPE_AC3_DVB, STREAM_TYPE_H262,
    STREAM_TYPE_H264,
};
use crate::index::ReverseIndex;
use crate::filter::{FilterDecision, FilterSpec, PictureFilter};
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Assumed frame rate for translating skip seconds into frames.
const FRAMES_PER_SECOND: u64 = 25;
/// Frames skipped by `>` / `<`.
const SKIP_SMALL_FRAMES: u64 = 10 * FRAMES_PER_SECOND;
/// Frames skipped by `]` / `[`.
const SKIP_BIG_FRAMES: u64 = 180 * FRAMES_PER_SECOND;

/// What a state handed back to the dispatch loop.
enum Outcome {
    /// Rest in PAUSED until the client sends something
    Wait,
    /// Run this command next without waiting
    Run(u8),
}

struct OpenFile {
    source: FileSource,
    index: ReverseIndex,
}

/// One client's serving loop.
pub struct Worker {
    config: Arc<ServeConfig>,
    writer: TsWriter,
    cmd: Arc<CommandState>,
    files: Vec<Option<OpenFile>>,
    current: usize,
    /// First normal play of the current file: tables are fresh and
    /// there is no packet suffix to resume
    first_play: bool,
    /// Where entering NORMAL must resume mid-packet emission
    resume_suffix: Option<EsPosition>,
    /// Output packets since the last PAT/PMT emission
    since_tables: u64,
}

impl Worker {
    /// Builds a worker over an accepted client's writer and command
    /// slot.
    pub fn new(config: Arc<ServeConfig>, writer: TsWriter, cmd: Arc<CommandState>) -> Self {
        let slots = config.files.len().max(10);
        Self {
            config,
            writer,
            cmd,
            files: std::iter::repeat_with(|| None).take(slots).collect(),
            current: 0,
            first_play: true,
            resume_suffix: None,
            since_tables: 0,
        }
    }

    /// Runs the worker until quit or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let first = self
            .config
            .first_file()
            .ok_or_else(|| TsKitError::InvalidData("no input files configured".into()))?;
        self.current = first;
        self.open_current().await?;

        self.writer
            .write_null_packets(self.config.pad_packets)
            .await?;
        self.writer.write_program_tables().await?;

        let mut pending: Option<u8> = None;
        loop {
            let command = match pending.take() {
                Some(c) => c,
                None => {
                    self.cmd.wait_changed().await;
                    self.cmd.current()
                }
            };
            self.cmd.clear_changed();

            let outcome = match command {
                CMD_QUIT => {
                    log::info!("client quit");
                    return Ok(());
                }
                CMD_NORMAL => self.play_normal().await?,
                CMD_PAUSE => Outcome::Wait,
                CMD_FAST => self.play_fast(false).await?,
                CMD_FASTER => self.play_fast(true).await?,
                CMD_REVERSE => self.play_reverse(self.config.rfreq).await?,
                CMD_FAST_REVERSE => self.play_reverse(self.config.rfreq.saturating_mul(2)).await?,
                CMD_SKIP_FORWARD => self.skip_forward(SKIP_SMALL_FRAMES).await?,
                CMD_SKIP_FORWARD_BIG => self.skip_forward(SKIP_BIG_FRAMES).await?,
                CMD_SKIP_BACKWARD => self.skip_backward(SKIP_SMALL_FRAMES).await?,
                CMD_SKIP_BACKWARD_BIG => self.skip_backward(SKIP_BIG_FRAMES).await?,
                digit @ b'0'..=b'9' => self.select_file((digit - b'0') as usize).await?,
                other => {
                    log::warn!("unhandled command byte 0x{:02x}", other);
                    Outcome::Wait
                }
            };

            if let Outcome::Run(next) = outcome {
                pending = Some(next);
            }
        }
    }

    // ---- file management -------------------------------------------------

    async fn open_current(&mut self) -> Result<()> {
        if self.files[self.current].is_some() {
            return Ok(());
        }
        let path = self.config.files[self.current]
            .clone()
            .ok_or_else(|| TsKitError::InvalidData(format!("file slot {} empty", self.current)))?;

        let is_ts = sniff_container(&path).await?;
        let source: Box<dyn PesSource> = if is_ts {
            Box::new(TsPesSource::open(&path, self.config.noaudio, self.config.tsdirect).await?)
        } else {
            Box::new(PsPesSource::open(&path, self.config.noaudio).await?)
        };
        let source = FileSource::open(source, self.config.forced_video_type).await?;
        let video_type = source.video_type();
        let index = ReverseIndex::new(video_type == VideoType::H264);
        log::info!(
            "opened {} as {} / {:?}",
            path.display(),
            if is_ts { "TS" } else { "PS" },
            video_type
        );

        // Advertise what the file actually carries
        self.writer.config_mut().video_stream_type = match video_type {
            VideoType::H262 => STREAM_TYPE_H262,
            VideoType::H264 => STREAM_TYPE_H264,
        };
        if let Some(dolby) = self.config.dolby {
            let (stream_type, descriptor) = match dolby {
                DolbyMode::Dvb => (STREAM_TYPE_AC3_DVB, 0x6A),
                DolbyMode::Atsc => (STREAM_TYPE_AC3_ATSC, 0x81),
            };
            self.writer.config_mut().audio_stream_type = stream_type;
            self.writer.config_mut().ac3_descriptor = Some(descriptor);
        }

        self.files[self.current] = Some(OpenFile { source, index });
        Ok(())
    }

    fn file_mut(&mut self) -> &mut OpenFile {
        self.files[self.current]
            .as_mut()
            .expect("current file is open")
    }

    fn is_h262(&mut self) -> bool {
        self.file_mut().source.video_type() == VideoType::H262
    }

    fn with_seq_headers(&mut self) -> bool {
        self.config.with_seq_headers && self.is_h262()
    }

    async fn select_file(&mut self, n: usize) -> Result<Outcome> {
        if self.config.files.get(n).map_or(true, |f| f.is_none()) {
            log::warn!("file slot {} is empty, staying on {}", n, self.current);
            return Ok(Outcome::Wait);
        }
        self.current = n;
        if self.files[n].is_some() {
            // Not merely seek-to-0: the framer's lookahead is re-primed
            // and the index replays in confirm mode
            let file = self.file_mut();
            file.source.rewind().await?;
            file.index.rewind();
        } else {
            self.open_current().await?;
        }
        self.writer.write_program_tables().await?;
        self.since_tables = 0;
        self.first_play = true;
        self.resume_suffix = None;
        log::info!("selected file {}", n);
        Ok(Outcome::Wait)
    }

    // ---- emission helpers ------------------------------------------------

    async fn emit_outgoing(&mut self, discard: bool) -> Result<()> {
        let outgoing: VecDeque<PesPacket> = self.file_mut().source.take_outgoing();
        if discard {
            return Ok(());
        }
        for packet in outgoing {
            if self.config.tsdirect {
                // Audio PES carry no raw chunk of their own; their TS
                // packets ride inside the video packets' mirrors
                if let Some(raw) = &packet.ts_packets {
                    let raw = raw.clone();
                    self.writer.write_raw_ts(&raw).await?;
                    self.since_tables += (raw.len() / 188) as u64;
                }
                continue;
            }
            let pid = match packet.kind {
                PesKind::Audio => self.writer.config().audio_pid,
                _ => self.writer.config().video_pid,
            };
            if packet.kind == PesKind::Audio && packet.stream_id == 0xBD {
                // private_stream_1: the ES offset already skips the DVD
                // substream header, so rebuild the PES around clean
                // frames
                self.writer
                    .write_es_as_pes(&[packet.es()], packet.stream_id, pid)
                    .await?;
            } else {
                self.writer.write_pes_as_ts(&packet.data, pid).await?;
            }
            self.since_tables += 1;
        }
        if self.since_tables >= self.config.program_repeat as u64 {
            self.writer.write_program_tables().await?;
            self.since_tables = 0;
        }
        Ok(())
    }

    async fn emit_picture_parts(&mut self, parts: &[&[u8]], repeats: u32) -> Result<()> {
        let pid = self.writer.config().video_pid;
        for _ in 0..=repeats {
            self.writer
                .write_es_as_pes(parts, STREAM_ID_VIDEO, pid)
                .await?;
        }
        Ok(())
    }

    /// Re-reads and emits one recorded entry, with AFD synthesis and an
    /// optional sequence header in front.
    async fn emit_entry(
        &mut self,
        entry_idx: usize,
        seq_header_idx: Option<usize>,
        repeats: u32,
    ) -> Result<()> {
        let h262 = self.is_h262();
        let file = self.file_mut();
        let entry = file
            .index
            .entry(entry_idx)
            .ok_or_else(|| TsKitError::PictureRead(format!("no index entry {}", entry_idx)))?
            .clone();
        let raw = file.source.es().read_at(entry.start, entry.byte_len).await?;
        let data: Bytes = match entry.afd {
            Some(afd) if h262 => h262::patch_afd(&raw, afd),
            _ => raw,
        };
        let header_bytes = match seq_header_idx {
            Some(idx) => {
                let header = file
                    .index
                    .entry(idx)
                    .ok_or_else(|| {
                        TsKitError::PictureRead(format!("no sequence header entry {}", idx))
                    })?
                    .clone();
                Some(file.source.es().read_at(header.start, header.byte_len).await?)
            }
            None => None,
        };
        match &header_bytes {
            Some(header) => self.emit_picture_parts(&[header, &data], repeats).await,
            None => self.emit_picture_parts(&[&data], repeats).await,
        }
    }

    // ---- NORMAL ----------------------------------------------------------

    async fn enter_normal(&mut self) -> Result<()> {
        if self.first_play {
            self.first_play = false;
            self.resume_suffix = None;
            return Ok(());
        }
        self.writer.write_program_tables().await?;
        self.since_tables = 0;

        if let Some(pos) = self.resume_suffix.take() {
            let suffix: Option<Bytes> = {
                let file = self.file_mut();
                match file.source.es().current_packet() {
                    Some(packet)
                        if packet.file_offset == pos.infile
                            && (pos.inpacket as usize) < packet.data.len() =>
                    {
                        Some(packet.data.slice(pos.inpacket as usize..))
                    }
                    _ => None,
                }
            };
            if let Some(suffix) = suffix {
                self.emit_picture_parts(&[&suffix], 0).await?;
                // the mirror would emit this packet a second time
                self.file_mut().source.es().suppress_current_packet_write();
            }
        }
        Ok(())
    }

    async fn play_normal(&mut self) -> Result<Outcome> {
        self.enter_normal().await?;
        loop {
            if self.cmd.check_interrupt().is_err() {
                self.leave_normal().await?;
                return Ok(Outcome::Run(self.cmd.current()));
            }
            let picture = self.file_mut().source.next_picture().await?;
            match picture {
                None => {
                    self.emit_outgoing(false).await?;
                    return self.eof_rest().await;
                }
                Some(picture) => {
                    self.file_mut().index.record(&picture)?;
                    self.emit_outgoing(false).await?;
                }
            }
        }
    }

    /// Leave-NORMAL obligation: flush the consumed prefix of the
    /// current packet up to the item that terminated the last picture.
    async fn leave_normal(&mut self) -> Result<()> {
        if self.cmd.current() == CMD_QUIT {
            return Ok(());
        }

        // If the terminating item began in a prior PES packet, read one
        // more picture so the split point lies in the current packet
        let needs_advance = {
            let file = self.file_mut();
            match (
                file.source.split_point(),
                file.source.es().current_packet_offset(),
            ) {
                (Some(split), Some(current)) => split.infile != current,
                _ => false,
            }
        };
        if needs_advance {
            let picture = self.file_mut().source.next_picture().await?;
            if let Some(picture) = picture {
                self.file_mut().index.record(&picture)?;
            }
        }

        // Mirror everything the reader has fully consumed
        self.emit_outgoing(false).await?;

        let prefix: Option<(EsPosition, Bytes)> = {
            let file = self.file_mut();
            match (file.source.split_point(), file.source.es().current_packet()) {
                (Some(split), Some(packet)) if split.infile == packet.file_offset => {
                    let from = packet.es_offset;
                    let to = split.inpacket as usize;
                    if to > from {
                        Some((split, packet.data.slice(from..to)))
                    } else {
                        Some((split, Bytes::new()))
                    }
                }
                _ => None,
            }
        };

        if let Some((split, prefix)) = prefix {
            if !prefix.is_empty() {
                self.emit_picture_parts(&[&prefix], 0).await?;
            }
            self.resume_suffix = Some(split);
        } else {
            self.resume_suffix = None;
        }
        Ok(())
    }

    // ---- FAST / FASTER ---------------------------------------------------

    async fn play_fast(&mut self, intra_only: bool) -> Result<Outcome> {
        let with_seq = self.with_seq_headers();
        let mut filter = PictureFilter::new(FilterSpec {
            intra_only,
            freq: self.config.ffreq,
            with_seq_headers: with_seq,
        });

        loop {
            if self.cmd.check_interrupt().is_err() {
                self.emit_forward_backstop().await?;
                return Ok(Outcome::Run(self.cmd.current()));
            }
            let picture = self.file_mut().source.next_picture().await?;
            let picture = match picture {
                None => return self.eof_rest().await,
                Some(p) => p,
            };
            self.file_mut().index.record(&picture)?;
            // trick modes drop the mirror queue: no audio, no PES copy
            self.emit_outgoing(true).await?;

            if let FilterDecision::Keep {
                seq_header,
                repeats,
            } = filter.offer(&picture)
            {
                match &seq_header {
                    Some(header) => {
                        self.emit_picture_parts(&[&header.data, &picture.data], repeats)
                            .await?
                    }
                    None => self.emit_picture_parts(&[&picture.data], repeats).await?,
                }
            }
        }
    }

    /// After-FAST obligation: one reference picture so downstream
    /// decoders have a valid prediction base.
    async fn emit_forward_backstop(&mut self) -> Result<()> {
        if self.cmd.current() == CMD_QUIT {
            return Ok(());
        }
        loop {
            let picture = self.file_mut().source.next_picture().await?;
            let picture = match picture {
                None => break,
                Some(p) => p,
            };
            self.file_mut().index.record(&picture)?;
            self.emit_outgoing(true).await?;
            if picture.kind.is_reference() {
                self.emit_picture_parts(&[&picture.data], 0).await?;
                break;
            }
        }
        self.resume_suffix = self.file_mut().source.split_point();
        Ok(())
    }

    // ---- REVERSE / FAST_REVERSE ------------------------------------------

    async fn play_reverse(&mut self, freq: u32) -> Result<Outcome> {
        let with_seq = self.with_seq_headers();
        let mut walk = self.file_mut().index.reverse_walk(None, freq);

        let outcome = loop {
            if self.cmd.check_interrupt().is_err() {
                break Outcome::Run(self.cmd.current());
            }
            let step = {
                let file = self.file_mut();
                walk.next_step(&file.index, with_seq)
            };
            match step {
                None => break Outcome::Wait, // ran out of recorded pictures
                Some(step) => {
                    self.emit_entry(step.entry, step.seq_header, step.repeats)
                        .await?;
                    self.file_mut().index.set_cursor(step.entry);
                }
            }
        };

        self.after_reverse().await?;
        Ok(outcome)
    }

    /// After-REVERSE obligation: reset the forward framer at the last
    /// reversed picture and, for H.262, emit the next reference picture
    /// as a backstop (an IDR is its own backstop).
    async fn after_reverse(&mut self) -> Result<()> {
        if self.cmd.current() == CMD_QUIT {
            return Ok(());
        }
        let h262 = self.is_h262();
        let seek_to = {
            let file = self.file_mut();
            let cursor = file.index.cursor();
            match file.index.entry(cursor) {
                Some(entry) if cursor < file.index.len() => Some(entry.start),
                _ => None,
            }
        };
        let seek_to = match seek_to {
            Some(pos) => pos,
            None => return Ok(()), // nothing was reversed
        };

        self.file_mut().source.seek(seek_to).await?;

        // The first picture framed is the one just shown; read past it
        // without emitting (the index confirms it in place)
        let picture = self.file_mut().source.next_picture().await?;
        if let Some(picture) = picture {
            self.file_mut().index.record(&picture)?;
        }
        self.emit_outgoing(true).await?;

        if h262 {
            loop {
                let picture = self.file_mut().source.next_picture().await?;
                let picture = match picture {
                    None => break,
                    Some(p) => p,
                };
                self.file_mut().index.record(&picture)?;
                self.emit_outgoing(true).await?;
                if picture.kind.is_reference() {
                    self.emit_picture_parts(&[&picture.data], 0).await?;
                    break;
                }
            }
        }

        self.resume_suffix = self.file_mut().source.split_point();
        Ok(())
    }

    // ---- skips -----------------------------------------------------------

    async fn skip_forward(&mut self, frames: u64) -> Result<Outcome> {
        self.cmd.set_atomic(true);
        let result = self.skip_forward_inner(frames).await;
        self.cmd.set_atomic(false);
        result
    }

    async fn skip_forward_inner(&mut self, frames: u64) -> Result<Outcome> {
        let with_seq = self.with_seq_headers();
        let mut seen = 0u64;
        let mut keeper: Option<Picture> = None;
        let mut keeper_header: Option<Picture> = None;
        let mut last_header: Option<Picture> = None;

        while seen < frames {
            let picture = self.file_mut().source.next_picture().await?;
            let picture = match picture {
                None => break,
                Some(p) => p,
            };
            self.file_mut().index.record(&picture)?;
            self.emit_outgoing(true).await?;
            if picture.kind.is_sequence_header() {
                last_header = Some(picture);
                continue;
            }
            seen += 1;
            if picture.kind.is_reference() {
                keeper_header = last_header.clone();
                keeper = Some(picture);
            }
        }

        match keeper {
            Some(picture) => {
                match (&keeper_header, with_seq) {
                    (Some(header), true) => {
                        self.emit_picture_parts(&[&header.data, &picture.data], 0)
                            .await?
                    }
                    _ => self.emit_picture_parts(&[&picture.data], 0).await?,
                }
                self.resume_suffix = self.file_mut().source.split_point();
                Ok(Outcome::Run(CMD_NORMAL))
            }
            None => self.eof_rest().await,
        }
    }

    async fn skip_backward(&mut self, frames: u64) -> Result<Outcome> {
        self.cmd.set_atomic(true);
        let result = self.skip_backward_inner(frames).await;
        self.cmd.set_atomic(false);
        result
    }

    async fn skip_backward_inner(&mut self, frames: u64) -> Result<Outcome> {
        let with_seq = self.with_seq_headers();
        let target = {
            let file = self.file_mut();
            let cursor = file.index.cursor();
            file.index.picture_back_clamped(cursor, frames as usize)
        };
        let target = match target {
            Some(t) => t,
            None => return Ok(Outcome::Run(CMD_NORMAL)), // nothing recorded yet
        };
        let seq_header = if with_seq {
            self.file_mut().index.seq_header_for(target)
        } else {
            None
        };
        self.emit_entry(target, seq_header, 0).await?;
        self.file_mut().index.set_cursor(target);
        self.after_reverse().await?;
        Ok(Outcome::Run(CMD_NORMAL))
    }

    // ---- EOF -------------------------------------------------------------

    /// EOF while playing forwards (any speed): back off two pictures,
    /// emit the keeper, reset the framer there, and rest in PAUSED.
    ///
    /// The replay cursor is left on the emitted entry, so a reverse
    /// issued from this rest state starts one further back; the client
    /// sees the picture before the one on screen, not a repeat.
    async fn eof_rest(&mut self) -> Result<Outcome> {
        let with_seq = self.with_seq_headers();
        let entry_idx = {
            let file = self.file_mut();
            let len = file.index.len();
            file.index.nth_picture_back(len, 2)
        };
        if let Some(entry_idx) = entry_idx {
            let seq_header = if with_seq {
                self.file_mut().index.seq_header_for(entry_idx)
            } else {
                None
            };
            self.emit_entry(entry_idx, seq_header, 0).await?;
            let seek_to = {
                let file = self.file_mut();
                file.index.set_cursor(entry_idx);
                file.index.entry(entry_idx).map(|e| e.start)
            };
            if let Some(pos) = seek_to {
                self.file_mut().source.seek(pos).await?;
                self.resume_suffix = Some(pos);
            }
        }
        log::info!("end of file {}, pausing", self.current);
        Ok(Outcome::Wait)
    }
}

/// Classifies a served file as TS or PS from its first byte.
async fn sniff_container(path: &Path) -> Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = [0u8; 1];
    match file.read_exact(&mut head).await {
        Ok(_) => Ok(head[0] == 0x47),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
