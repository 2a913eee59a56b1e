//! # Reverse-index engine
//!
//! As pictures stream forwards, the positions and classifications of
//! reference pictures (and, for H.262, sequence headers) are recorded
//! as a side effect. The record is append-only and holds offsets and
//! lengths only, never payload bytes, so reverse play is O(1) per
//! picture: walk the index backwards and re-read each picture from the
//! file.
//!
//! Recording is self-checking: when forward play re-traverses a region
//! it has already recorded (after a reverse or a backward skip), each
//! arriving picture is confirmed equal against the existing entry. A
//! mismatch means the file changed under us or framing diverged, and is
//! fatal to the worker after a diagnostic dump.

use crate::codec::{Picture, PictureKind};
use crate::error::{Result, TsKitError};
use crate::format::pes::EsPosition;

/// One recorded picture (or H.262 sequence header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Classification recorded at forward-play time
    pub kind: PictureKind,
    /// Position of the unit's first byte
    pub start: EsPosition,
    /// Unit length in ES bytes
    pub byte_len: u32,
    /// AFD byte to re-synthesise on reverse emission (H.262)
    pub afd: Option<u8>,
    /// Distance backwards to the governing sequence header entry;
    /// zero when this entry is itself a sequence header (H.262), and
    /// always zero for H.264 indexes
    pub seq_header_backref: u32,
}

/// Append-only record of reference-picture positions.
pub struct ReverseIndex {
    entries: Vec<IndexEntry>,
    /// Count of non-sequence-header entries
    num_pictures: usize,
    /// Recording/confirmation position: the index the next recorded
    /// picture must land on. Doubles as the replay cursor: reverse
    /// emission moves it back so forward play resumes confirming from
    /// the right spot.
    cursor: usize,
    last_seq_header: Option<usize>,
    is_h264: bool,
}

impl ReverseIndex {
    /// Creates an empty index. H.264 indexes have no sequence-header
    /// entries.
    pub fn new(is_h264: bool) -> Self {
        Self {
            entries: Vec::new(),
            num_pictures: 0,
            cursor: 0,
            last_seq_header: None,
            is_h264,
        }
    }

    /// Whether this index was built for H.264.
    pub fn is_h264(&self) -> bool {
        self.is_h264
    }

    /// Number of recorded entries, sequence headers included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count of recorded pictures (sequence headers excluded).
    pub fn num_pictures(&self) -> usize {
        self.num_pictures
    }

    /// The recording/replay cursor.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the replay cursor (reverse emission and skips do this).
    pub fn set_cursor(&mut self, cursor: usize) {
        debug_assert!(cursor <= self.entries.len());
        self.cursor = cursor.min(self.entries.len());
    }

    /// A recorded entry.
    pub fn entry(&self, index: usize) -> Option<&IndexEntry> {
        self.entries.get(index)
    }

    /// All recorded entries in append order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Rewinds for a file re-selection: recorded entries are kept and
    /// will be confirmed equal as the file replays.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.last_seq_header = None;
    }

    /// Records a picture arriving from forward play. Pictures that are
    /// neither reference pictures nor sequence headers are ignored.
    ///
    /// Appends when the cursor is at the end of the record; confirms
    /// equality when re-traversing. A confirmation failure dumps the
    /// neighbourhood and returns `ReverseIndexMismatch`.
    pub fn record(&mut self, picture: &Picture) -> Result<()> {
        if !(picture.kind.is_reference() || picture.kind.is_sequence_header()) {
            return Ok(());
        }
        if self.is_h264 && picture.kind.is_sequence_header() {
            return Ok(());
        }

        if self.cursor < self.entries.len() {
            // Re-traversal: the arriving picture must match what was
            // recorded. The backref is taken from the record (replays
            // may start mid-sequence, after the governing header).
            let existing = &self.entries[self.cursor];
            let matches = existing.kind == picture.kind
                && existing.start == picture.start
                && existing.byte_len == picture.byte_len
                && existing.afd == picture.afd;
            if !matches {
                let arrived = IndexEntry {
                    kind: picture.kind,
                    start: picture.start,
                    byte_len: picture.byte_len,
                    afd: picture.afd,
                    seq_header_backref: existing.seq_header_backref,
                };
                self.dump_mismatch(&arrived);
                return Err(TsKitError::ReverseIndexMismatch(self.cursor));
            }
        } else {
            let backref = if picture.kind.is_sequence_header() || self.is_h264 {
                0
            } else {
                match self.last_seq_header {
                    // entries before any sequence header have nothing
                    // to point back to
                    None => 0,
                    Some(seq) => (self.cursor - seq) as u32,
                }
            };
            let entry = IndexEntry {
                kind: picture.kind,
                start: picture.start,
                byte_len: picture.byte_len,
                afd: picture.afd,
                seq_header_backref: backref,
            };
            if let Some(last) = self.entries.last() {
                debug_assert!(
                    entry.start >= last.start,
                    "reverse index must be recorded in stream order"
                );
            }
            self.entries.push(entry);
            if !picture.kind.is_sequence_header() {
                self.num_pictures += 1;
            }
        }

        if picture.kind.is_sequence_header() {
            self.last_seq_header = Some(self.cursor);
        }
        self.cursor += 1;
        Ok(())
    }

    fn dump_mismatch(&self, arrived: &IndexEntry) {
        log::error!(
            "reverse index mismatch at entry {} of {}",
            self.cursor,
            self.entries.len()
        );
        log::error!("  recorded: {:?}", self.entries[self.cursor]);
        log::error!("  arrived:  {:?}", arrived);
        let lo = self.cursor.saturating_sub(2);
        let hi = (self.cursor + 3).min(self.entries.len());
        for i in lo..hi {
            log::error!("  [{}] {:?}", i, self.entries[i]);
        }
    }

    /// Index of the `n`th picture (1-based, sequence headers skipped)
    /// strictly before `from`. `None` when the record is too short.
    pub fn nth_picture_back(&self, from: usize, n: usize) -> Option<usize> {
        let mut remaining = n;
        let mut i = from.min(self.entries.len());
        while i > 0 {
            i -= 1;
            if !self.entries[i].kind.is_sequence_header() {
                remaining -= 1;
                if remaining == 0 {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Like [`nth_picture_back`](Self::nth_picture_back), but clamps to
    /// the earliest recorded picture when fewer than `n` exist (backward
    /// skips near the start of the file land on the first picture).
    pub fn picture_back_clamped(&self, from: usize, n: usize) -> Option<usize> {
        let mut remaining = n;
        let mut found = None;
        let mut i = from.min(self.entries.len());
        while i > 0 && remaining > 0 {
            i -= 1;
            if !self.entries[i].kind.is_sequence_header() {
                found = Some(i);
                remaining -= 1;
            }
        }
        found
    }

    /// The sequence-header entry governing a picture entry, when the
    /// index carries them.
    pub fn seq_header_for(&self, index: usize) -> Option<usize> {
        let entry = self.entries.get(index)?;
        if entry.kind.is_sequence_header() || entry.seq_header_backref == 0 {
            return None;
        }
        Some(index - entry.seq_header_backref as usize)
    }

    /// Begins a backwards walk at frequency `freq`, starting from
    /// `from` (defaults to the replay cursor). Any terminal
    /// sequence-header entries are backed over first.
    pub fn reverse_walk(&self, from: Option<usize>, freq: u32) -> ReverseWalk {
        let mut pos = from.unwrap_or(self.cursor).min(self.entries.len());
        while pos > 0 && self.entries[pos - 1].kind.is_sequence_header() {
            pos -= 1;
        }
        ReverseWalk {
            pos,
            freq: freq.max(1),
            gap: 0,
            last_seq_emitted: None,
        }
    }
}

/// One step of a reverse walk: emit this entry, `1 + repeats` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseStep {
    /// Entry to emit
    pub entry: usize,
    /// Extra emissions to hold the perceived rate when the gap between
    /// kept pictures exceeded one frequency step
    pub repeats: u32,
    /// Sequence-header entry to emit first, unless it was the last one
    /// emitted already
    pub seq_header: Option<usize>,
}

/// Lazy backwards iteration over a [`ReverseIndex`].
///
/// The walk borrows nothing, so the caller can read pictures and write
/// TS between steps; pass the same index to every call.
#[derive(Debug)]
pub struct ReverseWalk {
    /// Entries strictly below this position remain to be examined
    pos: usize,
    freq: u32,
    gap: u32,
    last_seq_emitted: Option<usize>,
}

impl ReverseWalk {
    /// Position of the walk: the next step examines entries below this.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Computes the next picture to emit, skipping sequence-header
    /// entries and applying the keep-frequency. `with_seq_headers`
    /// attaches the governing sequence header to each kept picture
    /// (H.262 reverse play).
    pub fn next_step(
        &mut self,
        index: &ReverseIndex,
        with_seq_headers: bool,
    ) -> Option<ReverseStep> {
        while self.pos > 0 {
            self.pos -= 1;
            let entry = index.entry(self.pos)?;
            if entry.kind.is_sequence_header() {
                continue;
            }
            self.gap += 1;
            if self.gap < self.freq {
                continue;
            }
            let repeats = (self.gap / self.freq).saturating_sub(1);
            self.gap = 0;

            let seq_header = if with_seq_headers {
                match index.seq_header_for(self.pos) {
                    Some(seq) if self.last_seq_emitted != Some(seq) => {
                        self.last_seq_emitted = Some(seq);
                        Some(seq)
                    }
                    _ => None,
                }
            } else {
                None
            };

            return Some(ReverseStep {
                entry: self.pos,
                repeats,
                seq_header,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn picture(kind: PictureKind, infile: u64, len: u32) -> Picture {
        Picture {
            kind,
            start: EsPosition {
                infile,
                inpacket: 9,
            },
            byte_len: len,
            afd: None,
            data: Bytes::new(),
            index: 0,
        }
    }

    fn build_h262_index(kinds: &[PictureKind]) -> ReverseIndex {
        let mut index = ReverseIndex::new(false);
        for (i, &kind) in kinds.iter().enumerate() {
            index
                .record(&picture(kind, (i as u64 + 1) * 100, 50))
                .unwrap();
        }
        index
    }

    #[test]
    fn non_reference_pictures_are_not_recorded() {
        let mut index = ReverseIndex::new(false);
        index.record(&picture(PictureKind::B, 100, 10)).unwrap();
        index.record(&picture(PictureKind::I, 200, 10)).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.num_pictures(), 1);
    }

    #[test]
    fn byte_ranges_are_monotonic() {
        let index = build_h262_index(&[
            PictureKind::SequenceHeader,
            PictureKind::I,
            PictureKind::P,
            PictureKind::P,
        ]);
        for pair in index.entries().windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
    }

    #[test]
    fn backrefs_point_at_sequence_headers() {
        let index = build_h262_index(&[
            PictureKind::SequenceHeader,
            PictureKind::I,
            PictureKind::P,
            PictureKind::SequenceHeader,
            PictureKind::I,
        ]);
        for (k, entry) in index.entries().iter().enumerate() {
            if entry.kind.is_sequence_header() {
                assert_eq!(entry.seq_header_backref, 0);
            } else {
                assert!(entry.seq_header_backref >= 1);
                let referent = k - entry.seq_header_backref as usize;
                assert!(index.entries()[referent].kind.is_sequence_header());
            }
        }
    }

    #[test]
    fn h264_indexes_have_no_sequence_headers() {
        let mut index = ReverseIndex::new(true);
        index.record(&picture(PictureKind::Idr, 100, 10)).unwrap();
        index
            .record(&picture(PictureKind::NonIdrRef, 200, 10))
            .unwrap();
        assert!(index
            .entries()
            .iter()
            .all(|e| !e.kind.is_sequence_header() && e.seq_header_backref == 0));
    }

    #[test]
    fn confirm_equal_accepts_replay() {
        let mut index = ReverseIndex::new(false);
        let pics = [
            picture(PictureKind::SequenceHeader, 100, 10),
            picture(PictureKind::I, 200, 10),
            picture(PictureKind::P, 300, 10),
        ];
        for p in &pics {
            index.record(p).unwrap();
        }
        index.rewind();
        for p in &pics {
            index.record(p).unwrap();
        }
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn confirm_mismatch_is_fatal() {
        let mut index = ReverseIndex::new(false);
        index.record(&picture(PictureKind::I, 100, 10)).unwrap();
        index.rewind();
        let wrong = picture(PictureKind::I, 100, 99);
        assert!(matches!(
            index.record(&wrong),
            Err(TsKitError::ReverseIndexMismatch(0))
        ));
    }

    #[test]
    fn reverse_walk_at_freq_1_replays_backwards() {
        let index = build_h262_index(&[
            PictureKind::SequenceHeader,
            PictureKind::I,
            PictureKind::P,
            PictureKind::P,
        ]);
        let mut walk = index.reverse_walk(None, 1);
        let emitted: Vec<usize> = std::iter::from_fn(|| {
            walk.next_step(&index, false).map(|s| s.entry)
        })
        .collect();
        assert_eq!(emitted, vec![3, 2, 1]);
    }

    #[test]
    fn forward_then_reverse_round_trip() {
        // §8: N reference pictures forward, reverse at frequency 1
        // yields the same pictures in reverse order
        let kinds = [
            PictureKind::SequenceHeader,
            PictureKind::I,
            PictureKind::P,
            PictureKind::P,
            PictureKind::P,
        ];
        let index = build_h262_index(&kinds);
        let mut walk = index.reverse_walk(None, 1);
        let mut emitted = Vec::new();
        while let Some(step) = walk.next_step(&index, false) {
            assert_eq!(step.repeats, 0);
            emitted.push(index.entry(step.entry).unwrap().start);
        }
        let mut forward: Vec<EsPosition> = index
            .entries()
            .iter()
            .filter(|e| !e.kind.is_sequence_header())
            .map(|e| e.start)
            .collect();
        forward.reverse();
        assert_eq!(emitted, forward);
    }

    #[test]
    fn reverse_walk_at_freq_2_skips_and_repeats() {
        let index = build_h262_index(&[
            PictureKind::I,
            PictureKind::P,
            PictureKind::P,
            PictureKind::P,
        ]);
        let mut walk = index.reverse_walk(None, 2);
        let steps: Vec<ReverseStep> = std::iter::from_fn(|| walk.next_step(&index, false)).collect();
        // every other picture kept: entries 2 and 0
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].entry, 2);
        assert_eq!(steps[1].entry, 0);
    }

    #[test]
    fn sequence_headers_attach_once_per_change() {
        let index = build_h262_index(&[
            PictureKind::SequenceHeader,
            PictureKind::I,
            PictureKind::P,
        ]);
        let mut walk = index.reverse_walk(None, 1);
        let first = walk.next_step(&index, true).unwrap();
        assert_eq!(first.entry, 2);
        assert_eq!(first.seq_header, Some(0));
        let second = walk.next_step(&index, true).unwrap();
        assert_eq!(second.entry, 1);
        // same governing header: not re-emitted
        assert_eq!(second.seq_header, None);
    }

    #[test]
    fn walk_backs_over_terminal_sequence_headers() {
        let index = build_h262_index(&[
            PictureKind::I,
            PictureKind::P,
            PictureKind::SequenceHeader,
        ]);
        let mut walk = index.reverse_walk(None, 1);
        assert_eq!(walk.next_step(&index, false).unwrap().entry, 1);
    }

    #[test]
    fn nth_picture_back_skips_sequence_headers() {
        let index = build_h262_index(&[
            PictureKind::SequenceHeader,
            PictureKind::I,
            PictureKind::P,
            PictureKind::SequenceHeader,
            PictureKind::I,
        ]);
        assert_eq!(index.nth_picture_back(index.len(), 1), Some(4));
        assert_eq!(index.nth_picture_back(index.len(), 2), Some(2));
        assert_eq!(index.nth_picture_back(index.len(), 3), Some(1));
        assert_eq!(index.nth_picture_back(index.len(), 4), None);
    }

    #[test]
    fn cursor_moves_with_recording_and_walks() {
        let mut index = build_h262_index(&[PictureKind::I, PictureKind::P, PictureKind::P]);
        assert_eq!(index.cursor(), 3);
        index.set_cursor(1);
        assert_eq!(index.cursor(), 1);
        // forward replay from entry 1 confirms in place
        index
            .record(&picture(PictureKind::P, 200, 50))
            .unwrap();
        assert_eq!(index.cursor(), 2);
        assert_eq!(index.len(), 3);
    }
}
