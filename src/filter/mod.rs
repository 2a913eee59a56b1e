//! # Picture filter for fast forward
//!
//! Selects which forward-play pictures to emit in the fast modes: all
//! reference pictures (fast) or intra pictures only (faster), one keeper
//! per `freq` eligible pictures. When keepers land further apart than
//! the frequency step, the keeper is repeat-emitted so the perceived
//! rate holds. The filter is pure selection; reading, recording and
//! emission stay with the caller, which checks for command interrupts
//! between pictures.

use crate::codec::{Picture, PictureKind};

/// What the fast modes keep.
#[derive(Debug, Clone, Copy)]
pub struct FilterSpec {
    /// Keep only intra pictures (I/IDR); otherwise all reference
    /// pictures
    pub intra_only: bool,
    /// Keep one picture per this many eligible pictures
    pub freq: u32,
    /// Emit the governing sequence header before a keeper (H.262)
    pub with_seq_headers: bool,
}

/// A filter decision for one offered picture.
#[derive(Debug)]
pub enum FilterDecision {
    /// Emit this picture now, `1 + repeats` times, optionally preceded
    /// by its sequence header
    Keep {
        /// Sequence header to emit first, when one is due
        seq_header: Option<Picture>,
        /// Extra emissions to hold the perceived rate
        repeats: u32,
    },
    /// Do not emit
    Skip,
}

/// Stateful keep/skip selection over the forward picture sequence.
pub struct PictureFilter {
    spec: FilterSpec,
    gap: u32,
    /// Sequence header seen since the last keeper
    pending_seq_header: Option<Picture>,
    /// Avoid re-emitting an unchanged sequence header
    last_header_start: Option<crate::format::pes::EsPosition>,
}

impl PictureFilter {
    /// Creates a filter; a frequency of zero behaves as one.
    pub fn new(spec: FilterSpec) -> Self {
        Self {
            spec: FilterSpec {
                freq: spec.freq.max(1),
                ..spec
            },
            gap: 0,
            pending_seq_header: None,
            last_header_start: None,
        }
    }

    fn eligible(&self, kind: PictureKind) -> bool {
        if self.spec.intra_only {
            kind.is_intra()
        } else {
            kind.is_reference()
        }
    }

    /// Offers the next forward picture and returns what to do with it.
    pub fn offer(&mut self, picture: &Picture) -> FilterDecision {
        if picture.kind.is_sequence_header() {
            if self.spec.with_seq_headers {
                self.pending_seq_header = Some(picture.clone());
            }
            return FilterDecision::Skip;
        }
        if !self.eligible(picture.kind) {
            return FilterDecision::Skip;
        }

        self.gap += 1;
        if self.gap < self.spec.freq {
            return FilterDecision::Skip;
        }
        let repeats = (self.gap / self.spec.freq).saturating_sub(1);
        self.gap = 0;

        let seq_header = match self.pending_seq_header.take() {
            Some(header) if self.last_header_start != Some(header.start) => {
                self.last_header_start = Some(header.start);
                Some(header)
            }
            _ => None,
        };

        FilterDecision::Keep {
            seq_header,
            repeats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::pes::EsPosition;
    use bytes::Bytes;

    fn picture(kind: PictureKind, infile: u64) -> Picture {
        Picture {
            kind,
            start: EsPosition {
                infile,
                inpacket: 9,
            },
            byte_len: 10,
            afd: None,
            data: Bytes::new(),
            index: 0,
        }
    }

    fn kept(filter: &mut PictureFilter, kinds: &[PictureKind]) -> Vec<usize> {
        let mut out = Vec::new();
        for (i, &kind) in kinds.iter().enumerate() {
            if matches!(
                filter.offer(&picture(kind, i as u64 * 100)),
                FilterDecision::Keep { .. }
            ) {
                out.push(i);
            }
        }
        out
    }

    #[test]
    fn reference_filter_keeps_i_and_p() {
        let mut filter = PictureFilter::new(FilterSpec {
            intra_only: false,
            freq: 1,
            with_seq_headers: false,
        });
        let kinds = [
            PictureKind::I,
            PictureKind::B,
            PictureKind::P,
            PictureKind::B,
            PictureKind::P,
        ];
        assert_eq!(kept(&mut filter, &kinds), vec![0, 2, 4]);
    }

    #[test]
    fn intra_filter_keeps_only_i() {
        let mut filter = PictureFilter::new(FilterSpec {
            intra_only: true,
            freq: 1,
            with_seq_headers: false,
        });
        let kinds = [
            PictureKind::I,
            PictureKind::P,
            PictureKind::B,
            PictureKind::I,
        ];
        assert_eq!(kept(&mut filter, &kinds), vec![0, 3]);
    }

    #[test]
    fn frequency_thins_keepers() {
        let mut filter = PictureFilter::new(FilterSpec {
            intra_only: false,
            freq: 2,
            with_seq_headers: false,
        });
        let kinds = [PictureKind::P; 6];
        assert_eq!(kept(&mut filter, &kinds), vec![1, 3, 5]);
    }

    #[test]
    fn sequence_header_attaches_to_next_keeper() {
        let mut filter = PictureFilter::new(FilterSpec {
            intra_only: true,
            freq: 1,
            with_seq_headers: true,
        });
        assert!(matches!(
            filter.offer(&picture(PictureKind::SequenceHeader, 0)),
            FilterDecision::Skip
        ));
        match filter.offer(&picture(PictureKind::I, 100)) {
            FilterDecision::Keep { seq_header, .. } => {
                assert_eq!(seq_header.unwrap().start.infile, 0)
            }
            other => panic!("expected keep, got {:?}", other),
        }
        // the same header is not attached twice
        match filter.offer(&picture(PictureKind::I, 200)) {
            FilterDecision::Keep { seq_header, .. } => assert!(seq_header.is_none()),
            other => panic!("expected keep, got {:?}", other),
        }
    }

    #[test]
    fn idr_counts_as_intra() {
        let mut filter = PictureFilter::new(FilterSpec {
            intra_only: true,
            freq: 1,
            with_seq_headers: false,
        });
        let kinds = [PictureKind::Idr, PictureKind::NonIdrRef, PictureKind::NonRef];
        assert_eq!(kept(&mut filter, &kinds), vec![0]);
    }
}
